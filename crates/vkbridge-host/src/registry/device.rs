use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::entries::{
    drain_device_children, DeviceEntry, InstanceEntry, PhysicalDeviceEntry, QueueEntry, RegistryState,
};
use super::{ExternalFencePool, Registry};
use crate::driver::{
    DeviceCreateInfo, DeviceFeatures, DispatchLevel, DispatchTable, FormatProperties, HostDriver,
    HostHandle, InstanceCreateInfo, QueueFamilyProperties,
};
use crate::emulation::DeviceEmulation;
use crate::error::{fatal, HostError, HostResult};
use crate::handle::{BoxedHandle, HandleKind, OrderLedger};

/// Keep only the extensions in `supported`, logging the rest.
fn filter_extensions(requested: &[String], supported: &[String], level: &'static str) -> Vec<String> {
    requested
        .iter()
        .filter(|ext| {
            let keep = supported.contains(ext);
            if !keep {
                debug!(level, extension = %ext, "dropping extension the host does not provide");
            }
            keep
        })
        .cloned()
        .collect()
}

impl Registry {
    pub fn create_instance(&self, info: &InstanceCreateInfo) -> HostResult<BoxedHandle> {
        let filtered = InstanceCreateInfo {
            enabled_extensions: filter_extensions(
                &info.enabled_extensions,
                &self.driver.instance_extensions(),
                "instance",
            ),
            ..info.clone()
        };
        let instance = self.driver.create_instance(&filtered)?;
        let dispatch = DispatchTable::new(DispatchLevel::Instance, Arc::clone(&self.driver));

        let mut state = self.lock();
        let boxed = self
            .handles
            .box_object(HandleKind::Instance, instance, Arc::clone(&dispatch), true, None);
        state.instances.insert(
            instance,
            InstanceEntry {
                boxed,
                dispatch,
                physical_devices: Vec::new(),
            },
        );
        info!(?boxed, application = %info.application_name, "instance created");
        Ok(boxed)
    }

    /// Destroy `instance` and anything still created from it.
    pub fn destroy_instance(&self, instance: BoxedHandle) -> HostResult<()> {
        if instance.is_null() {
            return Ok(());
        }
        let host = self.resolve(instance, HandleKind::Instance)?;

        let mut devices: Vec<HostHandle> = {
            let state = self.lock();
            state
                .devices
                .iter()
                .filter(|(_, entry)| entry.instance == host)
                .map(|(&device, _)| device)
                .collect()
        };
        devices.sort_unstable();
        for device in devices {
            self.wait_idle_before_teardown(device);
            let mut state = self.lock();
            if state.devices.contains_key(&device) {
                warn!(?instance, ?device, "instance destroyed with a live device");
                self.destroy_device_locked(&mut state, device);
            }
        }

        let mut state = self.lock();
        let Some(entry) = state.instances.remove(&host) else {
            return Err(Self::stale(instance, HandleKind::Instance));
        };
        for physical in &entry.physical_devices {
            if let Some(pd) = state.physical_devices.remove(physical) {
                self.unbox_removed(pd.boxed);
            }
        }
        // Physical devices go away with the instance on the host side.
        entry.dispatch.driver().destroy_instance(host);
        self.unbox_removed(entry.boxed);
        info!(?instance, "instance destroyed");
        Ok(())
    }

    /// Physical devices of `instance`. Repeated calls return the same handles.
    pub fn enumerate_physical_devices(&self, instance: BoxedHandle) -> HostResult<Vec<BoxedHandle>> {
        let record = self.resolve_record(instance, HandleKind::Instance)?;
        let host = record.object();
        let dispatch = Arc::clone(record.dispatch());
        let physical = dispatch.driver().enumerate_physical_devices(host)?;

        let mut state = self.lock();
        let mut boxed = Vec::with_capacity(physical.len());
        for pd in physical {
            if let Some(existing) = state.physical_devices.get(&pd) {
                boxed.push(existing.boxed);
                continue;
            }
            let emulation = DeviceEmulation::compute(dispatch.driver(), pd, &self.config);
            let handle = self
                .handles
                .box_object(HandleKind::PhysicalDevice, pd, Arc::clone(&dispatch), false, None);
            state.physical_devices.insert(
                pd,
                PhysicalDeviceEntry {
                    boxed: handle,
                    instance: host,
                    emulation,
                },
            );
            match state.instances.get_mut(&host) {
                Some(entry) => entry.physical_devices.push(pd),
                None => return Err(Self::stale(instance, HandleKind::Instance)),
            }
            boxed.push(handle);
        }
        Ok(boxed)
    }

    fn physical_device_emulation(&self, physical_device: BoxedHandle) -> HostResult<(HostHandle, DeviceEmulation)> {
        let host = self.resolve(physical_device, HandleKind::PhysicalDevice)?;
        let state = self.lock();
        match state.physical_devices.get(&host) {
            Some(entry) => Ok((host, entry.emulation)),
            None => return Err(Self::stale(physical_device, HandleKind::PhysicalDevice)),
        }
    }

    /// Features as the guest sees them, emulated compression families included.
    pub fn physical_device_features(&self, physical_device: BoxedHandle) -> HostResult<DeviceFeatures> {
        let (host, emulation) = self.physical_device_emulation(physical_device)?;
        Ok(emulation.advertised_features(self.driver.physical_device_features(host)))
    }

    pub fn physical_device_format_properties(
        &self,
        physical_device: BoxedHandle,
        format: ash::vk::Format,
    ) -> HostResult<FormatProperties> {
        let (host, emulation) = self.physical_device_emulation(physical_device)?;
        Ok(emulation.format_properties(self.driver.as_ref(), host, format))
    }

    pub fn physical_device_queue_families(
        &self,
        physical_device: BoxedHandle,
    ) -> HostResult<Vec<QueueFamilyProperties>> {
        let host = self.resolve(physical_device, HandleKind::PhysicalDevice)?;
        Ok(self.driver.physical_device_queue_families(host))
    }

    pub fn device_extensions(&self, physical_device: BoxedHandle) -> HostResult<Vec<String>> {
        let host = self.resolve(physical_device, HandleKind::PhysicalDevice)?;
        Ok(self.driver.device_extensions(host))
    }

    pub fn create_device(&self, physical_device: BoxedHandle, info: &DeviceCreateInfo) -> HostResult<BoxedHandle> {
        let (physical, emulation) = self.physical_device_emulation(physical_device)?;
        let instance = {
            let state = self.lock();
            state
                .physical_devices
                .get(&physical)
                .map(|entry| entry.instance)
                .unwrap_or(HostHandle::NULL)
        };

        let filtered = DeviceCreateInfo {
            queue_create_infos: info.queue_create_infos.clone(),
            enabled_extensions: filter_extensions(
                &info.enabled_extensions,
                &self.driver.device_extensions(physical),
                "device",
            ),
            enabled_features: emulation.filter_requested_features(info.enabled_features),
        };
        let device = self.driver.create_device(physical, &filtered)?;
        let dispatch = DispatchTable::new(DispatchLevel::Device, Arc::clone(&self.driver));

        let mut state = self.lock();
        let boxed = self
            .handles
            .box_object(HandleKind::Device, device, Arc::clone(&dispatch), true, None);

        let mut queues: HashMap<u32, Vec<HostHandle>> = HashMap::new();
        for request in &filtered.queue_create_infos {
            for index in 0..request.queue_count {
                let queue = dispatch.driver().get_device_queue(device, request.family_index, index);
                let queue_boxed = self.handles.box_object(
                    HandleKind::Queue,
                    queue,
                    Arc::clone(&dispatch),
                    false,
                    Some(OrderLedger::new()),
                );
                state.queues.insert(
                    queue,
                    QueueEntry {
                        boxed: queue_boxed,
                        device,
                        family_index: request.family_index,
                        submit_lock: Arc::new(Mutex::new(())),
                    },
                );
                queues.entry(request.family_index).or_default().push(queue);
            }
        }

        state.devices.insert(
            device,
            DeviceEntry {
                boxed,
                instance,
                fence_pool: Arc::new(ExternalFencePool::new(Arc::clone(&dispatch), device)),
                dispatch,
                emulation,
                queues,
            },
        );
        info!(?boxed, emulation = ?emulation.flags(), "device created");
        Ok(boxed)
    }

    /// Queue `queue_index` of `family_index`, which must have been requested at device creation.
    pub fn get_device_queue(&self, device: BoxedHandle, family_index: u32, queue_index: u32) -> HostResult<BoxedHandle> {
        let host = self.resolve(device, HandleKind::Device)?;
        let state = self.lock();
        let Some(entry) = state.devices.get(&host) else {
            return Err(Self::stale(device, HandleKind::Device));
        };
        let queue = entry
            .queues
            .get(&family_index)
            .and_then(|queues| queues.get(queue_index as usize))
            .ok_or(HostError::InvalidArgument("queue was not requested at device creation"))?;
        match state.queues.get(queue) {
            Some(q) => Ok(q.boxed),
            None => fatal!(?device, ?queue, "device queue without registry entry"),
        }
    }

    pub fn device_wait_idle(&self, device: BoxedHandle) -> HostResult<()> {
        let (host, dispatch) = self.device_dispatch(device)?;
        dispatch.driver().device_wait_idle(host)?;
        self.handles.process_delayed_removals(device);
        Ok(())
    }

    pub fn destroy_device(&self, device: BoxedHandle) -> HostResult<()> {
        if device.is_null() {
            return Ok(());
        }
        let host = self.resolve(device, HandleKind::Device)?;
        self.wait_idle_before_teardown(host);
        let mut state = self.lock();
        if !state.devices.contains_key(&host) {
            return Err(HostError::InvalidHandle {
                handle: device,
                expected: HandleKind::Device,
            });
        }
        self.destroy_device_locked(&mut state, host);
        Ok(())
    }

    fn wait_idle_before_teardown(&self, device: HostHandle) {
        if let Err(err) = self.driver.device_wait_idle(device) {
            warn!(?device, ?err, "device did not go idle before teardown");
        }
    }

    /// Tear down `device` and everything it owns.
    ///
    /// Order matters to host drivers: sync objects and samplers, then images, buffers and
    /// memory, then command and descriptor pools, then pipelines, then render passes and
    /// framebuffers, then the device. The device dispatch table is released last.
    pub(super) fn destroy_device_locked(&self, state: &mut RegistryState, device: HostHandle) {
        let Some(entry) = state.devices.remove(&device) else {
            return;
        };
        let dispatch = Arc::clone(&entry.dispatch);
        let driver: &dyn HostDriver = dispatch.driver();
        debug!(device = ?entry.boxed, "tearing down device");

        // Deferred destructions may reference anything below.
        self.handles.process_delayed_removals(entry.boxed);

        for (fence, f) in drain_device_children(&mut state.fences, device) {
            self.unbox_removed(f.boxed);
            driver.destroy_fence(device, fence);
        }
        for fence in entry.fence_pool.pop_all() {
            driver.destroy_fence(device, fence);
        }
        for (semaphore, s) in drain_device_children(&mut state.semaphores, device) {
            self.unbox_removed(s.boxed);
            driver.destroy_semaphore(device, semaphore);
        }
        for (sampler, s) in drain_device_children(&mut state.samplers, device) {
            self.unbox_removed(s.boxed);
            Self::destroy_sampler_objects(driver, device, sampler, &s);
        }

        for (view, v) in drain_device_children(&mut state.image_views, device) {
            self.unbox_removed(v.boxed);
            driver.destroy_image_view(device, view);
        }
        for (image, i) in drain_device_children(&mut state.images, device) {
            self.unbox_removed(i.boxed);
            Self::destroy_image_objects(driver, device, image, i, &entry.fence_pool);
        }
        // Presentation fences released by the images above.
        for fence in entry.fence_pool.pop_all() {
            driver.destroy_fence(device, fence);
        }
        for (buffer, b) in drain_device_children(&mut state.buffers, device) {
            self.unbox_removed(b.boxed);
            driver.destroy_buffer(device, buffer);
        }
        for (memory, m) in drain_device_children(&mut state.memories, device) {
            self.unbox_removed(m.boxed);
            Self::release_memory_locked(state, driver, device, memory, &m);
        }

        for (_, cb) in drain_device_children(&mut state.command_buffers, device) {
            self.unbox_removed(cb.boxed);
        }
        for (pool, p) in drain_device_children(&mut state.command_pools, device) {
            self.unbox_removed(p.boxed);
            driver.destroy_command_pool(device, pool);
        }
        for (_, set) in drain_device_children(&mut state.descriptor_sets, device) {
            self.unbox_removed(set.boxed);
        }
        for (pool, p) in drain_device_children(&mut state.descriptor_pools, device) {
            self.unbox_removed(p.boxed);
            driver.destroy_descriptor_pool(device, pool);
        }
        for (layout, l) in drain_device_children(&mut state.descriptor_set_layouts, device) {
            self.unbox_removed(l.boxed);
            driver.destroy_descriptor_set_layout(device, layout);
        }

        for (pipeline, p) in drain_device_children(&mut state.pipelines, device) {
            self.unbox_removed(p.boxed);
            driver.destroy_pipeline(device, pipeline);
        }
        for (cache, c) in drain_device_children(&mut state.pipeline_caches, device) {
            self.unbox_removed(c.boxed);
            driver.destroy_pipeline_cache(device, cache);
        }
        for (module, m) in drain_device_children(&mut state.shader_modules, device) {
            self.unbox_removed(m.boxed);
            driver.destroy_shader_module(device, module);
        }

        for (framebuffer, f) in drain_device_children(&mut state.framebuffers, device) {
            self.unbox_removed(f.boxed);
            driver.destroy_framebuffer(device, framebuffer);
        }
        for (render_pass, r) in drain_device_children(&mut state.render_passes, device) {
            self.unbox_removed(r.boxed);
            driver.destroy_render_pass(device, render_pass);
        }

        // Anything deferred by the teardown itself.
        self.handles.process_delayed_removals(entry.boxed);

        for (_, q) in drain_device_children(&mut state.queues, device) {
            self.unbox_removed(q.boxed);
        }
        // Queues go away with the device on the host side.
        driver.destroy_device(device);
        self.unbox_removed(entry.boxed);
        info!(device = ?entry.boxed, "device destroyed");
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;

    use super::super::tests::registry_with;
    use crate::driver::{DeviceQueueCreateInfo, SoftHostDriver};
    use crate::handle::HandleKind;

    use super::*;

    fn device_info() -> DeviceCreateInfo {
        DeviceCreateInfo {
            queue_create_infos: vec![DeviceQueueCreateInfo {
                family_index: 0,
                queue_count: 2,
            }],
            enabled_extensions: vec!["VK_KHR_swapchain".into(), "VK_GOOGLE_made_up".into()],
            enabled_features: DeviceFeatures {
                texture_compression_etc2: true,
                texture_compression_astc_ldr: true,
                ..Default::default()
            },
        }
    }

    #[test]
    fn physical_devices_are_boxed_once() {
        let (_driver, registry) = registry_with(SoftHostDriver::new().with_physical_device_count(2));
        let instance = registry.create_instance(&Default::default()).unwrap();
        let first = registry.enumerate_physical_devices(instance).unwrap();
        let second = registry.enumerate_physical_devices(instance).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn emulated_features_are_advertised_and_stripped() {
        let (driver, registry) = registry_with(SoftHostDriver::new().without_compressed_textures());
        let instance = registry.create_instance(&Default::default()).unwrap();
        let pd = registry.enumerate_physical_devices(instance).unwrap()[0];

        let features = registry.physical_device_features(pd).unwrap();
        assert!(features.texture_compression_etc2);
        assert!(features.texture_compression_astc_ldr);

        let props = registry
            .physical_device_format_properties(pd, vk::Format::ETC2_R8G8B8_SRGB_BLOCK)
            .unwrap();
        assert!(props
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE));

        // The soft driver refuses compressed features it lacks, so success means they were
        // filtered out of the host request.
        let device = registry.create_device(pd, &device_info()).unwrap();
        assert_eq!(driver.live_objects(HandleKind::Device), 1);
        registry.destroy_device(device).unwrap();
    }

    #[test]
    fn queues_are_boxed_with_ledgers() {
        let (_driver, registry) = registry_with(SoftHostDriver::new());
        let instance = registry.create_instance(&Default::default()).unwrap();
        let pd = registry.enumerate_physical_devices(instance).unwrap()[0];
        let device = registry.create_device(pd, &device_info()).unwrap();

        let q0 = registry.get_device_queue(device, 0, 0).unwrap();
        let q1 = registry.get_device_queue(device, 0, 1).unwrap();
        assert_ne!(q0, q1);
        assert_eq!(registry.get_device_queue(device, 0, 0).unwrap(), q0);
        assert!(registry.get_device_queue(device, 1, 0).is_err());
        assert!(registry.handles().record(q0).unwrap().ledger().is_some());

        registry.destroy_device(device).unwrap();
        assert_eq!(registry.handles().unbox(q0), None);
        assert_eq!(registry.handles().unbox(device), None);
    }

    #[test]
    fn destroying_instance_destroys_its_devices() {
        let (driver, registry) = registry_with(SoftHostDriver::new());
        let instance = registry.create_instance(&Default::default()).unwrap();
        let pd = registry.enumerate_physical_devices(instance).unwrap()[0];
        let device = registry.create_device(pd, &device_info()).unwrap();

        registry.destroy_instance(instance).unwrap();
        assert_eq!(registry.handles().unbox(device), None);
        assert_eq!(registry.handles().unbox(pd), None);
        assert!(registry.handles().is_empty());
        assert_eq!(driver.live_objects(HandleKind::Device), 0);
        assert_eq!(driver.live_objects(HandleKind::Instance), 0);
    }
}
