use std::collections::HashMap;

use ash::prelude::VkResult;

use super::entries::{ChildEntry, DescriptorPoolEntry, DescriptorSetEntry, RegistryState};
use super::Registry;
use crate::driver::{
    DescriptorImageWrite, DescriptorPoolCreateInfo, DescriptorSetLayoutCreateInfo, FramebufferCreateInfo,
    HostDriver, HostHandle, PipelineCacheCreateInfo, PipelineCreateInfo, RenderPassCreateInfo,
    ShaderModuleCreateInfo,
};
use crate::error::{fatal, HostError, HostResult};
use crate::handle::{BoxedHandle, HandleKind};

/// Map for a category whose entries carry nothing beyond ownership.
fn child_map(state: &mut RegistryState, kind: HandleKind) -> &mut HashMap<HostHandle, ChildEntry> {
    match kind {
        HandleKind::DescriptorSetLayout => &mut state.descriptor_set_layouts,
        HandleKind::ShaderModule => &mut state.shader_modules,
        HandleKind::PipelineCache => &mut state.pipeline_caches,
        HandleKind::Pipeline => &mut state.pipelines,
        HandleKind::RenderPass => &mut state.render_passes,
        HandleKind::Framebuffer => &mut state.framebuffers,
        other => fatal!(kind = ?other, "no plain registry map for this kind"),
    }
}

impl Registry {
    fn create_child(
        &self,
        device: BoxedHandle,
        kind: HandleKind,
        create: impl FnOnce(&dyn HostDriver, HostHandle) -> VkResult<HostHandle>,
    ) -> HostResult<BoxedHandle> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let mut state = self.lock();
        let object = create(dispatch.driver(), host_device)?;
        let boxed = self.box_child(kind, object, &dispatch);
        child_map(&mut state, kind).insert(
            object,
            ChildEntry {
                boxed,
                device: host_device,
            },
        );
        Ok(boxed)
    }

    fn destroy_child(
        &self,
        device: BoxedHandle,
        handle: BoxedHandle,
        kind: HandleKind,
        destroy: impl FnOnce(&dyn HostDriver, HostHandle, HostHandle),
    ) -> HostResult<()> {
        if handle.is_null() {
            return Ok(());
        }
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let object = self.resolve(handle, kind)?;
        let mut state = self.lock();
        let map = child_map(&mut state, kind);
        match map.get(&object) {
            Some(entry) if entry.device != host_device => {
                return Err(HostError::InvalidArgument("object belongs to a different device"));
            }
            Some(_) => {}
            None => return Err(Self::stale(handle, kind)),
        }
        map.remove(&object);
        self.unbox_removed(handle);
        destroy(dispatch.driver(), host_device, object);
        Ok(())
    }

    pub fn create_descriptor_set_layout(
        &self,
        device: BoxedHandle,
        info: &DescriptorSetLayoutCreateInfo,
    ) -> HostResult<BoxedHandle> {
        self.create_child(device, HandleKind::DescriptorSetLayout, |driver, dev| {
            driver.create_descriptor_set_layout(dev, info)
        })
    }

    pub fn destroy_descriptor_set_layout(&self, device: BoxedHandle, layout: BoxedHandle) -> HostResult<()> {
        self.destroy_child(device, layout, HandleKind::DescriptorSetLayout, |driver, dev, obj| {
            driver.destroy_descriptor_set_layout(dev, obj)
        })
    }

    pub fn create_descriptor_pool(
        &self,
        device: BoxedHandle,
        info: &DescriptorPoolCreateInfo,
    ) -> HostResult<BoxedHandle> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let mut state = self.lock();
        let pool = dispatch.driver().create_descriptor_pool(host_device, info)?;
        let boxed = self.box_child(HandleKind::DescriptorPool, pool, &dispatch);
        state.descriptor_pools.insert(
            pool,
            DescriptorPoolEntry {
                boxed,
                device: host_device,
                sets: Vec::new(),
            },
        );
        Ok(boxed)
    }

    /// Forget every set allocated from `pool`; the host frees them with the pool.
    fn forget_pool_sets_locked(&self, state: &mut RegistryState, pool: HostHandle) {
        let sets = match state.descriptor_pools.get_mut(&pool) {
            Some(entry) => std::mem::take(&mut entry.sets),
            None => return,
        };
        for set in sets {
            if let Some(entry) = state.descriptor_sets.remove(&set) {
                self.unbox_removed(entry.boxed);
            }
        }
    }

    fn checked_descriptor_pool(
        &self,
        state: &RegistryState,
        pool: BoxedHandle,
        host_pool: HostHandle,
        host_device: HostHandle,
    ) -> HostResult<()> {
        match state.descriptor_pools.get(&host_pool) {
            Some(entry) if entry.device == host_device => Ok(()),
            Some(_) => Err(HostError::InvalidArgument("object belongs to a different device")),
            None => Err(Self::stale(pool, HandleKind::DescriptorPool)),
        }
    }

    pub fn destroy_descriptor_pool(&self, device: BoxedHandle, pool: BoxedHandle) -> HostResult<()> {
        if pool.is_null() {
            return Ok(());
        }
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host = self.resolve(pool, HandleKind::DescriptorPool)?;
        let mut state = self.lock();
        self.checked_descriptor_pool(&state, pool, host, host_device)?;
        self.forget_pool_sets_locked(&mut state, host);
        if let Some(entry) = state.descriptor_pools.remove(&host) {
            self.unbox_removed(entry.boxed);
        }
        dispatch.driver().destroy_descriptor_pool(host_device, host);
        Ok(())
    }

    pub fn reset_descriptor_pool(&self, device: BoxedHandle, pool: BoxedHandle) -> HostResult<()> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host = self.resolve(pool, HandleKind::DescriptorPool)?;
        let mut state = self.lock();
        self.checked_descriptor_pool(&state, pool, host, host_device)?;
        dispatch.driver().reset_descriptor_pool(host_device, host)?;
        self.forget_pool_sets_locked(&mut state, host);
        Ok(())
    }

    pub fn allocate_descriptor_sets(
        &self,
        device: BoxedHandle,
        pool: BoxedHandle,
        layouts: &[BoxedHandle],
    ) -> HostResult<Vec<BoxedHandle>> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host_pool = self.resolve(pool, HandleKind::DescriptorPool)?;
        let host_layouts = layouts
            .iter()
            .map(|&l| self.resolve(l, HandleKind::DescriptorSetLayout))
            .collect::<HostResult<Vec<_>>>()?;

        let mut state = self.lock();
        self.checked_descriptor_pool(&state, pool, host_pool, host_device)?;
        let sets = dispatch
            .driver()
            .allocate_descriptor_sets(host_device, host_pool, &host_layouts)?;

        let mut boxed = Vec::with_capacity(sets.len());
        for &set in &sets {
            let handle = self.box_child(HandleKind::DescriptorSet, set, &dispatch);
            state.descriptor_sets.insert(
                set,
                DescriptorSetEntry {
                    boxed: handle,
                    device: host_device,
                    pool: host_pool,
                },
            );
            boxed.push(handle);
        }
        if let Some(entry) = state.descriptor_pools.get_mut(&host_pool) {
            entry.sets.extend_from_slice(&sets);
        }
        Ok(boxed)
    }

    pub fn free_descriptor_sets(
        &self,
        device: BoxedHandle,
        pool: BoxedHandle,
        sets: &[BoxedHandle],
    ) -> HostResult<()> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host_pool = self.resolve(pool, HandleKind::DescriptorPool)?;
        let guest_sets: Vec<BoxedHandle> = sets.iter().copied().filter(|s| !s.is_null()).collect();
        let host_sets = guest_sets
            .iter()
            .map(|&s| self.resolve(s, HandleKind::DescriptorSet))
            .collect::<HostResult<Vec<_>>>()?;

        let mut state = self.lock();
        self.checked_descriptor_pool(&state, pool, host_pool, host_device)?;
        for (&guest, set) in guest_sets.iter().zip(&host_sets) {
            match state.descriptor_sets.get(set) {
                Some(entry) if entry.pool == host_pool => {}
                Some(_) => return Err(HostError::InvalidArgument("descriptor set is from another pool")),
                None => return Err(Self::stale(guest, HandleKind::DescriptorSet)),
            }
        }
        for set in &host_sets {
            if let Some(entry) = state.descriptor_sets.remove(set) {
                self.unbox_removed(entry.boxed);
            }
        }
        if let Some(entry) = state.descriptor_pools.get_mut(&host_pool) {
            entry.sets.retain(|s| !host_sets.contains(s));
        }
        dispatch
            .driver()
            .free_descriptor_sets(host_device, host_pool, &host_sets);
        Ok(())
    }

    /// Apply image descriptor writes.
    ///
    /// A write pairing a view that synthesizes alpha with a sampler that can show a transparent
    /// border binds the sampler's opaque-border twin instead.
    pub fn update_descriptor_sets(
        &self,
        device: BoxedHandle,
        writes: &[DescriptorImageWrite<BoxedHandle>],
    ) -> HostResult<()> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let driver = dispatch.driver();
        let mut state = self.lock();

        let mut host_writes = Vec::with_capacity(writes.len());
        for write in writes {
            let dst_set = self.resolve(write.dst_set, HandleKind::DescriptorSet)?;
            let image_view = self.resolve_optional(write.image_view, HandleKind::ImageView)?;
            let mut sampler = self.resolve_optional(write.sampler, HandleKind::Sampler)?;

            let emulated_alpha = !image_view.is_null()
                && state
                    .image_views
                    .get(&image_view)
                    .is_some_and(|view| view.needs_emulated_alpha);
            if emulated_alpha && !sampler.is_null() {
                sampler = Self::alpha_sampler_locked(&mut state, driver, host_device, write.sampler, sampler)?;
            }

            host_writes.push(DescriptorImageWrite {
                dst_set,
                binding: write.binding,
                array_element: write.array_element,
                descriptor_type: write.descriptor_type,
                sampler,
                image_view,
                image_layout: write.image_layout,
            });
        }
        driver.update_descriptor_sets(host_device, &host_writes);
        Ok(())
    }

    pub fn create_shader_module(&self, device: BoxedHandle, info: &ShaderModuleCreateInfo) -> HostResult<BoxedHandle> {
        if info.code.is_empty() {
            return Err(HostError::InvalidArgument("empty shader module"));
        }
        self.create_child(device, HandleKind::ShaderModule, |driver, dev| {
            driver.create_shader_module(dev, info)
        })
    }

    pub fn destroy_shader_module(&self, device: BoxedHandle, module: BoxedHandle) -> HostResult<()> {
        self.destroy_child(device, module, HandleKind::ShaderModule, |driver, dev, obj| {
            driver.destroy_shader_module(dev, obj)
        })
    }

    pub fn create_pipeline_cache(&self, device: BoxedHandle, info: &PipelineCacheCreateInfo) -> HostResult<BoxedHandle> {
        self.create_child(device, HandleKind::PipelineCache, |driver, dev| {
            driver.create_pipeline_cache(dev, info)
        })
    }

    pub fn destroy_pipeline_cache(&self, device: BoxedHandle, cache: BoxedHandle) -> HostResult<()> {
        self.destroy_child(device, cache, HandleKind::PipelineCache, |driver, dev, obj| {
            driver.destroy_pipeline_cache(dev, obj)
        })
    }

    pub fn create_pipeline(
        &self,
        device: BoxedHandle,
        cache: BoxedHandle,
        info: &PipelineCreateInfo<BoxedHandle>,
    ) -> HostResult<BoxedHandle> {
        let host_cache = self.resolve_optional(cache, HandleKind::PipelineCache)?;
        let host_info = PipelineCreateInfo {
            bind_point: info.bind_point,
            shader_modules: info
                .shader_modules
                .iter()
                .map(|&m| self.resolve(m, HandleKind::ShaderModule))
                .collect::<HostResult<Vec<_>>>()?,
            render_pass: self.resolve_optional(info.render_pass, HandleKind::RenderPass)?,
            subpass: info.subpass,
        };
        self.create_child(device, HandleKind::Pipeline, |driver, dev| {
            driver.create_pipeline(dev, host_cache, &host_info)
        })
    }

    pub fn destroy_pipeline(&self, device: BoxedHandle, pipeline: BoxedHandle) -> HostResult<()> {
        self.destroy_child(device, pipeline, HandleKind::Pipeline, |driver, dev, obj| {
            driver.destroy_pipeline(dev, obj)
        })
    }

    pub fn create_render_pass(&self, device: BoxedHandle, info: &RenderPassCreateInfo) -> HostResult<BoxedHandle> {
        self.create_child(device, HandleKind::RenderPass, |driver, dev| {
            driver.create_render_pass(dev, info)
        })
    }

    pub fn destroy_render_pass(&self, device: BoxedHandle, render_pass: BoxedHandle) -> HostResult<()> {
        self.destroy_child(device, render_pass, HandleKind::RenderPass, |driver, dev, obj| {
            driver.destroy_render_pass(dev, obj)
        })
    }

    pub fn create_framebuffer(
        &self,
        device: BoxedHandle,
        info: &FramebufferCreateInfo<BoxedHandle>,
    ) -> HostResult<BoxedHandle> {
        let host_info = FramebufferCreateInfo {
            render_pass: self.resolve(info.render_pass, HandleKind::RenderPass)?,
            attachments: info
                .attachments
                .iter()
                .map(|&a| self.resolve(a, HandleKind::ImageView))
                .collect::<HostResult<Vec<_>>>()?,
            width: info.width,
            height: info.height,
            layers: info.layers,
        };
        self.create_child(device, HandleKind::Framebuffer, |driver, dev| {
            driver.create_framebuffer(dev, &host_info)
        })
    }

    pub fn destroy_framebuffer(&self, device: BoxedHandle, framebuffer: BoxedHandle) -> HostResult<()> {
        self.destroy_child(device, framebuffer, HandleKind::Framebuffer, |driver, dev, obj| {
            driver.destroy_framebuffer(dev, obj)
        })
    }
}

#[cfg(test)]
mod tests {
    use ash::vk;
    use pretty_assertions::assert_eq;

    use super::super::tests::registry_with;
    use super::*;
    use crate::driver::{
        DescriptorSetLayoutBinding, DeviceCreateInfo, DriverCall, ImageCreateInfo, ImageViewCreateInfo,
        SamplerCreateInfo, SoftHostDriver,
    };

    fn device(registry: &Registry) -> BoxedHandle {
        let instance = registry.create_instance(&Default::default()).unwrap();
        let pd = registry.enumerate_physical_devices(instance).unwrap()[0];
        registry.create_device(pd, &DeviceCreateInfo::default()).unwrap()
    }

    fn set(registry: &Registry, device: BoxedHandle) -> (BoxedHandle, BoxedHandle) {
        let layout = registry
            .create_descriptor_set_layout(
                device,
                &DescriptorSetLayoutCreateInfo {
                    bindings: vec![DescriptorSetLayoutBinding {
                        binding: 0,
                        descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                        descriptor_count: 1,
                    }],
                },
            )
            .unwrap();
        let pool = registry
            .create_descriptor_pool(
                device,
                &DescriptorPoolCreateInfo {
                    max_sets: 4,
                    pool_sizes: vec![(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4)],
                    free_descriptor_set: true,
                },
            )
            .unwrap();
        let sets = registry.allocate_descriptor_sets(device, pool, &[layout]).unwrap();
        (pool, sets[0])
    }

    fn written_samplers(driver: &SoftHostDriver) -> Vec<HostHandle> {
        driver
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                DriverCall::UpdateDescriptorSets(writes) => Some(writes),
                _ => None,
            })
            .flatten()
            .map(|w| w.sampler)
            .collect()
    }

    #[test]
    fn emulated_alpha_view_gets_opaque_sampler() {
        let (driver, registry) = registry_with(SoftHostDriver::new().without_compressed_textures());
        let device = device(&registry);
        let (_pool, set) = set(&registry, device);

        let image = registry
            .create_image(device, &ImageCreateInfo::new_2d(vk::Format::ETC2_R8G8B8_SRGB_BLOCK, 16, 16))
            .unwrap();
        let view = registry
            .create_image_view(device, image, &ImageViewCreateInfo::new_2d(vk::Format::ETC2_R8G8B8_SRGB_BLOCK))
            .unwrap();
        let sampler = registry.create_sampler(device, &SamplerCreateInfo::default()).unwrap();
        let host_sampler = registry.handles().unbox(sampler).unwrap();

        let write = DescriptorImageWrite {
            dst_set: set,
            binding: 0,
            array_element: 0,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            sampler,
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        };
        driver.clear_calls();
        registry.update_descriptor_sets(device, &[write, write]).unwrap();

        let samplers = written_samplers(&driver);
        assert_eq!(samplers.len(), 2);
        assert_eq!(samplers[0], samplers[1], "twin is created once and reused");
        assert_ne!(samplers[0], host_sampler);
        let twin = driver.sampler_info(samplers[0]).unwrap();
        assert_eq!(twin.border_color, vk::BorderColor::FLOAT_OPAQUE_BLACK);

        registry.destroy_sampler(device, sampler).unwrap();
        assert!(!driver.is_live(samplers[0]));
    }

    #[test]
    fn native_view_keeps_its_sampler() {
        let (driver, registry) = registry_with(SoftHostDriver::new());
        let device = device(&registry);
        let (_pool, set) = set(&registry, device);
        let image = registry
            .create_image(device, &ImageCreateInfo::new_2d(vk::Format::R8G8B8A8_UNORM, 16, 16))
            .unwrap();
        let view = registry
            .create_image_view(device, image, &ImageViewCreateInfo::new_2d(vk::Format::R8G8B8A8_UNORM))
            .unwrap();
        let sampler = registry.create_sampler(device, &SamplerCreateInfo::default()).unwrap();

        driver.clear_calls();
        registry
            .update_descriptor_sets(
                device,
                &[DescriptorImageWrite {
                    dst_set: set,
                    binding: 0,
                    array_element: 0,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    sampler,
                    image_view: view,
                    image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                }],
            )
            .unwrap();
        assert_eq!(
            written_samplers(&driver),
            vec![registry.handles().unbox(sampler).unwrap()]
        );
    }

    #[test]
    fn destroying_pool_invalidates_its_sets() {
        let (driver, registry) = registry_with(SoftHostDriver::new());
        let device = device(&registry);
        let (pool, set) = set(&registry, device);
        registry.destroy_descriptor_pool(device, pool).unwrap();
        assert_eq!(registry.handles().unbox(set), None);
        assert_eq!(driver.live_objects(HandleKind::DescriptorSet), 0);
    }

    #[test]
    fn pipelines_resolve_their_modules() {
        let (_driver, registry) = registry_with(SoftHostDriver::new());
        let device = device(&registry);
        let module = registry
            .create_shader_module(device, &ShaderModuleCreateInfo { code: vec![0x0723_0203] })
            .unwrap();
        let info = PipelineCreateInfo {
            bind_point: vk::PipelineBindPoint::COMPUTE,
            shader_modules: vec![module],
            render_pass: BoxedHandle::NULL,
            subpass: 0,
        };
        let pipeline = registry.create_pipeline(device, BoxedHandle::NULL, &info).unwrap();
        registry.destroy_shader_module(device, module).unwrap();
        assert!(matches!(
            registry.create_pipeline(device, BoxedHandle::NULL, &info),
            Err(HostError::InvalidHandle { .. })
        ));
        registry.destroy_pipeline(device, pipeline).unwrap();
    }
}
