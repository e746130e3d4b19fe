use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace};

use super::entries::{
    BufferEntry, EmulatedImage, GuestPhysicalMapping, ImageEntry, ImageViewEntry, MemoryEntry, RegistryState,
    SamplerEntry,
};
use super::{ExternalFencePool, Registry};
use crate::driver::{
    BufferCreateInfo, HostDriver, HostHandle, ImageCreateInfo, ImageViewCreateInfo, MemoryAllocateInfo,
    SamplerCreateInfo,
};
use crate::emulation::{shadow_image_info, shadow_size, size_compatible_image_info, CompressedFormat, EmulationDecision};
use crate::error::{HostError, HostResult};
use crate::handle::{BoxedHandle, HandleKind};

/// Samplers that can show a transparent border need an opaque twin when the sampled view
/// synthesizes its alpha channel.
fn needs_alpha_twin(info: &SamplerCreateInfo) -> bool {
    info.address_mode == vk::SamplerAddressMode::CLAMP_TO_BORDER
        && matches!(
            info.border_color,
            vk::BorderColor::FLOAT_TRANSPARENT_BLACK | vk::BorderColor::INT_TRANSPARENT_BLACK
        )
}

fn opaque_twin_info(info: &SamplerCreateInfo) -> SamplerCreateInfo {
    let border_color = match info.border_color {
        vk::BorderColor::INT_TRANSPARENT_BLACK => vk::BorderColor::INT_OPAQUE_BLACK,
        _ => vk::BorderColor::FLOAT_OPAQUE_BLACK,
    };
    SamplerCreateInfo {
        border_color,
        ..*info
    }
}

impl Registry {
    pub(super) fn check_owner(owner: HostHandle, device: HostHandle) -> HostResult<()> {
        if owner != device {
            return Err(HostError::InvalidArgument("object belongs to a different device"));
        }
        Ok(())
    }

    pub fn create_image(&self, device: BoxedHandle, info: &ImageCreateInfo) -> HostResult<BoxedHandle> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let driver = dispatch.driver();

        let mut state = self.lock();
        let decision = match state.devices.get(&host_device) {
            Some(entry) => entry.emulation.decide(info.format),
            None => return Err(Self::stale(device, HandleKind::Device)),
        };

        let (image, emulated) = match decision {
            EmulationDecision::Native => (driver.create_image(host_device, info)?, None),
            EmulationDecision::Emulated(format) => {
                let (image, emulated) = Self::create_emulated_image(driver, host_device, format, info)?;
                (image, Some(emulated))
            }
        };

        let boxed = self.box_child(HandleKind::Image, image, &dispatch);
        trace!(?boxed, format = ?info.format, emulated = emulated.is_some(), "image created");
        state.images.insert(
            image,
            ImageEntry {
                boxed,
                device: host_device,
                info: *info,
                emulated,
                qsri_fences: VecDeque::new(),
            },
        );
        Ok(boxed)
    }

    /// Create the raw-block primary image plus its decompressed shadow and the shadow's memory.
    fn create_emulated_image(
        driver: &dyn HostDriver,
        device: HostHandle,
        format: &'static CompressedFormat,
        info: &ImageCreateInfo,
    ) -> HostResult<(HostHandle, EmulatedImage)> {
        let primary = driver.create_image(device, &size_compatible_image_info(format, info))?;
        let shadow = match driver.create_image(device, &shadow_image_info(format, info)) {
            Ok(shadow) => shadow,
            Err(err) => {
                driver.destroy_image(device, primary);
                return Err(err.into());
            }
        };
        let memory_info = MemoryAllocateInfo {
            size: shadow_size(format, info),
            memory_type_index: 0,
            property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        };
        let bound = driver.allocate_memory(device, &memory_info).and_then(|memory| {
            match driver.bind_image_memory(device, shadow, memory, 0) {
                Ok(()) => Ok(memory),
                Err(err) => {
                    driver.free_memory(device, memory);
                    Err(err)
                }
            }
        });
        let shadow_memory = match bound {
            Ok(memory) => memory,
            Err(err) => {
                driver.destroy_image(device, shadow);
                driver.destroy_image(device, primary);
                return Err(err.into());
            }
        };
        debug!(?device, format = ?format.vk_format(), ?primary, ?shadow, "compressed image emulated");
        Ok((
            primary,
            EmulatedImage {
                format,
                shadow,
                shadow_memory,
                staging: None,
            },
        ))
    }

    pub(super) fn destroy_image_objects(
        driver: &dyn HostDriver,
        device: HostHandle,
        image: HostHandle,
        entry: ImageEntry,
        fence_pool: &ExternalFencePool,
    ) {
        for fence in entry.qsri_fences {
            fence_pool.add(fence);
        }
        if let Some(emulated) = entry.emulated {
            if let Some((buffer, memory)) = emulated.staging {
                driver.destroy_buffer(device, buffer);
                driver.free_memory(device, memory);
            }
            driver.destroy_image(device, emulated.shadow);
            driver.free_memory(device, emulated.shadow_memory);
        }
        driver.destroy_image(device, image);
    }

    pub fn destroy_image(&self, device: BoxedHandle, image: BoxedHandle) -> HostResult<()> {
        if image.is_null() {
            return Ok(());
        }
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host = self.resolve(image, HandleKind::Image)?;

        let mut state = self.lock();
        let owner = match state.images.get(&host) {
            Some(entry) => entry.device,
            None => return Err(Self::stale(image, HandleKind::Image)),
        };
        Self::check_owner(owner, host_device)?;
        let fence_pool = match state.devices.get(&host_device) {
            Some(entry) => Arc::clone(&entry.fence_pool),
            None => return Err(Self::stale(device, HandleKind::Device)),
        };
        if let Some(entry) = state.images.remove(&host) {
            self.unbox_removed(entry.boxed);
            Self::destroy_image_objects(dispatch.driver(), host_device, host, entry, &fence_pool);
        }
        Ok(())
    }

    /// Host objects created only to back emulated images, across every device.
    pub fn shadow_object_count(&self) -> usize {
        self.lock()
            .images
            .values()
            .filter_map(|image| image.emulated.as_ref())
            .map(|emulated| if emulated.staging.is_some() { 4 } else { 2 })
            .sum()
    }

    /// Whether `image` is backed by an emulated shadow.
    pub fn is_image_emulated(&self, image: BoxedHandle) -> HostResult<bool> {
        let host = self.resolve(image, HandleKind::Image)?;
        let state = self.lock();
        match state.images.get(&host) {
            Some(entry) => Ok(entry.emulated.is_some()),
            None => return Err(Self::stale(image, HandleKind::Image)),
        }
    }

    /// Create a view. Views of emulated images sample the decompressed shadow.
    pub fn create_image_view(
        &self,
        device: BoxedHandle,
        image: BoxedHandle,
        info: &ImageViewCreateInfo,
    ) -> HostResult<BoxedHandle> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host_image = self.resolve(image, HandleKind::Image)?;

        let mut state = self.lock();
        let Some(image_entry) = state.images.get(&host_image) else {
            return Err(Self::stale(image, HandleKind::Image));
        };
        Self::check_owner(image_entry.device, host_device)?;

        let (target, host_info, needs_emulated_alpha) = match &image_entry.emulated {
            None => (host_image, *info, false),
            Some(emulated) => {
                let alpha = emulated.format.needs_emulated_alpha();
                let host_info = ImageViewCreateInfo {
                    format: emulated.format.decompressed_format(),
                    alpha_swizzle: if alpha {
                        vk::ComponentSwizzle::ONE
                    } else {
                        info.alpha_swizzle
                    },
                    ..*info
                };
                (emulated.shadow, host_info, alpha)
            }
        };

        let view = dispatch.driver().create_image_view(host_device, target, &host_info)?;
        let boxed = self.box_child(HandleKind::ImageView, view, &dispatch);
        state.image_views.insert(
            view,
            ImageViewEntry {
                boxed,
                device: host_device,
                needs_emulated_alpha,
            },
        );
        Ok(boxed)
    }

    pub fn destroy_image_view(&self, device: BoxedHandle, view: BoxedHandle) -> HostResult<()> {
        if view.is_null() {
            return Ok(());
        }
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host = self.resolve(view, HandleKind::ImageView)?;
        let mut state = self.lock();
        let owner = match state.image_views.get(&host) {
            Some(entry) => entry.device,
            None => return Err(Self::stale(view, HandleKind::ImageView)),
        };
        Self::check_owner(owner, host_device)?;
        if let Some(entry) = state.image_views.remove(&host) {
            self.unbox_removed(entry.boxed);
            dispatch.driver().destroy_image_view(host_device, host);
        }
        Ok(())
    }

    pub fn create_buffer(&self, device: BoxedHandle, info: &BufferCreateInfo) -> HostResult<BoxedHandle> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let mut state = self.lock();
        let buffer = dispatch.driver().create_buffer(host_device, info)?;
        let boxed = self.box_child(HandleKind::Buffer, buffer, &dispatch);
        state.buffers.insert(
            buffer,
            BufferEntry {
                boxed,
                device: host_device,
                size: info.size,
                binding: None,
            },
        );
        Ok(boxed)
    }

    pub fn destroy_buffer(&self, device: BoxedHandle, buffer: BoxedHandle) -> HostResult<()> {
        if buffer.is_null() {
            return Ok(());
        }
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host = self.resolve(buffer, HandleKind::Buffer)?;
        let mut state = self.lock();
        let owner = match state.buffers.get(&host) {
            Some(entry) => entry.device,
            None => return Err(Self::stale(buffer, HandleKind::Buffer)),
        };
        Self::check_owner(owner, host_device)?;
        if let Some(entry) = state.buffers.remove(&host) {
            self.unbox_removed(entry.boxed);
            dispatch.driver().destroy_buffer(host_device, host);
        }
        Ok(())
    }

    pub fn bind_buffer_memory(
        &self,
        device: BoxedHandle,
        buffer: BoxedHandle,
        memory: BoxedHandle,
        offset: u64,
    ) -> HostResult<()> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host_buffer = self.resolve(buffer, HandleKind::Buffer)?;
        let host_memory = self.resolve(memory, HandleKind::DeviceMemory)?;

        let mut state = self.lock();
        let memory_size = match state.memories.get(&host_memory) {
            Some(entry) => entry.size,
            None => return Err(Self::stale(memory, HandleKind::DeviceMemory)),
        };
        let Some(entry) = state.buffers.get_mut(&host_buffer) else {
            return Err(Self::stale(buffer, HandleKind::Buffer));
        };
        Self::check_owner(entry.device, host_device)?;
        if offset.checked_add(entry.size).map_or(true, |end| end > memory_size) {
            return Err(HostError::InvalidArgument("buffer binding exceeds the allocation"));
        }
        dispatch
            .driver()
            .bind_buffer_memory(host_device, host_buffer, host_memory, offset)?;
        entry.binding = Some((host_memory, offset));
        Ok(())
    }

    /// Bind guest memory to an image. For an emulated image this binds the raw-block primary.
    pub fn bind_image_memory(
        &self,
        device: BoxedHandle,
        image: BoxedHandle,
        memory: BoxedHandle,
        offset: u64,
    ) -> HostResult<()> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host_image = self.resolve(image, HandleKind::Image)?;
        let host_memory = self.resolve(memory, HandleKind::DeviceMemory)?;
        let state = self.lock();
        let Some(entry) = state.images.get(&host_image) else {
            return Err(Self::stale(image, HandleKind::Image));
        };
        Self::check_owner(entry.device, host_device)?;
        dispatch
            .driver()
            .bind_image_memory(host_device, host_image, host_memory, offset)?;
        Ok(())
    }

    /// Allocate device memory. Host-visible allocations stay mapped until freed.
    pub fn allocate_memory(&self, device: BoxedHandle, info: &MemoryAllocateInfo) -> HostResult<BoxedHandle> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let driver = dispatch.driver();
        let mut state = self.lock();
        let memory = driver.allocate_memory(host_device, info)?;

        let host_address = if info.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            match driver.map_memory(host_device, memory) {
                Ok(address) => Some(address),
                Err(err) => {
                    driver.free_memory(host_device, memory);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let boxed = self.box_child(HandleKind::DeviceMemory, memory, &dispatch);
        state.memories.insert(
            memory,
            MemoryEntry {
                boxed,
                device: host_device,
                size: info.size,
                host_address,
                guest_physical: None,
            },
        );
        Ok(boxed)
    }

    pub(super) fn release_memory_locked(
        state: &mut RegistryState,
        driver: &dyn HostDriver,
        device: HostHandle,
        memory: HostHandle,
        entry: &MemoryEntry,
    ) {
        if let Some(gpa) = entry.guest_physical {
            state.guest_physical.remove(&gpa);
        }
        if entry.host_address.is_some() {
            driver.unmap_memory(device, memory);
        }
        driver.free_memory(device, memory);
    }

    pub fn free_memory(&self, device: BoxedHandle, memory: BoxedHandle) -> HostResult<()> {
        if memory.is_null() {
            return Ok(());
        }
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host = self.resolve(memory, HandleKind::DeviceMemory)?;
        let mut state = self.lock();
        let owner = match state.memories.get(&host) {
            Some(entry) => entry.device,
            None => return Err(Self::stale(memory, HandleKind::DeviceMemory)),
        };
        Self::check_owner(owner, host_device)?;
        if let Some(entry) = state.memories.remove(&host) {
            self.unbox_removed(entry.boxed);
            Self::release_memory_locked(&mut state, dispatch.driver(), host_device, host, &entry);
        }
        Ok(())
    }

    /// Host address of a host-visible allocation's persistent mapping.
    pub fn memory_host_address(&self, memory: BoxedHandle) -> HostResult<Option<u64>> {
        let host = self.resolve(memory, HandleKind::DeviceMemory)?;
        let state = self.lock();
        match state.memories.get(&host) {
            Some(entry) => Ok(entry.host_address),
            None => return Err(Self::stale(memory, HandleKind::DeviceMemory)),
        }
    }

    /// Copy guest data into an allocation, as a guest write through its mapping would.
    pub fn write_memory(&self, memory: BoxedHandle, offset: u64, bytes: &[u8]) -> HostResult<()> {
        let record = self.resolve_record(memory, HandleKind::DeviceMemory)?;
        let state = self.lock();
        let Some(entry) = state.memories.get(&record.object()) else {
            return Err(Self::stale(memory, HandleKind::DeviceMemory));
        };
        if entry.host_address.is_none() {
            return Err(HostError::InvalidArgument("memory is not host visible"));
        }
        record
            .dispatch()
            .driver()
            .write_memory(entry.device, record.object(), offset, bytes)?;
        Ok(())
    }

    /// Expose `memory` at guest-physical `gpa`.
    ///
    /// Guest-physical ranges are unique: every existing mapping overlapping
    /// `[gpa, gpa + size)` is torn down first, as is any earlier mapping of `memory` itself.
    pub fn map_to_guest_physical(&self, memory: BoxedHandle, gpa: u64) -> HostResult<()> {
        let host = self.resolve(memory, HandleKind::DeviceMemory)?;
        let mut state = self.lock();
        let (size, previous) = match state.memories.get(&host) {
            Some(entry) if entry.host_address.is_none() => {
                return Err(HostError::InvalidArgument("memory is not host visible"));
            }
            Some(entry) => (entry.size, entry.guest_physical),
            None => return Err(Self::stale(memory, HandleKind::DeviceMemory)),
        };
        // An empty range would overlap nothing, yet still claim the key at `gpa`.
        if size == 0 {
            return Err(HostError::InvalidArgument("cannot map an empty allocation"));
        }
        let end = gpa
            .checked_add(size)
            .ok_or(HostError::InvalidArgument("guest-physical range overflows"))?;

        if let Some(previous) = previous {
            state.guest_physical.remove(&previous);
        }

        let mut overlapping: Vec<u64> = Vec::new();
        // A mapping starting below `gpa` can still reach into the new range.
        if let Some((&start, mapping)) = state.guest_physical.range(..gpa).next_back() {
            if start + mapping.size > gpa {
                overlapping.push(start);
            }
        }
        overlapping.extend(
            state
                .guest_physical
                .range((Bound::Included(gpa), Bound::Excluded(end)))
                .map(|(&start, _)| start),
        );
        for start in overlapping {
            if let Some(old) = state.guest_physical.remove(&start) {
                debug!(gpa = start, memory = ?old.memory, "tearing down overlapping guest-physical mapping");
                if let Some(entry) = state.memories.get_mut(&old.memory) {
                    entry.guest_physical = None;
                }
            }
        }

        state
            .guest_physical
            .insert(gpa, GuestPhysicalMapping { size, memory: host });
        if let Some(entry) = state.memories.get_mut(&host) {
            entry.guest_physical = Some(gpa);
        }
        Ok(())
    }

    pub fn unmap_guest_physical(&self, memory: BoxedHandle) -> HostResult<()> {
        let host = self.resolve(memory, HandleKind::DeviceMemory)?;
        let mut state = self.lock();
        let gpa = match state.memories.get_mut(&host) {
            Some(entry) => entry.guest_physical.take(),
            None => return Err(Self::stale(memory, HandleKind::DeviceMemory)),
        };
        if let Some(gpa) = gpa {
            state.guest_physical.remove(&gpa);
        }
        Ok(())
    }

    /// Memory currently mapped over guest-physical address `gpa`.
    pub fn guest_physical_owner(&self, gpa: u64) -> Option<BoxedHandle> {
        let state = self.lock();
        let (&start, mapping) = state.guest_physical.range(..=gpa).next_back()?;
        if gpa - start >= mapping.size {
            return None;
        }
        state.memories.get(&mapping.memory).map(|entry| entry.boxed)
    }

    pub fn create_sampler(&self, device: BoxedHandle, info: &SamplerCreateInfo) -> HostResult<BoxedHandle> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let mut state = self.lock();
        let sampler = dispatch.driver().create_sampler(host_device, info)?;
        let boxed = self.box_child(HandleKind::Sampler, sampler, &dispatch);
        state.samplers.insert(
            sampler,
            SamplerEntry {
                boxed,
                device: host_device,
                info: *info,
                emulated_alpha_twin: None,
            },
        );
        Ok(boxed)
    }

    pub(super) fn destroy_sampler_objects(
        driver: &dyn HostDriver,
        device: HostHandle,
        sampler: HostHandle,
        entry: &SamplerEntry,
    ) {
        if let Some(twin) = entry.emulated_alpha_twin {
            driver.destroy_sampler(device, twin);
        }
        driver.destroy_sampler(device, sampler);
    }

    pub fn destroy_sampler(&self, device: BoxedHandle, sampler: BoxedHandle) -> HostResult<()> {
        if sampler.is_null() {
            return Ok(());
        }
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host = self.resolve(sampler, HandleKind::Sampler)?;
        let mut state = self.lock();
        let owner = match state.samplers.get(&host) {
            Some(entry) => entry.device,
            None => return Err(Self::stale(sampler, HandleKind::Sampler)),
        };
        Self::check_owner(owner, host_device)?;
        if let Some(entry) = state.samplers.remove(&host) {
            self.unbox_removed(entry.boxed);
            Self::destroy_sampler_objects(dispatch.driver(), host_device, host, &entry);
        }
        Ok(())
    }

    /// Sampler to bind alongside a view that synthesizes alpha, creating the twin on first use.
    pub(super) fn alpha_sampler_locked(
        state: &mut RegistryState,
        driver: &dyn HostDriver,
        device: HostHandle,
        guest: BoxedHandle,
        sampler: HostHandle,
    ) -> HostResult<HostHandle> {
        let Some(entry) = state.samplers.get_mut(&sampler) else {
            return Err(Self::stale(guest, HandleKind::Sampler));
        };
        if !needs_alpha_twin(&entry.info) {
            return Ok(sampler);
        }
        if let Some(twin) = entry.emulated_alpha_twin {
            return Ok(twin);
        }
        let twin = driver.create_sampler(device, &opaque_twin_info(&entry.info))?;
        debug!(?sampler, ?twin, "created opaque-border sampler for emulated alpha");
        entry.emulated_alpha_twin = Some(twin);
        Ok(twin)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::super::tests::registry_with;
    use super::*;
    use crate::driver::{DeviceCreateInfo, DeviceQueueCreateInfo, SoftHostDriver};

    fn device(registry: &Registry) -> BoxedHandle {
        let instance = registry.create_instance(&Default::default()).unwrap();
        let pd = registry.enumerate_physical_devices(instance).unwrap()[0];
        registry
            .create_device(
                pd,
                &DeviceCreateInfo {
                    queue_create_infos: vec![DeviceQueueCreateInfo {
                        family_index: 0,
                        queue_count: 1,
                    }],
                    ..Default::default()
                },
            )
            .unwrap()
    }

    fn host_visible(size: u64) -> MemoryAllocateInfo {
        MemoryAllocateInfo {
            size,
            memory_type_index: 1,
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        }
    }

    #[test]
    fn native_format_allocates_no_shadow() {
        let (driver, registry) = registry_with(SoftHostDriver::new());
        let device = device(&registry);
        let image = registry
            .create_image(device, &ImageCreateInfo::new_2d(vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK, 64, 64))
            .unwrap();
        assert!(!registry.is_image_emulated(image).unwrap());
        assert_eq!(registry.shadow_object_count(), 0);
        assert_eq!(driver.live_objects(HandleKind::Image), 1);
    }

    #[test]
    fn emulated_format_gets_block_primary_and_shadow() {
        let (driver, registry) = registry_with(SoftHostDriver::new().without_compressed_textures());
        let device = device(&registry);
        let image = registry
            .create_image(device, &ImageCreateInfo::new_2d(vk::Format::ETC2_R8G8B8_UNORM_BLOCK, 64, 32))
            .unwrap();
        assert!(registry.is_image_emulated(image).unwrap());
        assert_eq!(registry.shadow_object_count(), 2);
        assert_eq!(driver.live_objects(HandleKind::Image), 2);

        let primary = driver.image_info(registry.handles().unbox(image).unwrap()).unwrap();
        assert_eq!(primary.format, vk::Format::R16G16B16A16_UINT);
        assert_eq!((primary.extent.width, primary.extent.height), (16, 8));

        let view = registry
            .create_image_view(device, image, &ImageViewCreateInfo::new_2d(vk::Format::ETC2_R8G8B8_UNORM_BLOCK))
            .unwrap();
        let (target, view_info) = driver
            .image_view_info(registry.handles().unbox(view).unwrap())
            .unwrap();
        let shadow = driver.image_info(target).unwrap();
        assert_eq!(shadow.format, vk::Format::R8G8B8A8_UNORM);
        assert_eq!((shadow.extent.width, shadow.extent.height), (64, 32));
        assert_eq!(view_info.alpha_swizzle, vk::ComponentSwizzle::ONE);

        registry.destroy_image_view(device, view).unwrap();
        registry.destroy_image(device, image).unwrap();
        assert_eq!(registry.shadow_object_count(), 0);
        assert_eq!(driver.live_objects(HandleKind::Image), 0);
        assert_eq!(driver.live_objects(HandleKind::DeviceMemory), 0);
    }

    #[test]
    fn emulation_decision_is_stable() {
        let (_driver, registry) = registry_with(SoftHostDriver::new().without_compressed_textures());
        let device = device(&registry);
        let info = ImageCreateInfo::new_2d(vk::Format::ASTC_6X6_SRGB_BLOCK, 30, 30);
        let decisions: Vec<bool> = (0..8)
            .map(|_| {
                let image = registry.create_image(device, &info).unwrap();
                registry.is_image_emulated(image).unwrap()
            })
            .collect();
        assert_eq!(decisions, vec![true; 8]);
    }

    #[test]
    fn host_visible_memory_is_mapped_persistently() {
        let (_driver, registry) = registry_with(SoftHostDriver::new());
        let device = device(&registry);
        let visible = registry.allocate_memory(device, &host_visible(4096)).unwrap();
        let local = registry
            .allocate_memory(
                device,
                &MemoryAllocateInfo {
                    size: 4096,
                    memory_type_index: 0,
                    property_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
                },
            )
            .unwrap();
        assert!(registry.memory_host_address(visible).unwrap().is_some());
        assert_eq!(registry.memory_host_address(local).unwrap(), None);
        assert!(registry.map_to_guest_physical(local, 0x1000).is_err());
    }

    #[test]
    fn guest_physical_ranges_stay_unique() {
        let (_driver, registry) = registry_with(SoftHostDriver::new());
        let device = device(&registry);
        let a = registry.allocate_memory(device, &host_visible(0x2000)).unwrap();
        let b = registry.allocate_memory(device, &host_visible(0x1000)).unwrap();
        let c = registry.allocate_memory(device, &host_visible(0x1000)).unwrap();

        registry.map_to_guest_physical(a, 0x10_0000).unwrap();
        registry.map_to_guest_physical(c, 0x20_0000).unwrap();
        assert_eq!(registry.guest_physical_owner(0x10_1fff), Some(a));

        // `b` lands inside `a`'s range: `a` is torn down, `c` is untouched.
        registry.map_to_guest_physical(b, 0x10_1000).unwrap();
        assert_eq!(registry.guest_physical_owner(0x10_0000), None);
        assert_eq!(registry.guest_physical_owner(0x10_1800), Some(b));
        assert_eq!(registry.guest_physical_owner(0x20_0000), Some(c));

        // Remapping `c` moves it.
        registry.map_to_guest_physical(c, 0x30_0000).unwrap();
        assert_eq!(registry.guest_physical_owner(0x20_0000), None);
        assert_eq!(registry.guest_physical_owner(0x30_0fff), Some(c));

        registry.free_memory(device, c).unwrap();
        assert_eq!(registry.guest_physical_owner(0x30_0000), None);
    }

    #[test]
    fn buffer_binding_is_bounds_checked() {
        let (_driver, registry) = registry_with(SoftHostDriver::new());
        let device = device(&registry);
        let memory = registry.allocate_memory(device, &host_visible(256)).unwrap();
        let buffer = registry
            .create_buffer(
                device,
                &BufferCreateInfo {
                    size: 128,
                    usage: vk::BufferUsageFlags::TRANSFER_SRC,
                },
            )
            .unwrap();
        assert!(registry.bind_buffer_memory(device, buffer, memory, 200).is_err());
        registry.bind_buffer_memory(device, buffer, memory, 128).unwrap();
    }
}
