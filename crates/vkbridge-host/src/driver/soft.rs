use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::{Condvar, Mutex};

use super::types::*;
use super::HostDriver;
use crate::emulation::CompressedFormat;
use crate::handle::HandleKind;

/// Host driver call observed by [`SoftHostDriver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverCall {
    Create {
        kind: HandleKind,
        handle: HostHandle,
    },
    Destroy {
        kind: HandleKind,
        handle: HostHandle,
    },
    BindMemory {
        object: HostHandle,
        memory: HostHandle,
        offset: u64,
    },
    WriteMemory {
        memory: HostHandle,
        offset: u64,
        len: usize,
    },
    ResetFences(Vec<HostHandle>),
    UpdateDescriptorSets(Vec<DescriptorImageWrite<HostHandle>>),
    CopyBufferToImage {
        command_buffer: HostHandle,
        buffer: HostHandle,
        image: HostHandle,
        regions: Vec<BufferImageCopy>,
    },
    PipelineBarrier {
        command_buffer: HostHandle,
        images: Vec<HostHandle>,
    },
    QueueSubmit {
        queue: HostHandle,
        command_buffers: Vec<HostHandle>,
        fence: HostHandle,
    },
}

#[derive(Debug)]
struct SoftObject {
    kind: HandleKind,
}

#[derive(Debug, Default)]
struct SoftState {
    next_handle: u64,
    objects: HashMap<HostHandle, SoftObject>,
    physical_devices: HashMap<HostHandle, Vec<HostHandle>>,
    queues: HashMap<(HostHandle, u32, u32), HostHandle>,
    images: HashMap<HostHandle, ImageCreateInfo>,
    image_views: HashMap<HostHandle, (HostHandle, ImageViewCreateInfo)>,
    samplers: HashMap<HostHandle, SamplerCreateInfo>,
    memory: HashMap<HostHandle, Vec<u8>>,
    fences: HashMap<HostHandle, bool>,
    /// Descriptor sets and command buffers by the pool they came from.
    pool_children: HashMap<HostHandle, Vec<HostHandle>>,
    calls: Vec<DriverCall>,
}

impl SoftState {
    fn alloc(&mut self, kind: HandleKind) -> HostHandle {
        self.next_handle += 1;
        let handle = HostHandle(0x1000 + self.next_handle);
        self.objects.insert(handle, SoftObject { kind });
        self.calls.push(DriverCall::Create { kind, handle });
        handle
    }

    fn free(&mut self, kind: HandleKind, handle: HostHandle) {
        match self.objects.remove(&handle) {
            Some(obj) if obj.kind == kind => {}
            Some(obj) => panic!("soft driver: destroying {handle:?} as {kind:?}, but it is a {:?}", obj.kind),
            None => panic!("soft driver: destroying unknown {kind:?} {handle:?}"),
        }
        self.calls.push(DriverCall::Destroy { kind, handle });
    }
}

/// Deterministic in-process host driver.
///
/// Objects are plain integers, memory is a `Vec<u8>` per allocation, and fences signal on
/// submission unless auto-signal is turned off, in which case tests signal them explicitly with
/// [`SoftHostDriver::signal_fence`]. Every call that changes state is appended to a log so tests
/// can assert on ordering.
///
/// Destroying an unknown object panics: the host layer must never double-destroy.
#[derive(Debug)]
pub struct SoftHostDriver {
    state: Mutex<SoftState>,
    fence_signaled: Condvar,
    unsupported_formats: HashSet<vk::Format>,
    features: DeviceFeatures,
    queue_families: Vec<QueueFamilyProperties>,
    physical_device_count: usize,
    fence_auto_signal: AtomicBool,
    out_of_memory: AtomicBool,
}

impl Default for SoftHostDriver {
    fn default() -> Self {
        Self::new()
    }
}

const SOFT_EXTENSIONS: &[&str] = &[
    "VK_KHR_surface",
    "VK_KHR_get_physical_device_properties2",
    "VK_KHR_external_memory_capabilities",
    "VK_KHR_external_fence_capabilities",
    "VK_KHR_swapchain",
    "VK_KHR_external_memory",
    "VK_KHR_external_fence",
    "VK_KHR_external_semaphore",
];

impl SoftHostDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SoftState::default()),
            fence_signaled: Condvar::new(),
            unsupported_formats: HashSet::new(),
            features: DeviceFeatures {
                texture_compression_etc2: true,
                texture_compression_astc_ldr: true,
                texture_compression_bc: true,
                sampler_anisotropy: true,
            },
            queue_families: vec![
                QueueFamilyProperties {
                    queue_flags: vk::QueueFlags::GRAPHICS
                        | vk::QueueFlags::COMPUTE
                        | vk::QueueFlags::TRANSFER,
                    queue_count: 2,
                },
                QueueFamilyProperties {
                    queue_flags: vk::QueueFlags::TRANSFER,
                    queue_count: 1,
                },
            ],
            physical_device_count: 1,
            fence_auto_signal: AtomicBool::new(true),
            out_of_memory: AtomicBool::new(false),
        }
    }

    /// Report no ETC2/EAC/ASTC support, as most desktop drivers do.
    pub fn without_compressed_textures(mut self) -> Self {
        self.features.texture_compression_etc2 = false;
        self.features.texture_compression_astc_ldr = false;
        self.unsupported_formats
            .extend(CompressedFormat::ALL.iter().map(|f| f.vk_format()));
        self
    }

    pub fn with_unsupported_format(mut self, format: vk::Format) -> Self {
        self.unsupported_formats.insert(format);
        self
    }

    pub fn with_physical_device_count(mut self, count: usize) -> Self {
        self.physical_device_count = count;
        self
    }

    /// When disabled, submitted fences stay pending until [`Self::signal_fence`].
    pub fn set_fence_auto_signal(&self, enabled: bool) {
        self.fence_auto_signal.store(enabled, Ordering::Release);
    }

    /// Make every subsequent allocation fail with `ERROR_OUT_OF_DEVICE_MEMORY`.
    pub fn set_out_of_memory(&self, enabled: bool) {
        self.out_of_memory.store(enabled, Ordering::Release);
    }

    pub fn signal_fence(&self, fence: HostHandle) {
        let mut state = self.state.lock();
        if let Some(signaled) = state.fences.get_mut(&fence) {
            *signaled = true;
        }
        self.fence_signaled.notify_all();
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn live_objects(&self, kind: HandleKind) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|obj| obj.kind == kind)
            .count()
    }

    pub fn is_live(&self, handle: HostHandle) -> bool {
        self.state.lock().objects.contains_key(&handle)
    }

    pub fn image_info(&self, image: HostHandle) -> Option<ImageCreateInfo> {
        self.state.lock().images.get(&image).copied()
    }

    /// Image a view was created on, plus its create info.
    pub fn image_view_info(&self, view: HostHandle) -> Option<(HostHandle, ImageViewCreateInfo)> {
        self.state.lock().image_views.get(&view).copied()
    }

    pub fn sampler_info(&self, sampler: HostHandle) -> Option<SamplerCreateInfo> {
        self.state.lock().samplers.get(&sampler).copied()
    }

    fn check_oom(&self) -> VkResult<()> {
        if self.out_of_memory.load(Ordering::Acquire) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        Ok(())
    }

    fn create(&self, kind: HandleKind) -> VkResult<HostHandle> {
        self.check_oom()?;
        Ok(self.state.lock().alloc(kind))
    }

    fn destroy(&self, kind: HandleKind, handle: HostHandle) {
        if handle.is_null() {
            return;
        }
        let mut state = self.state.lock();
        state.free(kind, handle);
        match kind {
            HandleKind::Image => {
                state.images.remove(&handle);
            }
            HandleKind::ImageView => {
                state.image_views.remove(&handle);
            }
            HandleKind::Sampler => {
                state.samplers.remove(&handle);
            }
            HandleKind::DeviceMemory => {
                state.memory.remove(&handle);
            }
            HandleKind::Fence => {
                state.fences.remove(&handle);
            }
            _ => {}
        }
    }

    fn destroy_pool_children(&self, kind: HandleKind, pool: HostHandle) {
        let children = self.state.lock().pool_children.remove(&pool).unwrap_or_default();
        for child in children {
            self.destroy(kind, child);
        }
    }

    fn free_pool_children(&self, kind: HandleKind, pool: HostHandle, freed: &[HostHandle]) {
        if let Some(children) = self.state.lock().pool_children.get_mut(&pool) {
            children.retain(|c| !freed.contains(c));
        }
        for &child in freed {
            self.destroy(kind, child);
        }
    }

    fn full_format_features() -> vk::FormatFeatureFlags {
        vk::FormatFeatureFlags::SAMPLED_IMAGE
            | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR
            | vk::FormatFeatureFlags::TRANSFER_SRC
            | vk::FormatFeatureFlags::TRANSFER_DST
            | vk::FormatFeatureFlags::BLIT_SRC
            | vk::FormatFeatureFlags::BLIT_DST
            | vk::FormatFeatureFlags::COLOR_ATTACHMENT
            | vk::FormatFeatureFlags::STORAGE_IMAGE
    }
}

impl HostDriver for SoftHostDriver {
    fn instance_extensions(&self) -> Vec<String> {
        SOFT_EXTENSIONS[..4].iter().map(|s| s.to_string()).collect()
    }

    fn create_instance(&self, _info: &InstanceCreateInfo) -> VkResult<HostHandle> {
        self.create(HandleKind::Instance)
    }

    fn destroy_instance(&self, instance: HostHandle) {
        let physical = self.state.lock().physical_devices.remove(&instance);
        for pd in physical.into_iter().flatten() {
            self.destroy(HandleKind::PhysicalDevice, pd);
        }
        self.destroy(HandleKind::Instance, instance);
    }

    fn enumerate_physical_devices(&self, instance: HostHandle) -> VkResult<Vec<HostHandle>> {
        let mut state = self.state.lock();
        if let Some(existing) = state.physical_devices.get(&instance) {
            return Ok(existing.clone());
        }
        let devices: Vec<_> = (0..self.physical_device_count)
            .map(|_| state.alloc(HandleKind::PhysicalDevice))
            .collect();
        state.physical_devices.insert(instance, devices.clone());
        Ok(devices)
    }

    fn physical_device_features(&self, _physical_device: HostHandle) -> DeviceFeatures {
        self.features
    }

    fn physical_device_format_properties(
        &self,
        _physical_device: HostHandle,
        format: vk::Format,
    ) -> FormatProperties {
        if self.unsupported_formats.contains(&format) || format == vk::Format::UNDEFINED {
            return FormatProperties::default();
        }
        FormatProperties {
            linear_tiling_features: Self::full_format_features(),
            optimal_tiling_features: Self::full_format_features(),
            buffer_features: vk::FormatFeatureFlags::UNIFORM_TEXEL_BUFFER
                | vk::FormatFeatureFlags::VERTEX_BUFFER,
        }
    }

    fn physical_device_queue_families(&self, _physical_device: HostHandle) -> Vec<QueueFamilyProperties> {
        self.queue_families.clone()
    }

    fn device_extensions(&self, _physical_device: HostHandle) -> Vec<String> {
        SOFT_EXTENSIONS[4..].iter().map(|s| s.to_string()).collect()
    }

    fn create_device(
        &self,
        _physical_device: HostHandle,
        info: &DeviceCreateInfo,
    ) -> VkResult<HostHandle> {
        let f = info.enabled_features;
        if (f.texture_compression_etc2 && !self.features.texture_compression_etc2)
            || (f.texture_compression_astc_ldr && !self.features.texture_compression_astc_ldr)
        {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        for q in &info.queue_create_infos {
            let family = self
                .queue_families
                .get(q.family_index as usize)
                .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
            if q.queue_count > family.queue_count {
                return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
            }
        }
        self.create(HandleKind::Device)
    }

    fn destroy_device(&self, device: HostHandle) {
        let queues: Vec<_> = {
            let mut state = self.state.lock();
            let keys: Vec<_> = state.queues.keys().filter(|k| k.0 == device).copied().collect();
            keys.into_iter().filter_map(|k| state.queues.remove(&k)).collect()
        };
        for queue in queues {
            self.destroy(HandleKind::Queue, queue);
        }
        self.destroy(HandleKind::Device, device);
    }

    fn device_wait_idle(&self, _device: HostHandle) -> VkResult<()> {
        Ok(())
    }

    fn get_device_queue(&self, device: HostHandle, family_index: u32, queue_index: u32) -> HostHandle {
        let mut state = self.state.lock();
        if let Some(&queue) = state.queues.get(&(device, family_index, queue_index)) {
            return queue;
        }
        let queue = state.alloc(HandleKind::Queue);
        state.queues.insert((device, family_index, queue_index), queue);
        queue
    }

    fn queue_submit(
        &self,
        queue: HostHandle,
        submits: &[SubmitInfo<HostHandle>],
        fence: HostHandle,
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::QueueSubmit {
            queue,
            command_buffers: submits
                .iter()
                .flat_map(|s| s.command_buffers.iter().copied())
                .collect(),
            fence,
        });
        if !fence.is_null() && self.fence_auto_signal.load(Ordering::Acquire) {
            if let Some(signaled) = state.fences.get_mut(&fence) {
                *signaled = true;
            }
            self.fence_signaled.notify_all();
        }
        Ok(())
    }

    fn queue_wait_idle(&self, _queue: HostHandle) -> VkResult<()> {
        Ok(())
    }

    fn create_image(&self, _device: HostHandle, info: &ImageCreateInfo) -> VkResult<HostHandle> {
        if self.unsupported_formats.contains(&info.format) {
            return Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED);
        }
        let image = self.create(HandleKind::Image)?;
        self.state.lock().images.insert(image, *info);
        Ok(image)
    }

    fn destroy_image(&self, _device: HostHandle, image: HostHandle) {
        self.destroy(HandleKind::Image, image);
    }

    fn create_image_view(
        &self,
        _device: HostHandle,
        image: HostHandle,
        info: &ImageViewCreateInfo,
    ) -> VkResult<HostHandle> {
        let mut state = self.state.lock();
        if !state.images.contains_key(&image) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let view = state.alloc(HandleKind::ImageView);
        state.image_views.insert(view, (image, *info));
        Ok(view)
    }

    fn destroy_image_view(&self, _device: HostHandle, view: HostHandle) {
        self.destroy(HandleKind::ImageView, view);
    }

    fn create_buffer(&self, _device: HostHandle, _info: &BufferCreateInfo) -> VkResult<HostHandle> {
        self.create(HandleKind::Buffer)
    }

    fn destroy_buffer(&self, _device: HostHandle, buffer: HostHandle) {
        self.destroy(HandleKind::Buffer, buffer);
    }

    fn allocate_memory(&self, _device: HostHandle, info: &MemoryAllocateInfo) -> VkResult<HostHandle> {
        let size = usize::try_from(info.size).map_err(|_| vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)?;
        let memory = self.create(HandleKind::DeviceMemory)?;
        self.state.lock().memory.insert(memory, vec![0u8; size]);
        Ok(memory)
    }

    fn free_memory(&self, _device: HostHandle, memory: HostHandle) {
        self.destroy(HandleKind::DeviceMemory, memory);
    }

    fn map_memory(&self, _device: HostHandle, memory: HostHandle) -> VkResult<u64> {
        if !self.state.lock().memory.contains_key(&memory) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        Ok(0x7f00_0000_0000 + (memory.raw() << 24))
    }

    fn unmap_memory(&self, _device: HostHandle, _memory: HostHandle) {}

    fn read_memory(
        &self,
        _device: HostHandle,
        memory: HostHandle,
        offset: u64,
        dst: &mut [u8],
    ) -> VkResult<()> {
        let state = self.state.lock();
        let bytes = state.memory.get(&memory).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let start = usize::try_from(offset).map_err(|_| vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let src = start
            .checked_add(dst.len())
            .and_then(|end| bytes.get(start..end))
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_memory(
        &self,
        _device: HostHandle,
        memory: HostHandle,
        offset: u64,
        src: &[u8],
    ) -> VkResult<()> {
        let mut state = self.state.lock();
        let bytes = state
            .memory
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let start = usize::try_from(offset).map_err(|_| vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let dst = start
            .checked_add(src.len())
            .and_then(|end| bytes.get_mut(start..end))
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        dst.copy_from_slice(src);
        state.calls.push(DriverCall::WriteMemory {
            memory,
            offset,
            len: src.len(),
        });
        Ok(())
    }

    fn bind_buffer_memory(
        &self,
        _device: HostHandle,
        buffer: HostHandle,
        memory: HostHandle,
        offset: u64,
    ) -> VkResult<()> {
        self.state.lock().calls.push(DriverCall::BindMemory {
            object: buffer,
            memory,
            offset,
        });
        Ok(())
    }

    fn bind_image_memory(
        &self,
        _device: HostHandle,
        image: HostHandle,
        memory: HostHandle,
        offset: u64,
    ) -> VkResult<()> {
        self.state.lock().calls.push(DriverCall::BindMemory {
            object: image,
            memory,
            offset,
        });
        Ok(())
    }

    fn create_sampler(&self, _device: HostHandle, info: &SamplerCreateInfo) -> VkResult<HostHandle> {
        let sampler = self.create(HandleKind::Sampler)?;
        self.state.lock().samplers.insert(sampler, *info);
        Ok(sampler)
    }

    fn destroy_sampler(&self, _device: HostHandle, sampler: HostHandle) {
        self.destroy(HandleKind::Sampler, sampler);
    }

    fn create_semaphore(&self, _device: HostHandle, _info: &SemaphoreCreateInfo) -> VkResult<HostHandle> {
        self.create(HandleKind::Semaphore)
    }

    fn destroy_semaphore(&self, _device: HostHandle, semaphore: HostHandle) {
        self.destroy(HandleKind::Semaphore, semaphore);
    }

    fn create_fence(&self, _device: HostHandle, info: &FenceCreateInfo) -> VkResult<HostHandle> {
        let fence = self.create(HandleKind::Fence)?;
        self.state
            .lock()
            .fences
            .insert(fence, info.flags.contains(vk::FenceCreateFlags::SIGNALED));
        Ok(fence)
    }

    fn destroy_fence(&self, _device: HostHandle, fence: HostHandle) {
        self.destroy(HandleKind::Fence, fence);
    }

    fn reset_fences(&self, _device: HostHandle, fences: &[HostHandle]) -> VkResult<()> {
        let mut state = self.state.lock();
        for fence in fences {
            let signaled = state.fences.get_mut(fence).ok_or(vk::Result::ERROR_UNKNOWN)?;
            *signaled = false;
        }
        state.calls.push(DriverCall::ResetFences(fences.to_vec()));
        Ok(())
    }

    fn get_fence_status(&self, _device: HostHandle, fence: HostHandle) -> vk::Result {
        match self.state.lock().fences.get(&fence) {
            Some(true) => vk::Result::SUCCESS,
            Some(false) => vk::Result::NOT_READY,
            None => vk::Result::ERROR_UNKNOWN,
        }
    }

    fn wait_for_fences(
        &self,
        _device: HostHandle,
        fences: &[HostHandle],
        wait_all: bool,
        timeout_ns: u64,
    ) -> vk::Result {
        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let mut state = self.state.lock();
        loop {
            let mut statuses = Vec::with_capacity(fences.len());
            for fence in fences {
                match state.fences.get(fence) {
                    Some(&signaled) => statuses.push(signaled),
                    None => return vk::Result::ERROR_UNKNOWN,
                }
            }
            let done = if wait_all {
                statuses.iter().all(|&s| s)
            } else {
                statuses.iter().any(|&s| s)
            };
            if done {
                return vk::Result::SUCCESS;
            }
            match deadline {
                Some(deadline) => {
                    if self.fence_signaled.wait_until(&mut state, deadline).timed_out() {
                        // One last look: a signal may have raced with the deadline.
                        let still_pending = fences
                            .iter()
                            .any(|f| !state.fences.get(f).copied().unwrap_or(false));
                        if still_pending {
                            return vk::Result::TIMEOUT;
                        }
                    }
                }
                None => self.fence_signaled.wait(&mut state),
            }
        }
    }

    fn create_descriptor_set_layout(
        &self,
        _device: HostHandle,
        _info: &DescriptorSetLayoutCreateInfo,
    ) -> VkResult<HostHandle> {
        self.create(HandleKind::DescriptorSetLayout)
    }

    fn destroy_descriptor_set_layout(&self, _device: HostHandle, layout: HostHandle) {
        self.destroy(HandleKind::DescriptorSetLayout, layout);
    }

    fn create_descriptor_pool(
        &self,
        _device: HostHandle,
        _info: &DescriptorPoolCreateInfo,
    ) -> VkResult<HostHandle> {
        self.create(HandleKind::DescriptorPool)
    }

    fn destroy_descriptor_pool(&self, _device: HostHandle, pool: HostHandle) {
        self.destroy_pool_children(HandleKind::DescriptorSet, pool);
        self.destroy(HandleKind::DescriptorPool, pool);
    }

    fn reset_descriptor_pool(&self, _device: HostHandle, pool: HostHandle) -> VkResult<()> {
        self.destroy_pool_children(HandleKind::DescriptorSet, pool);
        Ok(())
    }

    fn allocate_descriptor_sets(
        &self,
        _device: HostHandle,
        pool: HostHandle,
        layouts: &[HostHandle],
    ) -> VkResult<Vec<HostHandle>> {
        self.check_oom()?;
        let mut state = self.state.lock();
        let sets: Vec<_> = layouts
            .iter()
            .map(|_| state.alloc(HandleKind::DescriptorSet))
            .collect();
        state
            .pool_children
            .entry(pool)
            .or_default()
            .extend_from_slice(&sets);
        Ok(sets)
    }

    fn free_descriptor_sets(&self, _device: HostHandle, pool: HostHandle, sets: &[HostHandle]) {
        self.free_pool_children(HandleKind::DescriptorSet, pool, sets);
    }

    fn update_descriptor_sets(&self, _device: HostHandle, writes: &[DescriptorImageWrite<HostHandle>]) {
        self.state
            .lock()
            .calls
            .push(DriverCall::UpdateDescriptorSets(writes.to_vec()));
    }

    fn create_shader_module(
        &self,
        _device: HostHandle,
        _info: &ShaderModuleCreateInfo,
    ) -> VkResult<HostHandle> {
        self.create(HandleKind::ShaderModule)
    }

    fn destroy_shader_module(&self, _device: HostHandle, module: HostHandle) {
        self.destroy(HandleKind::ShaderModule, module);
    }

    fn create_pipeline_cache(
        &self,
        _device: HostHandle,
        _info: &PipelineCacheCreateInfo,
    ) -> VkResult<HostHandle> {
        self.create(HandleKind::PipelineCache)
    }

    fn destroy_pipeline_cache(&self, _device: HostHandle, cache: HostHandle) {
        self.destroy(HandleKind::PipelineCache, cache);
    }

    fn create_pipeline(
        &self,
        _device: HostHandle,
        _cache: HostHandle,
        _info: &PipelineCreateInfo<HostHandle>,
    ) -> VkResult<HostHandle> {
        self.create(HandleKind::Pipeline)
    }

    fn destroy_pipeline(&self, _device: HostHandle, pipeline: HostHandle) {
        self.destroy(HandleKind::Pipeline, pipeline);
    }

    fn create_render_pass(
        &self,
        _device: HostHandle,
        _info: &RenderPassCreateInfo,
    ) -> VkResult<HostHandle> {
        self.create(HandleKind::RenderPass)
    }

    fn destroy_render_pass(&self, _device: HostHandle, render_pass: HostHandle) {
        self.destroy(HandleKind::RenderPass, render_pass);
    }

    fn create_framebuffer(
        &self,
        _device: HostHandle,
        _info: &FramebufferCreateInfo<HostHandle>,
    ) -> VkResult<HostHandle> {
        self.create(HandleKind::Framebuffer)
    }

    fn destroy_framebuffer(&self, _device: HostHandle, framebuffer: HostHandle) {
        self.destroy(HandleKind::Framebuffer, framebuffer);
    }

    fn create_command_pool(
        &self,
        _device: HostHandle,
        _info: &CommandPoolCreateInfo,
    ) -> VkResult<HostHandle> {
        self.create(HandleKind::CommandPool)
    }

    fn destroy_command_pool(&self, _device: HostHandle, pool: HostHandle) {
        self.destroy_pool_children(HandleKind::CommandBuffer, pool);
        self.destroy(HandleKind::CommandPool, pool);
    }

    fn allocate_command_buffers(
        &self,
        _device: HostHandle,
        pool: HostHandle,
        count: u32,
    ) -> VkResult<Vec<HostHandle>> {
        self.check_oom()?;
        let mut state = self.state.lock();
        let buffers: Vec<_> = (0..count)
            .map(|_| state.alloc(HandleKind::CommandBuffer))
            .collect();
        state
            .pool_children
            .entry(pool)
            .or_default()
            .extend_from_slice(&buffers);
        Ok(buffers)
    }

    fn free_command_buffers(&self, _device: HostHandle, pool: HostHandle, buffers: &[HostHandle]) {
        self.free_pool_children(HandleKind::CommandBuffer, pool, buffers);
    }

    fn begin_command_buffer(&self, _command_buffer: HostHandle) -> VkResult<()> {
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: HostHandle) -> VkResult<()> {
        Ok(())
    }

    fn reset_command_buffer(&self, _command_buffer: HostHandle) -> VkResult<()> {
        Ok(())
    }

    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: HostHandle,
        buffer: HostHandle,
        image: HostHandle,
        _layout: vk::ImageLayout,
        regions: &[BufferImageCopy],
    ) {
        self.state.lock().calls.push(DriverCall::CopyBufferToImage {
            command_buffer,
            buffer,
            image,
            regions: regions.to_vec(),
        });
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: HostHandle,
        barriers: &[ImageMemoryBarrier<HostHandle>],
    ) {
        self.state.lock().calls.push(DriverCall::PipelineBarrier {
            command_buffer,
            images: barriers.iter().map(|b| b.image).collect(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsignaled_fence_times_out() {
        let driver = SoftHostDriver::new();
        let fence = driver
            .create_fence(HostHandle(1), &FenceCreateInfo::default())
            .unwrap();
        assert_eq!(
            driver.wait_for_fences(HostHandle(1), &[fence], true, 1_000_000),
            vk::Result::TIMEOUT
        );
        driver.signal_fence(fence);
        assert_eq!(
            driver.wait_for_fences(HostHandle(1), &[fence], true, 0),
            vk::Result::SUCCESS
        );
    }

    #[test]
    fn compressed_formats_can_be_disabled() {
        let driver = SoftHostDriver::new().without_compressed_textures();
        let props = driver
            .physical_device_format_properties(HostHandle(1), vk::Format::ETC2_R8G8B8_UNORM_BLOCK);
        assert!(props.is_empty());
        let props =
            driver.physical_device_format_properties(HostHandle(1), vk::Format::R8G8B8A8_UNORM);
        assert!(!props.is_empty());
    }

    #[test]
    fn memory_reads_are_bounds_checked() {
        let driver = SoftHostDriver::new();
        let memory = driver
            .allocate_memory(
                HostHandle(1),
                &MemoryAllocateInfo {
                    size: 8,
                    memory_type_index: 0,
                    property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
                },
            )
            .unwrap();
        driver.write_memory(HostHandle(1), memory, 4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        driver.read_memory(HostHandle(1), memory, 4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(
            driver.read_memory(HostHandle(1), memory, 6, &mut out),
            Err(vk::Result::ERROR_MEMORY_MAP_FAILED)
        );
    }
}
