//! Boundary between the host layer and the real host driver.
//!
//! [`HostDriver`] stands in for a populated dispatch table; how the table gets populated (loader
//! lookup, layers) is somebody else's problem. Every boxed guest object carries a
//! [`DispatchTable`] capability and every host call site goes through it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;

mod soft;
mod types;

pub use soft::{DriverCall, SoftHostDriver};
pub use types::*;

/// Host entry points the layer issues.
///
/// Methods take already-unboxed host handles. Implementations must be callable from any
/// thread; external synchronization (one submitter per queue) is provided by the caller.
pub trait HostDriver: Send + Sync {
    // Instance level.
    fn instance_extensions(&self) -> Vec<String>;
    fn create_instance(&self, info: &InstanceCreateInfo) -> VkResult<HostHandle>;
    fn destroy_instance(&self, instance: HostHandle);
    fn enumerate_physical_devices(&self, instance: HostHandle) -> VkResult<Vec<HostHandle>>;
    fn physical_device_features(&self, physical_device: HostHandle) -> DeviceFeatures;
    fn physical_device_format_properties(
        &self,
        physical_device: HostHandle,
        format: vk::Format,
    ) -> FormatProperties;
    fn physical_device_queue_families(&self, physical_device: HostHandle)
        -> Vec<QueueFamilyProperties>;
    fn device_extensions(&self, physical_device: HostHandle) -> Vec<String>;

    // Device level.
    fn create_device(
        &self,
        physical_device: HostHandle,
        info: &DeviceCreateInfo,
    ) -> VkResult<HostHandle>;
    fn destroy_device(&self, device: HostHandle);
    fn device_wait_idle(&self, device: HostHandle) -> VkResult<()>;
    fn get_device_queue(&self, device: HostHandle, family_index: u32, queue_index: u32)
        -> HostHandle;
    fn queue_submit(
        &self,
        queue: HostHandle,
        submits: &[SubmitInfo<HostHandle>],
        fence: HostHandle,
    ) -> VkResult<()>;
    fn queue_wait_idle(&self, queue: HostHandle) -> VkResult<()>;

    fn create_image(&self, device: HostHandle, info: &ImageCreateInfo) -> VkResult<HostHandle>;
    fn destroy_image(&self, device: HostHandle, image: HostHandle);
    fn create_image_view(
        &self,
        device: HostHandle,
        image: HostHandle,
        info: &ImageViewCreateInfo,
    ) -> VkResult<HostHandle>;
    fn destroy_image_view(&self, device: HostHandle, view: HostHandle);
    fn create_buffer(&self, device: HostHandle, info: &BufferCreateInfo) -> VkResult<HostHandle>;
    fn destroy_buffer(&self, device: HostHandle, buffer: HostHandle);

    fn allocate_memory(
        &self,
        device: HostHandle,
        info: &MemoryAllocateInfo,
    ) -> VkResult<HostHandle>;
    fn free_memory(&self, device: HostHandle, memory: HostHandle);
    /// Map the whole allocation and return the host address.
    fn map_memory(&self, device: HostHandle, memory: HostHandle) -> VkResult<u64>;
    fn unmap_memory(&self, device: HostHandle, memory: HostHandle);
    fn read_memory(
        &self,
        device: HostHandle,
        memory: HostHandle,
        offset: u64,
        dst: &mut [u8],
    ) -> VkResult<()>;
    fn write_memory(
        &self,
        device: HostHandle,
        memory: HostHandle,
        offset: u64,
        src: &[u8],
    ) -> VkResult<()>;
    fn bind_buffer_memory(
        &self,
        device: HostHandle,
        buffer: HostHandle,
        memory: HostHandle,
        offset: u64,
    ) -> VkResult<()>;
    fn bind_image_memory(
        &self,
        device: HostHandle,
        image: HostHandle,
        memory: HostHandle,
        offset: u64,
    ) -> VkResult<()>;

    fn create_sampler(&self, device: HostHandle, info: &SamplerCreateInfo)
        -> VkResult<HostHandle>;
    fn destroy_sampler(&self, device: HostHandle, sampler: HostHandle);
    fn create_semaphore(
        &self,
        device: HostHandle,
        info: &SemaphoreCreateInfo,
    ) -> VkResult<HostHandle>;
    fn destroy_semaphore(&self, device: HostHandle, semaphore: HostHandle);

    fn create_fence(&self, device: HostHandle, info: &FenceCreateInfo) -> VkResult<HostHandle>;
    fn destroy_fence(&self, device: HostHandle, fence: HostHandle);
    fn reset_fences(&self, device: HostHandle, fences: &[HostHandle]) -> VkResult<()>;
    /// `SUCCESS` when signaled, `NOT_READY` when pending, an error code otherwise.
    fn get_fence_status(&self, device: HostHandle, fence: HostHandle) -> vk::Result;
    /// `SUCCESS`, `TIMEOUT`, or an error code.
    fn wait_for_fences(
        &self,
        device: HostHandle,
        fences: &[HostHandle],
        wait_all: bool,
        timeout_ns: u64,
    ) -> vk::Result;

    fn create_descriptor_set_layout(
        &self,
        device: HostHandle,
        info: &DescriptorSetLayoutCreateInfo,
    ) -> VkResult<HostHandle>;
    fn destroy_descriptor_set_layout(&self, device: HostHandle, layout: HostHandle);
    fn create_descriptor_pool(
        &self,
        device: HostHandle,
        info: &DescriptorPoolCreateInfo,
    ) -> VkResult<HostHandle>;
    fn destroy_descriptor_pool(&self, device: HostHandle, pool: HostHandle);
    fn reset_descriptor_pool(&self, device: HostHandle, pool: HostHandle) -> VkResult<()>;
    fn allocate_descriptor_sets(
        &self,
        device: HostHandle,
        pool: HostHandle,
        layouts: &[HostHandle],
    ) -> VkResult<Vec<HostHandle>>;
    fn free_descriptor_sets(&self, device: HostHandle, pool: HostHandle, sets: &[HostHandle]);
    fn update_descriptor_sets(&self, device: HostHandle, writes: &[DescriptorImageWrite<HostHandle>]);

    fn create_shader_module(
        &self,
        device: HostHandle,
        info: &ShaderModuleCreateInfo,
    ) -> VkResult<HostHandle>;
    fn destroy_shader_module(&self, device: HostHandle, module: HostHandle);
    fn create_pipeline_cache(
        &self,
        device: HostHandle,
        info: &PipelineCacheCreateInfo,
    ) -> VkResult<HostHandle>;
    fn destroy_pipeline_cache(&self, device: HostHandle, cache: HostHandle);
    fn create_pipeline(
        &self,
        device: HostHandle,
        cache: HostHandle,
        info: &PipelineCreateInfo<HostHandle>,
    ) -> VkResult<HostHandle>;
    fn destroy_pipeline(&self, device: HostHandle, pipeline: HostHandle);
    fn create_render_pass(
        &self,
        device: HostHandle,
        info: &RenderPassCreateInfo,
    ) -> VkResult<HostHandle>;
    fn destroy_render_pass(&self, device: HostHandle, render_pass: HostHandle);
    fn create_framebuffer(
        &self,
        device: HostHandle,
        info: &FramebufferCreateInfo<HostHandle>,
    ) -> VkResult<HostHandle>;
    fn destroy_framebuffer(&self, device: HostHandle, framebuffer: HostHandle);

    fn create_command_pool(
        &self,
        device: HostHandle,
        info: &CommandPoolCreateInfo,
    ) -> VkResult<HostHandle>;
    fn destroy_command_pool(&self, device: HostHandle, pool: HostHandle);
    fn allocate_command_buffers(
        &self,
        device: HostHandle,
        pool: HostHandle,
        count: u32,
    ) -> VkResult<Vec<HostHandle>>;
    fn free_command_buffers(&self, device: HostHandle, pool: HostHandle, buffers: &[HostHandle]);
    fn begin_command_buffer(&self, command_buffer: HostHandle) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: HostHandle) -> VkResult<()>;
    fn reset_command_buffer(&self, command_buffer: HostHandle) -> VkResult<()>;
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: HostHandle,
        buffer: HostHandle,
        image: HostHandle,
        layout: vk::ImageLayout,
        regions: &[BufferImageCopy],
    );
    fn cmd_pipeline_barrier(
        &self,
        command_buffer: HostHandle,
        barriers: &[ImageMemoryBarrier<HostHandle>],
    );
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchLevel {
    Instance,
    Device,
}

static NEXT_DISPATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Dispatch capability carried with every boxed object.
///
/// Many handle records may share one table (every queue and command buffer of a device uses the
/// device's table), but exactly one record owns it and releases it when that record is removed.
pub struct DispatchTable {
    id: u64,
    level: DispatchLevel,
    driver: Arc<dyn HostDriver>,
    released: AtomicBool,
}

impl DispatchTable {
    pub fn new(level: DispatchLevel, driver: Arc<dyn HostDriver>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_DISPATCH_ID.fetch_add(1, Ordering::Relaxed),
            level,
            driver,
            released: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn level(&self) -> DispatchLevel {
        self.level
    }

    pub fn driver(&self) -> &dyn HostDriver {
        self.driver.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Mark the table released. Returns `false` if it already was.
    pub(crate) fn release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTable")
            .field("id", &self.id)
            .field("level", &self.level)
            .field("released", &self.is_released())
            .finish()
    }
}
