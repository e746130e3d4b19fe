//! Argument structs passed across the host driver seam.
//!
//! These carry only what the host layer inspects or rewrites. Structs that reference other
//! objects are generic over the handle type so the same shape serves both the guest-facing
//! registry calls (`BoxedHandle`) and the host driver calls (`HostHandle`).

use ash::vk;

/// Identity of an object owned by the host driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostHandle(pub u64);

impl HostHandle {
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent3d {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3d {
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Offset3d {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstanceCreateInfo {
    pub application_name: String,
    pub api_version: u32,
    pub enabled_extensions: Vec<String>,
}

/// The subset of physical-device features the host layer filters or emulates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub texture_compression_etc2: bool,
    pub texture_compression_astc_ldr: bool,
    pub texture_compression_bc: bool,
    pub sampler_anisotropy: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilyProperties {
    pub queue_flags: vk::QueueFlags,
    pub queue_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceQueueCreateInfo {
    pub family_index: u32,
    pub queue_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceCreateInfo {
    pub queue_create_infos: Vec<DeviceQueueCreateInfo>,
    pub enabled_extensions: Vec<String>,
    pub enabled_features: DeviceFeatures,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FormatProperties {
    pub linear_tiling_features: vk::FormatFeatureFlags,
    pub optimal_tiling_features: vk::FormatFeatureFlags,
    pub buffer_features: vk::FormatFeatureFlags,
}

impl FormatProperties {
    pub fn is_empty(&self) -> bool {
        self.linear_tiling_features.is_empty()
            && self.optimal_tiling_features.is_empty()
            && self.buffer_features.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageCreateInfo {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: Extent3d,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
}

impl ImageCreateInfo {
    pub fn new_2d(format: vk::Format, width: u32, height: u32) -> Self {
        Self {
            image_type: vk::ImageType::TYPE_2D,
            format,
            extent: Extent3d::new(width, height, 1),
            mip_levels: 1,
            array_layers: 1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            flags: vk::ImageCreateFlags::empty(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubresourceRange {
    pub base_mip_level: u32,
    pub level_count: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
}

impl Default for SubresourceRange {
    fn default() -> Self {
        Self {
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageViewCreateInfo {
    pub view_type: vk::ImageViewType,
    pub format: vk::Format,
    /// Swizzle applied to the alpha channel.
    pub alpha_swizzle: vk::ComponentSwizzle,
    pub subresource: SubresourceRange,
}

impl ImageViewCreateInfo {
    pub fn new_2d(format: vk::Format) -> Self {
        Self {
            view_type: vk::ImageViewType::TYPE_2D,
            format,
            alpha_swizzle: vk::ComponentSwizzle::IDENTITY,
            subresource: SubresourceRange::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCreateInfo {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryAllocateInfo {
    pub size: u64,
    pub memory_type_index: u32,
    pub property_flags: vk::MemoryPropertyFlags,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerCreateInfo {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    pub border_color: vk::BorderColor,
    pub anisotropy_enable: bool,
    pub max_anisotropy: f32,
}

impl Default for SamplerCreateInfo {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::CLAMP_TO_BORDER,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
            anisotropy_enable: false,
            max_anisotropy: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FenceCreateInfo {
    pub flags: vk::FenceCreateFlags,
    /// Created with an external-handle export chain.
    pub exportable: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SemaphoreCreateInfo {
    pub exportable: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorSetLayoutCreateInfo {
    pub bindings: Vec<DescriptorSetLayoutBinding>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DescriptorPoolCreateInfo {
    pub max_sets: u32,
    pub pool_sizes: Vec<(vk::DescriptorType, u32)>,
    pub free_descriptor_set: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorImageWrite<H> {
    pub dst_set: H,
    pub binding: u32,
    pub array_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub sampler: H,
    pub image_view: H,
    pub image_layout: vk::ImageLayout,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShaderModuleCreateInfo {
    pub code: Vec<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineCacheCreateInfo {
    pub initial_data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineCreateInfo<H> {
    pub bind_point: vk::PipelineBindPoint,
    pub shader_modules: Vec<H>,
    /// Null for compute pipelines.
    pub render_pass: H,
    pub subpass: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RenderPassCreateInfo {
    pub attachment_formats: Vec<vk::Format>,
    pub subpass_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramebufferCreateInfo<H> {
    pub render_pass: H,
    pub attachments: Vec<H>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandPoolCreateInfo {
    pub queue_family_index: u32,
    pub flags: vk::CommandPoolCreateFlags,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    /// Texels per row in the buffer; 0 means tightly packed.
    pub buffer_row_length: u32,
    /// Rows per image slice in the buffer; 0 means tightly packed.
    pub buffer_image_height: u32,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub image_offset: Offset3d,
    pub image_extent: Extent3d,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageMemoryBarrier<H> {
    pub image: H,
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub subresource: SubresourceRange,
}

impl<H> ImageMemoryBarrier<H> {
    /// The same barrier applied to a different image.
    pub fn with_image<T>(&self, image: T) -> ImageMemoryBarrier<T> {
        ImageMemoryBarrier {
            image,
            src_access_mask: self.src_access_mask,
            dst_access_mask: self.dst_access_mask,
            old_layout: self.old_layout,
            new_layout: self.new_layout,
            subresource: self.subresource,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmitInfo<H> {
    pub wait_semaphores: Vec<H>,
    pub command_buffers: Vec<H>,
    pub signal_semaphores: Vec<H>,
}

impl<H> Default for SubmitInfo<H> {
    fn default() -> Self {
        Self {
            wait_semaphores: Vec::new(),
            command_buffers: Vec::new(),
            signal_semaphores: Vec::new(),
        }
    }
}

impl<H: Copy> SubmitInfo<H> {
    pub fn try_map<T, E>(&self, mut f: impl FnMut(H) -> Result<T, E>) -> Result<SubmitInfo<T>, E> {
        Ok(SubmitInfo {
            wait_semaphores: self.wait_semaphores.iter().map(|&h| f(h)).collect::<Result<_, _>>()?,
            command_buffers: self.command_buffers.iter().map(|&h| f(h)).collect::<Result<_, _>>()?,
            signal_semaphores: self
                .signal_semaphores
                .iter()
                .map(|&h| f(h))
                .collect::<Result<_, _>>()?,
        })
    }
}
