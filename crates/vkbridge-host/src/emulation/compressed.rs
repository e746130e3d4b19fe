//! Block-compressed formats the host can emulate.

use ash::vk;

use crate::driver::{BufferImageCopy, Extent3d, ImageCreateInfo, Offset3d};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompressedFamily {
    Etc2,
    Eac,
    Astc,
}

/// Static description of one block-compressed format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompressedFormat {
    format: vk::Format,
    family: CompressedFamily,
    block_width: u32,
    block_height: u32,
    block_bytes: u32,
    decompressed: vk::Format,
    decompressed_texel_bytes: u32,
}

const fn etc2(format: vk::Format, block_bytes: u32, decompressed: vk::Format) -> CompressedFormat {
    CompressedFormat {
        format,
        family: CompressedFamily::Etc2,
        block_width: 4,
        block_height: 4,
        block_bytes,
        decompressed,
        decompressed_texel_bytes: 4,
    }
}

const fn eac(
    format: vk::Format,
    block_bytes: u32,
    decompressed: vk::Format,
    texel_bytes: u32,
) -> CompressedFormat {
    CompressedFormat {
        format,
        family: CompressedFamily::Eac,
        block_width: 4,
        block_height: 4,
        block_bytes,
        decompressed,
        decompressed_texel_bytes: texel_bytes,
    }
}

const fn astc(format: vk::Format, w: u32, h: u32, srgb: bool) -> CompressedFormat {
    CompressedFormat {
        format,
        family: CompressedFamily::Astc,
        block_width: w,
        block_height: h,
        block_bytes: 16,
        decompressed: if srgb {
            vk::Format::R8G8B8A8_SRGB
        } else {
            vk::Format::R8G8B8A8_UNORM
        },
        decompressed_texel_bytes: 4,
    }
}

impl CompressedFormat {
    pub const ALL: &'static [CompressedFormat] = &[
        etc2(vk::Format::ETC2_R8G8B8_UNORM_BLOCK, 8, vk::Format::R8G8B8A8_UNORM),
        etc2(vk::Format::ETC2_R8G8B8_SRGB_BLOCK, 8, vk::Format::R8G8B8A8_SRGB),
        etc2(vk::Format::ETC2_R8G8B8A1_UNORM_BLOCK, 8, vk::Format::R8G8B8A8_UNORM),
        etc2(vk::Format::ETC2_R8G8B8A1_SRGB_BLOCK, 8, vk::Format::R8G8B8A8_SRGB),
        etc2(vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK, 16, vk::Format::R8G8B8A8_UNORM),
        etc2(vk::Format::ETC2_R8G8B8A8_SRGB_BLOCK, 16, vk::Format::R8G8B8A8_SRGB),
        eac(vk::Format::EAC_R11_UNORM_BLOCK, 8, vk::Format::R16_UNORM, 2),
        eac(vk::Format::EAC_R11_SNORM_BLOCK, 8, vk::Format::R16_SNORM, 2),
        eac(vk::Format::EAC_R11G11_UNORM_BLOCK, 16, vk::Format::R16G16_UNORM, 4),
        eac(vk::Format::EAC_R11G11_SNORM_BLOCK, 16, vk::Format::R16G16_SNORM, 4),
        astc(vk::Format::ASTC_4X4_UNORM_BLOCK, 4, 4, false),
        astc(vk::Format::ASTC_4X4_SRGB_BLOCK, 4, 4, true),
        astc(vk::Format::ASTC_5X4_UNORM_BLOCK, 5, 4, false),
        astc(vk::Format::ASTC_5X4_SRGB_BLOCK, 5, 4, true),
        astc(vk::Format::ASTC_5X5_UNORM_BLOCK, 5, 5, false),
        astc(vk::Format::ASTC_5X5_SRGB_BLOCK, 5, 5, true),
        astc(vk::Format::ASTC_6X5_UNORM_BLOCK, 6, 5, false),
        astc(vk::Format::ASTC_6X5_SRGB_BLOCK, 6, 5, true),
        astc(vk::Format::ASTC_6X6_UNORM_BLOCK, 6, 6, false),
        astc(vk::Format::ASTC_6X6_SRGB_BLOCK, 6, 6, true),
        astc(vk::Format::ASTC_8X5_UNORM_BLOCK, 8, 5, false),
        astc(vk::Format::ASTC_8X5_SRGB_BLOCK, 8, 5, true),
        astc(vk::Format::ASTC_8X6_UNORM_BLOCK, 8, 6, false),
        astc(vk::Format::ASTC_8X6_SRGB_BLOCK, 8, 6, true),
        astc(vk::Format::ASTC_8X8_UNORM_BLOCK, 8, 8, false),
        astc(vk::Format::ASTC_8X8_SRGB_BLOCK, 8, 8, true),
        astc(vk::Format::ASTC_10X5_UNORM_BLOCK, 10, 5, false),
        astc(vk::Format::ASTC_10X5_SRGB_BLOCK, 10, 5, true),
        astc(vk::Format::ASTC_10X6_UNORM_BLOCK, 10, 6, false),
        astc(vk::Format::ASTC_10X6_SRGB_BLOCK, 10, 6, true),
        astc(vk::Format::ASTC_10X8_UNORM_BLOCK, 10, 8, false),
        astc(vk::Format::ASTC_10X8_SRGB_BLOCK, 10, 8, true),
        astc(vk::Format::ASTC_10X10_UNORM_BLOCK, 10, 10, false),
        astc(vk::Format::ASTC_10X10_SRGB_BLOCK, 10, 10, true),
        astc(vk::Format::ASTC_12X10_UNORM_BLOCK, 12, 10, false),
        astc(vk::Format::ASTC_12X10_SRGB_BLOCK, 12, 10, true),
        astc(vk::Format::ASTC_12X12_UNORM_BLOCK, 12, 12, false),
        astc(vk::Format::ASTC_12X12_SRGB_BLOCK, 12, 12, true),
    ];

    pub fn from_vk(format: vk::Format) -> Option<&'static CompressedFormat> {
        Self::ALL.iter().find(|f| f.format == format)
    }

    pub fn vk_format(&self) -> vk::Format {
        self.format
    }

    pub fn family(&self) -> CompressedFamily {
        self.family
    }

    pub fn block_extent(&self) -> (u32, u32) {
        (self.block_width, self.block_height)
    }

    pub fn block_bytes(&self) -> u32 {
        self.block_bytes
    }

    /// Format the shadow image is created in and the decompressor writes.
    pub fn decompressed_format(&self) -> vk::Format {
        self.decompressed
    }

    pub fn decompressed_texel_bytes(&self) -> u32 {
        self.decompressed_texel_bytes
    }

    /// Uncompressed format with one texel per block, used to hold the raw blocks.
    pub fn size_compatible_format(&self) -> vk::Format {
        match (self.family, self.block_bytes) {
            (CompressedFamily::Eac, 8) => vk::Format::R32G32_UINT,
            (_, 8) => vk::Format::R16G16B16A16_UINT,
            _ => vk::Format::R32G32B32A32_UINT,
        }
    }

    /// ETC2 RGB8 has no alpha channel, yet samplers with a transparent border expect one.
    pub fn needs_emulated_alpha(&self) -> bool {
        matches!(
            self.format,
            vk::Format::ETC2_R8G8B8_UNORM_BLOCK | vk::Format::ETC2_R8G8B8_SRGB_BLOCK
        )
    }

    pub fn blocks_wide(&self, texels: u32) -> u32 {
        texels.div_ceil(self.block_width)
    }

    pub fn blocks_high(&self, texels: u32) -> u32 {
        texels.div_ceil(self.block_height)
    }

    /// Bytes occupied by a tightly packed `width x height` region.
    pub fn compressed_size(&self, width: u32, height: u32) -> u64 {
        u64::from(self.blocks_wide(width))
            .saturating_mul(u64::from(self.blocks_high(height)))
            .saturating_mul(u64::from(self.block_bytes))
    }

    pub fn decompressed_size(&self, width: u32, height: u32) -> u64 {
        u64::from(width)
            .saturating_mul(u64::from(height))
            .saturating_mul(u64::from(self.decompressed_texel_bytes))
    }
}

/// Extent of mip `level`, never smaller than one texel.
pub fn mip_extent(extent: Extent3d, level: u32) -> Extent3d {
    let shrink = |v: u32| v.checked_shr(level).unwrap_or(0).max(1);
    Extent3d::new(shrink(extent.width), shrink(extent.height), shrink(extent.depth))
}

/// Bytes of one array layer of mip `level` once decompressed.
fn shadow_layer_size(format: &CompressedFormat, info: &ImageCreateInfo, level: u32) -> u64 {
    let extent = mip_extent(info.extent, level);
    format
        .decompressed_size(extent.width, extent.height)
        .saturating_mul(u64::from(extent.depth))
}

/// Offset of `(level, layer)` in a linear copy of the decompressed image.
///
/// Mip levels are stored in order, each holding its array layers back to back. Sizes saturate,
/// so an image too large to address yields an offset no allocation can satisfy.
pub fn shadow_subresource_offset(format: &CompressedFormat, info: &ImageCreateInfo, level: u32, layer: u32) -> u64 {
    let layers = u64::from(info.array_layers.max(1));
    (0..level)
        .map(|l| shadow_layer_size(format, info, l).saturating_mul(layers))
        .fold(0u64, u64::saturating_add)
        .saturating_add(shadow_layer_size(format, info, level).saturating_mul(u64::from(layer)))
}

/// Bytes of a fully populated decompressed shadow image.
pub fn shadow_size(format: &CompressedFormat, info: &ImageCreateInfo) -> u64 {
    shadow_subresource_offset(format, info, info.mip_levels.max(1), 0)
}

/// Create info for the primary image, which stores raw blocks one texel per block.
pub fn size_compatible_image_info(format: &CompressedFormat, guest: &ImageCreateInfo) -> ImageCreateInfo {
    ImageCreateInfo {
        format: format.size_compatible_format(),
        extent: Extent3d::new(
            format.blocks_wide(guest.extent.width),
            format.blocks_high(guest.extent.height),
            guest.extent.depth,
        ),
        usage: guest.usage | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
        ..*guest
    }
}

/// Create info for the shadow image: same size as the guest asked for, decompressed format.
pub fn shadow_image_info(format: &CompressedFormat, guest: &ImageCreateInfo) -> ImageCreateInfo {
    ImageCreateInfo {
        format: format.decompressed_format(),
        usage: guest.usage | vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        ..*guest
    }
}

/// Rewrite a texel-addressed copy region into the block-addressed primary image.
pub fn block_region(format: &CompressedFormat, region: &BufferImageCopy) -> BufferImageCopy {
    let (bw, bh) = format.block_extent();
    BufferImageCopy {
        buffer_row_length: format.blocks_wide(region.buffer_row_length),
        buffer_image_height: format.blocks_high(region.buffer_image_height),
        image_offset: Offset3d {
            x: region.image_offset.x / bw as i32,
            y: region.image_offset.y / bh as i32,
            z: region.image_offset.z,
        },
        image_extent: Extent3d::new(
            format.blocks_wide(region.image_extent.width),
            format.blocks_high(region.image_extent.height),
            region.image_extent.depth,
        ),
        ..*region
    }
}

/// Source footprint of one layer of a copy region: `(row_pitch, rows, layer_size)` in bytes.
pub fn region_source_layout(format: &CompressedFormat, region: &BufferImageCopy) -> (u64, u64, u64) {
    let row_texels = if region.buffer_row_length == 0 {
        region.image_extent.width
    } else {
        region.buffer_row_length
    };
    let image_rows = if region.buffer_image_height == 0 {
        region.image_extent.height
    } else {
        region.buffer_image_height
    };
    let row_pitch = u64::from(format.blocks_wide(row_texels)) * u64::from(format.block_bytes());
    let rows = u64::from(format.blocks_high(image_rows));
    (row_pitch, rows, row_pitch.saturating_mul(rows))
}
