//! Per-device compatibility emulation for compressed texture formats.
//!
//! A device that cannot sample ETC2/EAC or ASTC still advertises them to the guest. Images in
//! those formats are backed by a raw-block image in a size-compatible uncompressed format plus a
//! same-size shadow image in a decompressed format; guest uploads are decoded on the CPU into the
//! shadow and guest views sample the shadow.

mod compressed;
mod decompress;

pub use compressed::{
    block_region, mip_extent, region_source_layout, shadow_image_info, shadow_size, shadow_subresource_offset,
    size_compatible_image_info, CompressedFamily, CompressedFormat,
};
pub use decompress::{CpuDecompressor, NoCpuDecompressor};

use ash::vk;
use bitflags::bitflags;
use tracing::debug;

use crate::config::HostConfig;
use crate::driver::{DeviceFeatures, FormatProperties, HostDriver, HostHandle};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct EmulationFlags: u32 {
        const ETC2 = 1 << 0;
        const ASTC = 1 << 1;
    }
}

/// What to do with an image of a given format on a given device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmulationDecision {
    Native,
    Emulated(&'static CompressedFormat),
}

/// Emulation decisions for one physical or logical device.
///
/// Computed once from host capability queries and never changed afterwards, so every decision
/// derived from it is stable for the device's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceEmulation {
    flags: EmulationFlags,
}

const EMULATED_FEATURE_MASK: vk::FormatFeatureFlags = vk::FormatFeatureFlags::from_raw(
    vk::FormatFeatureFlags::SAMPLED_IMAGE.as_raw()
        | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR.as_raw()
        | vk::FormatFeatureFlags::BLIT_SRC.as_raw()
        | vk::FormatFeatureFlags::TRANSFER_SRC.as_raw()
        | vk::FormatFeatureFlags::TRANSFER_DST.as_raw(),
);

impl DeviceEmulation {
    pub fn from_flags(flags: EmulationFlags) -> Self {
        Self { flags }
    }

    pub fn compute(driver: &dyn HostDriver, physical_device: HostHandle, config: &HostConfig) -> Self {
        let features = driver.physical_device_features(physical_device);
        let mut flags = EmulationFlags::empty();
        if config.enable_etc2_emulation && !features.texture_compression_etc2 {
            flags |= EmulationFlags::ETC2;
        }
        if config.enable_astc_emulation && !features.texture_compression_astc_ldr {
            flags |= EmulationFlags::ASTC;
        }
        debug!(?physical_device, ?flags, "compressed texture emulation");
        Self { flags }
    }

    pub fn flags(&self) -> EmulationFlags {
        self.flags
    }

    pub fn decide(&self, format: vk::Format) -> EmulationDecision {
        let Some(compressed) = CompressedFormat::from_vk(format) else {
            return EmulationDecision::Native;
        };
        let emulated = match compressed.family() {
            CompressedFamily::Etc2 | CompressedFamily::Eac => self.flags.contains(EmulationFlags::ETC2),
            CompressedFamily::Astc => self.flags.contains(EmulationFlags::ASTC),
        };
        if emulated {
            EmulationDecision::Emulated(compressed)
        } else {
            EmulationDecision::Native
        }
    }

    /// Features as the guest should see them: emulated families report as supported.
    pub fn advertised_features(&self, host: DeviceFeatures) -> DeviceFeatures {
        DeviceFeatures {
            texture_compression_etc2: host.texture_compression_etc2
                || self.flags.contains(EmulationFlags::ETC2),
            texture_compression_astc_ldr: host.texture_compression_astc_ldr
                || self.flags.contains(EmulationFlags::ASTC),
            ..host
        }
    }

    /// Features to actually request from the host: emulated families are stripped.
    pub fn filter_requested_features(&self, requested: DeviceFeatures) -> DeviceFeatures {
        DeviceFeatures {
            texture_compression_etc2: requested.texture_compression_etc2
                && !self.flags.contains(EmulationFlags::ETC2),
            texture_compression_astc_ldr: requested.texture_compression_astc_ldr
                && !self.flags.contains(EmulationFlags::ASTC),
            ..requested
        }
    }

    /// Format properties the guest sees for `format`.
    pub fn format_properties(
        &self,
        driver: &dyn HostDriver,
        physical_device: HostHandle,
        format: vk::Format,
    ) -> FormatProperties {
        match self.decide(format) {
            EmulationDecision::Native => driver.physical_device_format_properties(physical_device, format),
            EmulationDecision::Emulated(compressed) => {
                let props = driver
                    .physical_device_format_properties(physical_device, compressed.decompressed_format());
                FormatProperties {
                    linear_tiling_features: props.linear_tiling_features & EMULATED_FEATURE_MASK,
                    optimal_tiling_features: props.optimal_tiling_features & EMULATED_FEATURE_MASK,
                    buffer_features: vk::FormatFeatureFlags::empty(),
                }
            }
        }
    }
}
