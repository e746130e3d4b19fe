mod common;

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use vkbridge_host::driver::{
    BufferCreateInfo, BufferImageCopy, DescriptorImageWrite, DescriptorPoolCreateInfo, DescriptorSetLayoutBinding,
    DescriptorSetLayoutCreateInfo, DriverCall, Extent3d, FenceCreateInfo, ImageCreateInfo, ImageViewCreateInfo,
    MemoryAllocateInfo, SamplerCreateInfo, SoftHostDriver, SubmitInfo,
};
use vkbridge_host::emulation::{CompressedFormat, CpuDecompressor};
use vkbridge_host::{BoxedHandle, HandleKind, HostConfig, HostError};

/// Decoder that writes each input's first byte to every texel and records the block data.
#[derive(Default)]
struct SplatDecoder {
    inputs: Mutex<Vec<Vec<u8>>>,
}

impl CpuDecompressor for SplatDecoder {
    fn available(&self) -> bool {
        true
    }

    fn supports(&self, format: &CompressedFormat) -> bool {
        format.block_extent() == (4, 4)
    }

    fn decompress(
        &self,
        _format: &CompressedFormat,
        _width: u32,
        _height: u32,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<(), i32> {
        self.inputs.lock().push(input.to_vec());
        output.fill(input.first().copied().unwrap_or(0));
        Ok(())
    }

    fn error_string(&self, code: i32) -> String {
        format!("splat decoder error {code}")
    }
}

#[test]
fn compressed_upload_on_a_device_without_compression() {
    let decoder = Arc::new(SplatDecoder::default());
    let host = common::host_with(
        SoftHostDriver::new().without_compressed_textures(),
        HostConfig::default(),
        decoder.clone(),
    );
    let registry = &host.registry;

    // The guest sees ETC2 as supported even though the host lacks it.
    let physical_device = registry.enumerate_physical_devices(host.instance).expect("enumerate")[0];
    let features = registry.physical_device_features(physical_device).expect("features");
    assert!(features.texture_compression_etc2);
    let props = registry
        .physical_device_format_properties(physical_device, vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK)
        .expect("format properties");
    assert!(props
        .optimal_tiling_features
        .contains(vk::FormatFeatureFlags::SAMPLED_IMAGE));

    // 8x8 ETC2 RGBA: 2x2 blocks of 16 bytes.
    let format = vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK;
    let image = registry
        .create_image(host.device, &ImageCreateInfo::new_2d(format, 8, 8))
        .expect("create image");
    assert!(registry.is_image_emulated(image).expect("image is live"));
    assert_eq!(registry.shadow_object_count(), 2);

    let blocks: Vec<u8> = (0..64).map(|i| i as u8 + 1).collect();
    let buffer = registry
        .create_buffer(
            host.device,
            &BufferCreateInfo {
                size: blocks.len() as u64,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
            },
        )
        .expect("create buffer");
    let memory = registry
        .allocate_memory(
            host.device,
            &MemoryAllocateInfo {
                size: blocks.len() as u64,
                memory_type_index: 1,
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            },
        )
        .expect("allocate memory");
    registry
        .bind_buffer_memory(host.device, buffer, memory, 0)
        .expect("bind buffer");
    registry.write_memory(memory, 0, &blocks).expect("write blocks");

    let pool = registry
        .create_command_pool(host.device, &Default::default())
        .expect("command pool");
    let cb = registry.allocate_command_buffers(host.device, pool, 1).expect("allocate")[0];
    registry.begin_command_buffer(cb).expect("begin");
    host.driver.clear_calls();
    registry
        .cmd_copy_buffer_to_image(
            cb,
            buffer,
            image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[BufferImageCopy {
                layer_count: 1,
                image_extent: Extent3d::new(8, 8, 1),
                ..Default::default()
            }],
        )
        .expect("copy");
    registry.end_command_buffer(cb).expect("end");

    assert_eq!(*decoder.inputs.lock(), vec![blocks]);
    let primary = registry.handles().unbox(image).expect("image is live");
    let targets: Vec<_> = host
        .driver
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            DriverCall::CopyBufferToImage { image, regions, .. } => Some((image, regions[0].image_extent)),
            _ => None,
        })
        .collect();
    assert_eq!(targets.len(), 2, "decoded copy into the shadow, raw copy into the primary");
    assert_ne!(targets[0].0, primary);
    assert_eq!(targets[0].1, Extent3d::new(8, 8, 1));
    assert_eq!(targets[1], (primary, Extent3d::new(2, 2, 1)));
    assert_eq!(registry.shadow_object_count(), 4);

    let fence = registry
        .create_fence(host.device, &FenceCreateInfo::default())
        .expect("fence");
    registry
        .queue_submit(
            host.queue,
            &[SubmitInfo {
                command_buffers: vec![cb],
                ..Default::default()
            }],
            fence,
        )
        .expect("submit");
    assert_eq!(
        registry
            .wait_for_fences(host.device, &[fence], true, 1_000_000_000)
            .expect("wait"),
        vk::Result::SUCCESS
    );

    registry.destroy_device(host.device).expect("destroy device");
    assert_eq!(registry.shadow_object_count(), 0);
    assert_eq!(host.driver.live_objects(HandleKind::Image), 0);
    assert_eq!(host.driver.live_objects(HandleKind::Buffer), 0);
    assert_eq!(host.driver.live_objects(HandleKind::DeviceMemory), 0);
}

#[test]
fn guest_copy_regions_stay_inside_image_and_source() {
    let decoder = Arc::new(SplatDecoder::default());
    let host = common::host_with(
        SoftHostDriver::new().without_compressed_textures(),
        HostConfig::default(),
        decoder.clone(),
    );
    let registry = &host.registry;
    let image = registry
        .create_image(
            host.device,
            &ImageCreateInfo::new_2d(vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK, 8, 8),
        )
        .expect("create image");
    // Holds exactly the 2x2 blocks of level 0.
    let buffer = registry
        .create_buffer(
            host.device,
            &BufferCreateInfo {
                size: 64,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
            },
        )
        .expect("create buffer");
    let memory = registry
        .allocate_memory(
            host.device,
            &MemoryAllocateInfo {
                size: 64,
                memory_type_index: 1,
                property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE,
            },
        )
        .expect("allocate memory");
    registry
        .bind_buffer_memory(host.device, buffer, memory, 0)
        .expect("bind buffer");
    let pool = registry
        .create_command_pool(host.device, &Default::default())
        .expect("command pool");
    let cb = registry.allocate_command_buffers(host.device, pool, 1).expect("allocate")[0];

    let whole = BufferImageCopy {
        layer_count: 1,
        image_extent: Extent3d::new(8, 8, 1),
        ..Default::default()
    };
    host.driver.clear_calls();
    for region in [
        BufferImageCopy {
            layer_count: 0x10000,
            image_extent: Extent3d::new(8, 8, 0x10000),
            ..whole
        },
        BufferImageCopy {
            buffer_offset: 16,
            ..whole
        },
        BufferImageCopy {
            buffer_offset: u64::MAX - 8,
            ..whole
        },
        BufferImageCopy {
            image_extent: Extent3d::new(16, 16, 1),
            ..whole
        },
    ] {
        let result = registry.cmd_copy_buffer_to_image(cb, buffer, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[region]);
        assert!(matches!(result, Err(HostError::InvalidArgument(_))), "{region:?}: {result:?}");
    }
    assert!(decoder.inputs.lock().is_empty());
    assert!(!host
        .driver
        .calls()
        .iter()
        .any(|call| matches!(call, DriverCall::CopyBufferToImage { .. })));

    registry
        .cmd_copy_buffer_to_image(cb, buffer, image, vk::ImageLayout::TRANSFER_DST_OPTIMAL, &[whole])
        .expect("in-bounds copy");
    assert_eq!(decoder.inputs.lock().len(), 1);
}

fn descriptor_set(host: &common::Host) -> BoxedHandle {
    let layout = host
        .registry
        .create_descriptor_set_layout(
            host.device,
            &DescriptorSetLayoutCreateInfo {
                bindings: vec![DescriptorSetLayoutBinding {
                    binding: 0,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: 2,
                }],
            },
        )
        .expect("layout");
    let pool = host
        .registry
        .create_descriptor_pool(
            host.device,
            &DescriptorPoolCreateInfo {
                max_sets: 1,
                pool_sizes: vec![(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2)],
                free_descriptor_set: false,
            },
        )
        .expect("descriptor pool");
    host.registry
        .allocate_descriptor_sets(host.device, pool, &[layout])
        .expect("allocate set")[0]
}

#[test]
fn opaque_formats_sample_with_an_opaque_border() {
    let host = common::host(SoftHostDriver::new().without_compressed_textures());
    let registry = &host.registry;
    let set = descriptor_set(&host);

    let view_of = |format| {
        let image = registry
            .create_image(host.device, &ImageCreateInfo::new_2d(format, 16, 16))
            .expect("image");
        registry
            .create_image_view(host.device, image, &ImageViewCreateInfo::new_2d(format))
            .expect("view")
    };
    let opaque = view_of(vk::Format::ETC2_R8G8B8_UNORM_BLOCK);
    let translucent = view_of(vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK);

    let sampler = registry
        .create_sampler(host.device, &SamplerCreateInfo::default())
        .expect("sampler");
    let host_sampler = registry.handles().unbox(sampler).expect("sampler is live");
    let write = |element, image_view| DescriptorImageWrite {
        dst_set: set,
        binding: 0,
        array_element: element,
        descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        sampler,
        image_view,
        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
    };

    host.driver.clear_calls();
    registry
        .update_descriptor_sets(host.device, &[write(0, opaque), write(1, translucent)])
        .expect("update");
    let written: Vec<_> = host
        .driver
        .calls()
        .into_iter()
        .find_map(|call| match call {
            DriverCall::UpdateDescriptorSets(writes) => Some(writes.iter().map(|w| w.sampler).collect()),
            _ => None,
        })
        .expect("descriptor update reached the driver");

    assert_ne!(written[0], host_sampler);
    assert_eq!(
        host.driver.sampler_info(written[0]).map(|info| info.border_color),
        Some(vk::BorderColor::FLOAT_OPAQUE_BLACK)
    );
    assert_eq!(written[1], host_sampler);

    registry.destroy_sampler(host.device, sampler).expect("destroy sampler");
    assert_eq!(host.driver.live_objects(HandleKind::Sampler), 0);
}
