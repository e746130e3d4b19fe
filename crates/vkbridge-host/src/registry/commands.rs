use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace, warn};

use super::entries::{CommandBufferEntry, CommandPoolEntry, EmulatedImage, RegistryState};
use super::Registry;
use crate::driver::{
    BufferCreateInfo, BufferImageCopy, CommandPoolCreateInfo, DispatchTable, HostDriver, HostHandle,
    ImageCreateInfo, ImageMemoryBarrier, MemoryAllocateInfo, SubmitInfo,
};
use crate::emulation::{
    block_region, mip_extent, region_source_layout, shadow_size, shadow_subresource_offset, CompressedFormat,
};
use crate::error::{fatal, HostError, HostResult};
use crate::handle::{BoxedHandle, HandleKind};

/// Array layers times depth slices covered by a region.
fn region_slices(region: &BufferImageCopy) -> u64 {
    u64::from(region.layer_count) * u64::from(region.image_extent.depth)
}

/// Reject a copy region that reaches outside `image`, or, when the image is compressed, outside
/// the `buffer_size` bytes of the source buffer.
fn check_copy_region(
    image: &ImageCreateInfo,
    format: Option<&CompressedFormat>,
    buffer_size: u64,
    region: &BufferImageCopy,
) -> HostResult<()> {
    if region.mip_level >= image.mip_levels {
        return Err(HostError::InvalidArgument("copy region names a missing mip level"));
    }
    let layers_end = region.base_array_layer.checked_add(region.layer_count);
    if region.layer_count == 0 || layers_end.map_or(true, |end| end > image.array_layers) {
        return Err(HostError::InvalidArgument("copy region names missing array layers"));
    }

    let level = mip_extent(image.extent, region.mip_level);
    let (block_width, block_height) = format.map_or((1, 1), CompressedFormat::block_extent);
    let axes = [
        (region.image_offset.x, region.image_extent.width, level.width, block_width),
        (region.image_offset.y, region.image_extent.height, level.height, block_height),
        (region.image_offset.z, region.image_extent.depth, level.depth, 1),
    ];
    for (offset, extent, limit, block) in axes {
        let start = u32::try_from(offset).map_err(|_| HostError::InvalidArgument("negative copy offset"))?;
        let end = start.checked_add(extent);
        if extent == 0 || end.map_or(true, |end| end > limit) {
            return Err(HostError::InvalidArgument("copy region exceeds the image"));
        }
        // Partial blocks are only allowed where the region meets the edge of the level.
        if start % block != 0 || (extent % block != 0 && end != Some(limit)) {
            return Err(HostError::InvalidArgument("copy region is not block aligned"));
        }
    }
    if (region.buffer_row_length != 0 && region.buffer_row_length < region.image_extent.width)
        || (region.buffer_image_height != 0 && region.buffer_image_height < region.image_extent.height)
    {
        return Err(HostError::InvalidArgument("copy region rows overlap in the buffer"));
    }

    let Some(format) = format else {
        return Ok(());
    };
    let (row_pitch, _, layer_size) = region_source_layout(format, region);
    let packed_row = u64::from(format.blocks_wide(region.image_extent.width)) * u64::from(format.block_bytes());
    let rows = u64::from(format.blocks_high(region.image_extent.height));
    let end = (region_slices(region) - 1)
        .checked_mul(layer_size)
        .and_then(|last_slice| last_slice.checked_add((rows - 1).checked_mul(row_pitch)?))
        .and_then(|last_row| last_row.checked_add(packed_row))
        .and_then(|len| len.checked_add(region.buffer_offset));
    if end.map_or(true, |end| end > buffer_size) {
        return Err(HostError::InvalidArgument("copy region exceeds the source buffer"));
    }
    Ok(())
}

/// Source bytes of one checked copy region, gathered into tightly packed block rows per slice.
fn gather_blocks(
    driver: &dyn HostDriver,
    device: HostHandle,
    (memory, base): (HostHandle, u64),
    format: &CompressedFormat,
    region: &BufferImageCopy,
) -> HostResult<Vec<u8>> {
    let too_large = || HostError::InvalidArgument("copy region too large");
    let (row_pitch, _rows, layer_size) = region_source_layout(format, region);
    let packed_row = u64::from(format.blocks_wide(region.image_extent.width)) * u64::from(format.block_bytes());
    let rows = u64::from(format.blocks_high(region.image_extent.height));
    let slices = region_slices(region);

    let total = packed_row
        .checked_mul(rows)
        .and_then(|bytes| bytes.checked_mul(slices))
        .and_then(|bytes| usize::try_from(bytes).ok())
        .ok_or_else(too_large)?;
    let row_len = usize::try_from(packed_row).map_err(|_| too_large())?;
    let mut out = Vec::new();
    out.try_reserve_exact(total).map_err(|_| too_large())?;
    out.resize(total, 0);

    let start = base.checked_add(region.buffer_offset).ok_or_else(too_large)?;
    let mut chunks = out.chunks_exact_mut(row_len.max(1));
    for slice in 0..slices {
        for row in 0..rows {
            // In range: the region was checked against the buffer, and the buffer against its memory.
            let offset = start + slice * layer_size + row * row_pitch;
            if let Some(dst) = chunks.next() {
                driver.read_memory(device, memory, offset, dst)?;
            }
        }
    }
    Ok(out)
}

impl Registry {
    pub fn create_command_pool(&self, device: BoxedHandle, info: &CommandPoolCreateInfo) -> HostResult<BoxedHandle> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let mut state = self.lock();
        let pool = dispatch.driver().create_command_pool(host_device, info)?;
        let boxed = self.box_child(HandleKind::CommandPool, pool, &dispatch);
        state.command_pools.insert(
            pool,
            CommandPoolEntry {
                boxed,
                device: host_device,
                buffers: Vec::new(),
            },
        );
        Ok(boxed)
    }

    fn checked_command_pool(
        state: &RegistryState,
        pool: BoxedHandle,
        host_pool: HostHandle,
        host_device: HostHandle,
    ) -> HostResult<()> {
        match state.command_pools.get(&host_pool) {
            Some(entry) if entry.device == host_device => Ok(()),
            Some(_) => Err(HostError::InvalidArgument("object belongs to a different device")),
            None => Err(Self::stale(pool, HandleKind::CommandPool)),
        }
    }

    /// Destroy a pool together with every command buffer still allocated from it.
    pub fn destroy_command_pool(&self, device: BoxedHandle, pool: BoxedHandle) -> HostResult<()> {
        if pool.is_null() {
            return Ok(());
        }
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host_pool = self.resolve(pool, HandleKind::CommandPool)?;
        let mut state = self.lock();
        Self::checked_command_pool(&state, pool, host_pool, host_device)?;
        let Some(entry) = state.command_pools.remove(&host_pool) else {
            return Ok(());
        };
        for buffer in &entry.buffers {
            if let Some(cb) = state.command_buffers.remove(buffer) {
                self.unbox_removed(cb.boxed);
            }
        }
        self.unbox_removed(entry.boxed);
        dispatch.driver().destroy_command_pool(host_device, host_pool);
        Ok(())
    }

    /// Allocate `count` primary command buffers. Each gets its own order ledger.
    pub fn allocate_command_buffers(
        &self,
        device: BoxedHandle,
        pool: BoxedHandle,
        count: u32,
    ) -> HostResult<Vec<BoxedHandle>> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host_pool = self.resolve(pool, HandleKind::CommandPool)?;
        let mut state = self.lock();
        Self::checked_command_pool(&state, pool, host_pool, host_device)?;
        let buffers = dispatch
            .driver()
            .allocate_command_buffers(host_device, host_pool, count)?;

        let mut boxed = Vec::with_capacity(buffers.len());
        for &buffer in &buffers {
            let handle = self.box_child(HandleKind::CommandBuffer, buffer, &dispatch);
            state.command_buffers.insert(
                buffer,
                CommandBufferEntry {
                    boxed: handle,
                    device: host_device,
                    pool: host_pool,
                },
            );
            boxed.push(handle);
        }
        if let Some(entry) = state.command_pools.get_mut(&host_pool) {
            entry.buffers.extend_from_slice(&buffers);
        }
        Ok(boxed)
    }

    pub fn free_command_buffers(
        &self,
        device: BoxedHandle,
        pool: BoxedHandle,
        command_buffers: &[BoxedHandle],
    ) -> HostResult<()> {
        let (host_device, dispatch) = self.device_dispatch(device)?;
        let host_pool = self.resolve(pool, HandleKind::CommandPool)?;
        let guest_buffers: Vec<BoxedHandle> = command_buffers.iter().copied().filter(|cb| !cb.is_null()).collect();
        let host_buffers = guest_buffers
            .iter()
            .map(|&cb| self.resolve(cb, HandleKind::CommandBuffer))
            .collect::<HostResult<Vec<_>>>()?;

        let mut state = self.lock();
        Self::checked_command_pool(&state, pool, host_pool, host_device)?;
        for (&guest, buffer) in guest_buffers.iter().zip(&host_buffers) {
            match state.command_buffers.get(buffer) {
                Some(entry) if entry.pool == host_pool => {}
                Some(_) => return Err(HostError::InvalidArgument("command buffer is from another pool")),
                None => return Err(Self::stale(guest, HandleKind::CommandBuffer)),
            }
        }
        for buffer in &host_buffers {
            if let Some(entry) = state.command_buffers.remove(buffer) {
                self.unbox_removed(entry.boxed);
            }
        }
        if let Some(entry) = state.command_pools.get_mut(&host_pool) {
            entry.buffers.retain(|b| !host_buffers.contains(b));
        }
        dispatch
            .driver()
            .free_command_buffers(host_device, host_pool, &host_buffers);
        Ok(())
    }

    /// Host command buffer, its device, and the dispatch table to record with.
    fn command_buffer_target(
        &self,
        command_buffer: BoxedHandle,
    ) -> HostResult<(HostHandle, HostHandle, Arc<DispatchTable>)> {
        let record = self.resolve_record(command_buffer, HandleKind::CommandBuffer)?;
        let state = self.lock();
        let Some(entry) = state.command_buffers.get(&record.object()) else {
            return Err(Self::stale(command_buffer, HandleKind::CommandBuffer));
        };
        Ok((record.object(), entry.device, Arc::clone(record.dispatch())))
    }

    pub fn begin_command_buffer(&self, command_buffer: BoxedHandle) -> HostResult<()> {
        let (cb, _, dispatch) = self.command_buffer_target(command_buffer)?;
        Ok(dispatch.driver().begin_command_buffer(cb)?)
    }

    pub fn end_command_buffer(&self, command_buffer: BoxedHandle) -> HostResult<()> {
        let (cb, _, dispatch) = self.command_buffer_target(command_buffer)?;
        Ok(dispatch.driver().end_command_buffer(cb)?)
    }

    pub fn reset_command_buffer(&self, command_buffer: BoxedHandle) -> HostResult<()> {
        let (cb, _, dispatch) = self.command_buffer_target(command_buffer)?;
        Ok(dispatch.driver().reset_command_buffer(cb)?)
    }

    /// Record image barriers. A barrier on an emulated image is repeated for its shadow so both
    /// halves move through the same layouts.
    pub fn cmd_pipeline_barrier(
        &self,
        command_buffer: BoxedHandle,
        barriers: &[ImageMemoryBarrier<BoxedHandle>],
    ) -> HostResult<()> {
        let (cb, device, dispatch) = self.command_buffer_target(command_buffer)?;
        let state = self.lock();
        let mut host_barriers = Vec::with_capacity(barriers.len());
        for barrier in barriers {
            let image = self.resolve(barrier.image, HandleKind::Image)?;
            let Some(entry) = state.images.get(&image) else {
                return Err(Self::stale(barrier.image, HandleKind::Image));
            };
            Self::check_owner(entry.device, device)?;
            host_barriers.push(barrier.with_image(image));
            if let Some(emulated) = &entry.emulated {
                host_barriers.push(barrier.with_image(emulated.shadow));
            }
        }
        dispatch.driver().cmd_pipeline_barrier(cb, &host_barriers);
        Ok(())
    }

    /// Record a buffer-to-image copy.
    ///
    /// Every region must lie inside the image and, for an emulated image, inside the source
    /// buffer; otherwise nothing is recorded. For an emulated image the raw blocks always land in
    /// the primary. When a CPU decoder is available the source is also decompressed into the
    /// image's staging buffer and copied into the shadow ahead of the raw copy.
    pub fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: BoxedHandle,
        buffer: BoxedHandle,
        image: BoxedHandle,
        layout: vk::ImageLayout,
        regions: &[BufferImageCopy],
    ) -> HostResult<()> {
        let (cb, device, dispatch) = self.command_buffer_target(command_buffer)?;
        let driver = dispatch.driver();
        let host_buffer = self.resolve(buffer, HandleKind::Buffer)?;
        let host_image = self.resolve(image, HandleKind::Image)?;

        let mut state = self.lock();
        let (buffer_size, binding) = match state.buffers.get(&host_buffer) {
            Some(entry) => {
                Self::check_owner(entry.device, device)?;
                (entry.size, entry.binding)
            }
            None => return Err(Self::stale(buffer, HandleKind::Buffer)),
        };
        let Some(entry) = state.images.get_mut(&host_image) else {
            return Err(Self::stale(image, HandleKind::Image));
        };
        Self::check_owner(entry.device, device)?;
        let format = entry.emulated.as_ref().map(|emulated| emulated.format);
        for region in regions {
            check_copy_region(&entry.info, format, buffer_size, region)?;
        }

        let info = entry.info;
        let Some(emulated) = entry.emulated.as_mut() else {
            driver.cmd_copy_buffer_to_image(cb, host_buffer, host_image, layout, regions);
            return Ok(());
        };
        let format = emulated.format;

        let decoder_ready = self.decompressor.available() && self.decompressor.supports(format);
        match (decoder_ready, binding) {
            (true, Some(source)) => match self.upload_decompressed(driver, device, source, &info, emulated, regions) {
                Ok((staging, shadow_regions)) => {
                    driver.cmd_copy_buffer_to_image(cb, staging, emulated.shadow, layout, &shadow_regions);
                    trace!(?image, regions = shadow_regions.len(), "decompressed upload recorded");
                }
                Err(err) => warn!(?image, %err, "decompressed upload failed; shadow left stale"),
            },
            (true, None) => warn!(?buffer, "copy source has no memory bound; shadow left stale"),
            (false, _) => warn!(
                ?image,
                format = ?format.vk_format(),
                "no CPU decoder for emulated format; only raw blocks are copied"
            ),
        }

        let block_regions: Vec<_> = regions.iter().map(|r| block_region(format, r)).collect();
        driver.cmd_copy_buffer_to_image(cb, host_buffer, host_image, layout, &block_regions);
        Ok(())
    }

    /// Host-visible buffer with memory bound, sized for a whole decompressed image.
    fn create_staging(driver: &dyn HostDriver, device: HostHandle, size: u64) -> HostResult<(HostHandle, HostHandle)> {
        let staging = driver.create_buffer(
            device,
            &BufferCreateInfo {
                size,
                usage: vk::BufferUsageFlags::TRANSFER_SRC,
            },
        )?;
        let memory_info = MemoryAllocateInfo {
            size,
            memory_type_index: 0,
            property_flags: vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        };
        let memory = match driver.allocate_memory(device, &memory_info) {
            Ok(memory) => memory,
            Err(err) => {
                driver.destroy_buffer(device, staging);
                return Err(err.into());
            }
        };
        if let Err(err) = driver.bind_buffer_memory(device, staging, memory, 0) {
            driver.destroy_buffer(device, staging);
            driver.free_memory(device, memory);
            return Err(err.into());
        }
        debug!(?staging, bytes = size, "staging buffer created for decompressed uploads");
        Ok((staging, memory))
    }

    /// Decompress every region into the image's staging buffer, creating it on first use.
    ///
    /// The staging buffer mirrors the shadow image's linear layout, so each region is written to
    /// the bytes of its own destination and uploads recorded back to back keep their data.
    /// Returns the staging buffer and regions addressing the shadow image.
    fn upload_decompressed(
        &self,
        driver: &dyn HostDriver,
        device: HostHandle,
        source: (HostHandle, u64),
        info: &ImageCreateInfo,
        emulated: &mut EmulatedImage,
        regions: &[BufferImageCopy],
    ) -> HostResult<(HostHandle, Vec<BufferImageCopy>)> {
        let format = emulated.format;
        let (staging, staging_memory) = match emulated.staging {
            Some(staging) => staging,
            None => {
                let staging = Self::create_staging(driver, device, shadow_size(format, info))?;
                emulated.staging = Some(staging);
                staging
            }
        };

        let texel = u64::from(format.decompressed_texel_bytes());
        let mut shadow_regions = Vec::with_capacity(regions.len());
        for region in regions {
            let blocks = gather_blocks(driver, device, source, format, region)?;
            let (width, height) = (region.image_extent.width, region.image_extent.height);
            let level = mip_extent(info.extent, region.mip_level);
            let row_pitch = u64::from(level.width) * texel;
            let slice_pitch = row_pitch * u64::from(level.height);
            // Offsets were checked to be non-negative.
            let (x, y, z) = (
                u64::from(region.image_offset.x.unsigned_abs()),
                u64::from(region.image_offset.y.unsigned_abs()),
                u64::from(region.image_offset.z.unsigned_abs()),
            );
            let base = shadow_subresource_offset(format, info, region.mip_level, region.base_array_layer)
                + z * slice_pitch
                + y * row_pitch
                + x * texel;

            let slice_out = usize::try_from(format.decompressed_size(width, height))
                .map_err(|_| HostError::InvalidArgument("copy region too large"))?;
            let mut texels = Vec::new();
            texels
                .try_reserve_exact(slice_out)
                .map_err(|_| HostError::InvalidArgument("copy region too large"))?;
            texels.resize(slice_out, 0);

            let slices = region_slices(region);
            let slice_in = blocks.len() / usize::try_from(slices).unwrap_or(usize::MAX).max(1);
            let row_out = width as usize * texel as usize;
            for (slice, input) in blocks.chunks_exact(slice_in.max(1)).enumerate() {
                self.decompressor
                    .decompress(format, width, height, input, &mut texels)
                    .map_err(|code| {
                        warn!(code, error = %self.decompressor.error_string(code), "CPU decompression failed");
                        HostError::FormatNotSupported(format.vk_format())
                    })?;
                let slice_base = base + slice as u64 * slice_pitch;
                for (row, bytes) in texels.chunks_exact(row_out.max(1)).enumerate() {
                    driver.write_memory(device, staging_memory, slice_base + row as u64 * row_pitch, bytes)?;
                }
            }
            shadow_regions.push(BufferImageCopy {
                buffer_offset: base,
                buffer_row_length: level.width,
                buffer_image_height: level.height,
                ..*region
            });
        }
        Ok((staging, shadow_regions))
    }

    /// Submit work to a queue.
    ///
    /// The registry lock is not held across the host call; the queue's own lock serializes
    /// submissions instead. Semaphores destroyed before this call are released afterwards.
    pub fn queue_submit(
        &self,
        queue: BoxedHandle,
        submits: &[SubmitInfo<BoxedHandle>],
        fence: BoxedHandle,
    ) -> HostResult<()> {
        let record = self.resolve_record(queue, HandleKind::Queue)?;
        let host_queue = record.object();
        let host_submits = submits
            .iter()
            .map(|submit| {
                submit.try_map(|handle| match handle.kind() {
                    Some(kind @ (HandleKind::Semaphore | HandleKind::CommandBuffer)) => self.resolve(handle, kind),
                    _ => Err(HostError::InvalidHandle {
                        handle,
                        expected: HandleKind::CommandBuffer,
                    }),
                })
            })
            .collect::<HostResult<Vec<_>>>()?;
        let host_fence = self.resolve_optional(fence, HandleKind::Fence)?;

        let (device, submit_lock) = self.queue_owner(queue, host_queue, |family| {
            trace!(?queue, family, submits = submits.len(), ?fence, "queue submit");
        })?;

        let result = {
            let _guard = submit_lock.lock();
            record
                .dispatch()
                .driver()
                .queue_submit(host_queue, &host_submits, host_fence)
        };
        self.handles.process_delayed_removals(device);
        Ok(result?)
    }

    pub fn queue_wait_idle(&self, queue: BoxedHandle) -> HostResult<()> {
        let record = self.resolve_record(queue, HandleKind::Queue)?;
        let host_queue = record.object();
        let (device, submit_lock) = self.queue_owner(queue, host_queue, |_| ())?;
        let result = {
            let _guard = submit_lock.lock();
            record.dispatch().driver().queue_wait_idle(host_queue)
        };
        self.handles.process_delayed_removals(device);
        Ok(result?)
    }

    /// Boxed owning device and submission lock of a queue.
    fn queue_owner(
        &self,
        queue: BoxedHandle,
        host_queue: HostHandle,
        inspect_family: impl FnOnce(u32),
    ) -> HostResult<(BoxedHandle, Arc<parking_lot::Mutex<()>>)> {
        let state = self.lock();
        let Some(entry) = state.queues.get(&host_queue) else {
            return Err(Self::stale(queue, HandleKind::Queue));
        };
        inspect_family(entry.family_index);
        let Some(device) = state.devices.get(&entry.device) else {
            fatal!(?queue, "queue without a device entry");
        };
        Ok((device.boxed, Arc::clone(&entry.submit_lock)))
    }
}
