//! Stream renderer: the command-stream front end that turns guest sync exports into timeline
//! completions and moves resource contents between guest iovecs and host linear buffers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use vkbridge_protocol::transfer::{copy_iovecs_to_linear, copy_linear_to_iovecs};
use vkbridge_protocol::{ResourceFormat, StreamCmd, TransferBox, TransferError, TransferLayout};

use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::handle::BoxedHandle;
use crate::sync::{FenceCompletionCallback, FenceId, FenceSync, Ring, SyncWorker, TaskId, Timelines};

/// Where signaled guest fences are reported.
pub trait FenceSink: Send + Sync {
    fn write_fence(&self, fence_id: FenceId);
    fn write_context_fence(&self, fence_id: FenceId, ctx_id: u32, ring_idx: u8);
}

/// Address-space device that hosts each context's command transport.
pub trait AddressSpaceOps: Send + Sync {
    /// Create a transport instance over `backing_len` bytes of shared memory and return its
    /// handle.
    fn create_instance(&self, ctx_id: u32, name: &str, backing_len: usize) -> u32;
    fn ping(&self, handle: u32);
    fn destroy_handle(&self, handle: u32);
}

/// Resolves guest sync handles to the host fence objects behind them.
pub trait FenceSyncLookup: Send + Sync {
    fn lookup(&self, sync_handle: u64) -> Option<Arc<dyn FenceSync>>;
}

pub struct RendererCollaborators {
    pub fence_sink: Arc<dyn FenceSink>,
    pub address_space: Arc<dyn AddressSpaceOps>,
    pub fence_syncs: Arc<dyn FenceSyncLookup>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceDesc {
    pub format: ResourceFormat,
    pub width: u32,
    pub height: u32,
}

struct ContextEntry {
    name: String,
    /// Resource id to address-space handle.
    address_space_handles: HashMap<u32, u32>,
}

struct ResourceEntry {
    layout: TransferLayout,
    linear: Vec<u8>,
    backing: Option<Vec<Vec<u8>>>,
}

#[derive(Default)]
struct RendererState {
    contexts: HashMap<u32, ContextEntry>,
    resources: HashMap<u32, ResourceEntry>,
}

pub struct StreamRenderer {
    timelines: Arc<Timelines>,
    sync_worker: Arc<SyncWorker>,
    fence_sink: Arc<dyn FenceSink>,
    address_space: Arc<dyn AddressSpaceOps>,
    fence_syncs: Arc<dyn FenceSyncLookup>,
    max_resource_bytes: u64,
    state: Mutex<RendererState>,
}

impl StreamRenderer {
    pub fn new(config: &HostConfig, sync_worker: Arc<SyncWorker>, collaborators: RendererCollaborators) -> Self {
        Self {
            timelines: Arc::new(Timelines::new(config.async_fence_callback)),
            sync_worker,
            fence_sink: collaborators.fence_sink,
            address_space: collaborators.address_space,
            fence_syncs: collaborators.fence_syncs,
            max_resource_bytes: config.max_resource_bytes,
            state: Mutex::new(RendererState::default()),
        }
    }

    pub fn timelines(&self) -> &Arc<Timelines> {
        &self.timelines
    }

    pub fn create_context(&self, ctx_id: u32, name: &str) -> HostResult<()> {
        let mut state = self.state.lock();
        if state.contexts.contains_key(&ctx_id) {
            return Err(HostError::InvalidArgument("context id already in use"));
        }
        debug!(ctx_id, name, "stream context created");
        state.contexts.insert(
            ctx_id,
            ContextEntry {
                name: name.to_owned(),
                address_space_handles: HashMap::new(),
            },
        );
        Ok(())
    }

    pub fn destroy_context(&self, ctx_id: u32) -> HostResult<()> {
        let entry = self
            .state
            .lock()
            .contexts
            .remove(&ctx_id)
            .ok_or(HostError::UnknownContext(ctx_id))?;
        for handle in entry.address_space_handles.into_values() {
            self.address_space.destroy_handle(handle);
        }
        debug!(ctx_id, "stream context destroyed");
        Ok(())
    }

    /// Create a resource with a zeroed linear buffer sized for `desc`.
    ///
    /// Fails with [`TransferError::ResourceTooLarge`] past the configured limit, or when the
    /// buffer cannot be allocated.
    pub fn create_resource(&self, id: u32, desc: ResourceDesc) -> HostResult<()> {
        let layout = TransferLayout::new(desc.format, desc.width, desc.height);
        let too_large = TransferError::ResourceTooLarge {
            size: layout.linear_size(),
            limit: self.max_resource_bytes,
        };
        if layout.linear_size() > self.max_resource_bytes {
            return Err(too_large.into());
        }
        let size = usize::try_from(layout.linear_size()).map_err(|_| too_large)?;
        let mut linear = Vec::new();
        linear.try_reserve_exact(size).map_err(|_| too_large)?;
        linear.resize(size, 0);

        let mut state = self.state.lock();
        if state.resources.contains_key(&id) {
            return Err(HostError::InvalidArgument("resource id already in use"));
        }
        state.resources.insert(
            id,
            ResourceEntry {
                layout,
                linear,
                backing: None,
            },
        );
        trace!(id, ?desc, size, "stream resource created");
        Ok(())
    }

    /// Attach guest backing pages. A resource keeps its first backing until detached.
    pub fn attach_backing(&self, id: u32, iovecs: Vec<Vec<u8>>) -> HostResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .resources
            .get_mut(&id)
            .ok_or(HostError::UnknownResource(id))?;
        if entry.backing.is_none() {
            entry.backing = Some(iovecs);
        }
        Ok(())
    }

    /// Detach and hand back the backing pages, if any.
    pub fn detach_backing(&self, id: u32) -> Option<Vec<Vec<u8>>> {
        self.state.lock().resources.get_mut(&id)?.backing.take()
    }

    pub fn unref_resource(&self, id: u32) {
        let mut state = self.state.lock();
        if state.resources.remove(&id).is_none() {
            return;
        }
        for ctx in state.contexts.values_mut() {
            ctx.address_space_handles.remove(&id);
        }
        trace!(id, "stream resource released");
    }

    /// Copy the boxed region from the guest backing into the resource's linear buffer.
    pub fn transfer_write(&self, id: u32, b: TransferBox) -> HostResult<()> {
        let mut state = self.state.lock();
        let entry = state
            .resources
            .get_mut(&id)
            .ok_or(HostError::UnknownResource(id))?;
        let Some((start, len)) = window(&entry.layout, b)? else {
            return Ok(());
        };
        let backing = entry
            .backing
            .as_ref()
            .ok_or(HostError::InvalidArgument("resource has no backing attached"))?;
        let iovs: Vec<&[u8]> = backing.iter().map(Vec::as_slice).collect();
        copy_iovecs_to_linear(&iovs, &mut entry.linear, start, len)?;
        Ok(())
    }

    /// Copy the boxed region of the linear buffer back out to the guest backing.
    pub fn transfer_read(&self, id: u32, b: TransferBox) -> HostResult<()> {
        let mut state = self.state.lock();
        let ResourceEntry {
            layout,
            linear,
            backing,
        } = state
            .resources
            .get_mut(&id)
            .ok_or(HostError::UnknownResource(id))?;
        let Some((start, len)) = window(layout, b)? else {
            return Ok(());
        };
        let backing = backing
            .as_mut()
            .ok_or(HostError::InvalidArgument("resource has no backing attached"))?;
        let mut iovs: Vec<&mut [u8]> = backing.iter_mut().map(Vec::as_mut_slice).collect();
        copy_linear_to_iovecs(linear, &mut iovs, start, len)?;
        Ok(())
    }

    /// Decode and run one stream command issued on `ctx_id`.
    pub fn submit_cmd(&self, ctx_id: u32, bytes: &[u8]) -> HostResult<()> {
        let cmd = StreamCmd::decode_from_le_bytes(bytes)?;
        trace!(ctx_id, opcode = ?cmd.opcode(), "stream command");
        match cmd {
            StreamCmd::ContextCreate { resource_id } => self.create_address_space(ctx_id, resource_id),
            StreamCmd::ContextPing { resource_id } | StreamCmd::ContextPingWithResponse { resource_id, .. } => {
                let handle = {
                    let state = self.state.lock();
                    let ctx = state.contexts.get(&ctx_id).ok_or(HostError::UnknownContext(ctx_id))?;
                    *ctx
                        .address_space_handles
                        .get(&resource_id)
                        .ok_or(HostError::UnknownResource(resource_id))?
                };
                self.address_space.ping(handle);
                Ok(())
            }
            StreamCmd::CreateExportSync { sync_handle } => {
                let ring = Ring::Global;
                let task = self.timelines.enqueue_task(ring);
                let Some(fence) = self.fence_syncs.lookup(sync_handle) else {
                    warn!(sync_handle, "export of unknown sync object; completing immediately");
                    self.timelines.notify_task_completion(task);
                    return Ok(());
                };
                let sent = self
                    .sync_worker
                    .trigger_wait_with_callback(fence, self.task_completion(task));
                self.complete_on_error(task, sent)
            }
            StreamCmd::CreateExportSyncVk {
                device_handle,
                fence_handle,
            }
            | StreamCmd::CreateImportSyncVk {
                device_handle,
                fence_handle,
            } => {
                let task = self.timelines.enqueue_task(Ring::Global);
                trace!(device_handle, fence_handle, task, "waiting on device fence");
                let sent = self
                    .sync_worker
                    .trigger_wait_vk_with_callback(BoxedHandle::from_raw(fence_handle), self.task_completion(task));
                self.complete_on_error(task, sent)
            }
            StreamCmd::CreateImportSync { sync_handle } => {
                trace!(sync_handle, "sync import needs no host work");
                Ok(())
            }
            StreamCmd::CreateQsriExportVk { image_handle } => {
                // The guest fences this export on ring 0 of its own context.
                let ring = Ring::Context { ctx_id, ring_idx: 0 };
                let task = self.timelines.enqueue_task(ring);
                let sent = self.sync_worker.trigger_wait_vk_qsri_with_callback(
                    BoxedHandle::from_raw(image_handle),
                    self.task_completion(task),
                );
                self.complete_on_error(task, sent)
            }
        }
    }

    fn create_address_space(&self, ctx_id: u32, resource_id: u32) -> HostResult<()> {
        let (name, backing_len) = {
            let state = self.state.lock();
            let ctx = state.contexts.get(&ctx_id).ok_or(HostError::UnknownContext(ctx_id))?;
            let resource = state
                .resources
                .get(&resource_id)
                .ok_or(HostError::UnknownResource(resource_id))?;
            (format!("{}-{resource_id}", ctx.name), resource.linear.len())
        };
        let handle = self.address_space.create_instance(ctx_id, &name, backing_len);
        if let Some(ctx) = self.state.lock().contexts.get_mut(&ctx_id) {
            ctx.address_space_handles.insert(resource_id, handle);
            return Ok(());
        }
        // Context destroyed while the instance was being created.
        self.address_space.destroy_handle(handle);
        Err(HostError::UnknownContext(ctx_id))
    }

    fn task_completion(&self, task: TaskId) -> FenceCompletionCallback {
        let timelines = Arc::clone(&self.timelines);
        Box::new(move || timelines.notify_task_completion(task))
    }

    /// A wait that never reached a worker still has to retire its task.
    fn complete_on_error(&self, task: TaskId, sent: HostResult<()>) -> HostResult<()> {
        if let Err(err) = sent {
            warn!(task, %err, "sync wait not queued; retiring task");
            self.timelines.notify_task_completion(task);
            return Err(err);
        }
        Ok(())
    }

    /// Report `fence_id` once every task queued before it on `ring` has completed.
    pub fn create_fence(&self, fence_id: FenceId, ring: Ring) {
        let sink = Arc::clone(&self.fence_sink);
        let callback: FenceCompletionCallback = match ring {
            Ring::Global => Box::new(move || sink.write_fence(fence_id)),
            Ring::Context { ctx_id, ring_idx } => {
                Box::new(move || sink.write_context_fence(fence_id, ctx_id, ring_idx))
            }
        };
        trace!(fence_id, ?ring, "fence queued");
        self.timelines.enqueue_fence(ring, fence_id, callback);
    }

    pub fn poll(&self) {
        self.timelines.poll();
    }
}

fn window(layout: &TransferLayout, b: TransferBox) -> HostResult<Option<(usize, usize)>> {
    let Some((start, len)) = layout.window(b)? else {
        return Ok(None);
    };
    let start = usize::try_from(start).map_err(|_| HostError::InvalidArgument("transfer offset overflows"))?;
    let len = usize::try_from(len).map_err(|_| HostError::InvalidArgument("transfer length overflows"))?;
    Ok(Some((start, len)))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use ash::vk;
    use pretty_assertions::assert_eq;
    use vkbridge_protocol::StreamDecodeError;

    use super::*;
    use crate::sync::{FenceWaitStatus, HostFenceWaiter};

    struct ImmediateWaiter;

    impl HostFenceWaiter for ImmediateWaiter {
        fn wait_for_fence(&self, _fence: BoxedHandle, _timeout: Duration) -> vk::Result {
            vk::Result::SUCCESS
        }

        fn wait_qsri(&self, _image: BoxedHandle, _timeout: Duration) -> vk::Result {
            vk::Result::SUCCESS
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        fences: Mutex<Vec<(FenceId, Option<(u32, u8)>)>>,
    }

    impl FenceSink for RecordingSink {
        fn write_fence(&self, fence_id: FenceId) {
            self.fences.lock().push((fence_id, None));
        }

        fn write_context_fence(&self, fence_id: FenceId, ctx_id: u32, ring_idx: u8) {
            self.fences.lock().push((fence_id, Some((ctx_id, ring_idx))));
        }
    }

    #[derive(Default)]
    struct RecordingAddressSpace {
        created: Mutex<Vec<(u32, String, usize)>>,
        pings: Mutex<Vec<u32>>,
        destroyed: Mutex<Vec<u32>>,
    }

    impl AddressSpaceOps for RecordingAddressSpace {
        fn create_instance(&self, ctx_id: u32, name: &str, backing_len: usize) -> u32 {
            let mut created = self.created.lock();
            created.push((ctx_id, name.to_owned(), backing_len));
            100 + created.len() as u32
        }

        fn ping(&self, handle: u32) {
            self.pings.lock().push(handle);
        }

        fn destroy_handle(&self, handle: u32) {
            self.destroyed.lock().push(handle);
        }
    }

    struct SignaledSync;

    impl FenceSync for SignaledSync {
        fn client_wait(&self, _timeout: Duration) -> FenceWaitStatus {
            FenceWaitStatus::Signaled
        }
    }

    struct OneSync;

    impl FenceSyncLookup for OneSync {
        fn lookup(&self, sync_handle: u64) -> Option<Arc<dyn FenceSync>> {
            (sync_handle == 0x55).then(|| Arc::new(SignaledSync) as Arc<dyn FenceSync>)
        }
    }

    struct Fixture {
        renderer: StreamRenderer,
        sink: Arc<RecordingSink>,
        address_space: Arc<RecordingAddressSpace>,
    }

    fn fixture() -> Fixture {
        let config = HostConfig::default().with_sync_worker_count(2);
        let worker = Arc::new(SyncWorker::start(&config, Arc::new(ImmediateWaiter), None).unwrap());
        let sink = Arc::new(RecordingSink::default());
        let address_space = Arc::new(RecordingAddressSpace::default());
        let renderer = StreamRenderer::new(
            &config,
            worker,
            RendererCollaborators {
                fence_sink: sink.clone(),
                address_space: address_space.clone(),
                fence_syncs: Arc::new(OneSync),
            },
        );
        Fixture {
            renderer,
            sink,
            address_space,
        }
    }

    fn wait_for_fences(sink: &RecordingSink, count: usize) -> Vec<(FenceId, Option<(u32, u8)>)> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let fences = sink.fences.lock().clone();
            if fences.len() >= count || Instant::now() >= deadline {
                return fences;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn exported_device_fence_signals_global_fence() {
        let f = fixture();
        let cmd = StreamCmd::CreateExportSyncVk {
            device_handle: 0x10,
            fence_handle: 0x20,
        };
        f.renderer.submit_cmd(1, &cmd.encode_to_le_bytes()).unwrap();
        f.renderer.create_fence(7, Ring::Global);
        assert_eq!(wait_for_fences(&f.sink, 1), vec![(7, None)]);
    }

    #[test]
    fn qsri_export_lands_on_context_ring() {
        let f = fixture();
        f.renderer.create_context(3, "ctx").unwrap();
        let cmd = StreamCmd::CreateQsriExportVk { image_handle: 0x99 };
        f.renderer.submit_cmd(3, &cmd.encode_to_le_bytes()).unwrap();
        f.renderer.create_fence(9, Ring::Context { ctx_id: 3, ring_idx: 0 });
        assert_eq!(wait_for_fences(&f.sink, 1), vec![(9, Some((3, 0)))]);
    }

    #[test]
    fn unknown_sync_objects_complete_immediately() {
        let f = fixture();
        let unknown = StreamCmd::CreateExportSync { sync_handle: 0x1 };
        let known = StreamCmd::CreateExportSync { sync_handle: 0x55 };
        f.renderer.submit_cmd(1, &unknown.encode_to_le_bytes()).unwrap();
        f.renderer.submit_cmd(1, &known.encode_to_le_bytes()).unwrap();
        f.renderer.create_fence(1, Ring::Global);
        assert_eq!(wait_for_fences(&f.sink, 1), vec![(1, None)]);
    }

    #[test]
    fn context_create_and_ping_reach_address_space() {
        let f = fixture();
        f.renderer.create_context(4, "gfx").unwrap();
        f.renderer
            .create_resource(
                12,
                ResourceDesc {
                    format: ResourceFormat::R8Unorm,
                    width: 4096,
                    height: 1,
                },
            )
            .unwrap();
        let create = StreamCmd::ContextCreate { resource_id: 12 };
        let ping = StreamCmd::ContextPing { resource_id: 12 };
        f.renderer.submit_cmd(4, &create.encode_to_le_bytes()).unwrap();
        f.renderer.submit_cmd(4, &ping.encode_to_le_bytes()).unwrap();

        assert_eq!(
            f.address_space.created.lock().clone(),
            vec![(4, "gfx-12".to_owned(), 4096)]
        );
        assert_eq!(f.address_space.pings.lock().clone(), vec![101]);

        f.renderer.destroy_context(4).unwrap();
        assert_eq!(f.address_space.destroyed.lock().clone(), vec![101]);
        assert!(matches!(
            f.renderer.submit_cmd(4, &ping.encode_to_le_bytes()),
            Err(HostError::UnknownContext(4))
        ));
    }

    #[test]
    fn malformed_commands_are_rejected() {
        let f = fixture();
        assert!(matches!(
            f.renderer.submit_cmd(1, &[0x01, 0x10]),
            Err(HostError::Stream(StreamDecodeError::BufferTooSmall { found: 2 }))
        ));
        assert!(matches!(
            f.renderer.submit_cmd(1, &0xdead_u32.to_le_bytes()),
            Err(HostError::Stream(StreamDecodeError::UnknownOpcode { found: 0xdead }))
        ));
    }

    #[test]
    fn transfers_move_boxed_rows() {
        let f = fixture();
        f.renderer
            .create_resource(
                5,
                ResourceDesc {
                    format: ResourceFormat::R8G8B8A8Unorm,
                    width: 4,
                    height: 4,
                },
            )
            .unwrap();
        // Backing split unevenly across two pages.
        let pages: Vec<Vec<u8>> = vec![(0..40).collect(), (40..64).collect()];
        f.renderer.attach_backing(5, pages).unwrap();

        let b = TransferBox { x: 1, y: 1, w: 2, h: 2 };
        f.renderer.transfer_write(5, b).unwrap();

        // Clear the guest side, then read the same box back out.
        f.renderer.detach_backing(5).unwrap();
        f.renderer.attach_backing(5, vec![vec![0; 64]]).unwrap();
        f.renderer.transfer_read(5, b).unwrap();
        let out = f.renderer.detach_backing(5).unwrap().concat();

        // Rows are 16 bytes apart; the window runs from (1, 1) to the end of (2, 2).
        let mut expected = vec![0u8; 64];
        for (i, byte) in expected.iter_mut().enumerate().take(44).skip(20) {
            *byte = i as u8;
        }
        assert_eq!(out, expected);

        assert!(matches!(
            f.renderer.transfer_write(5, TransferBox { x: 3, y: 0, w: 2, h: 1 }),
            Err(HostError::Transfer(_))
        ));
        assert!(matches!(
            f.renderer.transfer_write(6, b),
            Err(HostError::UnknownResource(6))
        ));
    }
}
