//! Every live API object, the relationships between them, and the emulation decisions attached
//! to them.
//!
//! Guest calls arrive with boxed handles. The registry resolves them through the
//! [`HandleTable`], issues the host call through the owning object's [`DispatchTable`], and
//! keeps one entry per live object so that teardown can find every dependent.
//!
//! All bookkeeping happens under one registry lock. Host calls that may block (fence waits,
//! queue submission, wait-idle) are issued after that lock is dropped; submissions to one queue
//! are serialized by that queue's own lock instead.

mod commands;
mod device;
mod entries;
mod fence_pool;
mod fences;
mod pipeline;
mod resources;

pub use fence_pool::ExternalFencePool;

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::HostConfig;
use crate::driver::{DispatchTable, HostDriver, HostHandle};
use crate::emulation::CpuDecompressor;
use crate::error::{fatal, HostError, HostResult};
use crate::handle::{BoxedHandle, HandleKind, HandleRecord, HandleTable, HostSyncTiming, OrderLedger};

use entries::RegistryState;

/// Shared state of the host layer.
///
/// Construct one per host process with [`Registry::new`] and share it; tests build as many
/// independent instances as they like.
pub struct Registry {
    config: HostConfig,
    driver: Arc<dyn HostDriver>,
    handles: Arc<HandleTable>,
    decompressor: Arc<dyn CpuDecompressor>,
    host_sync: HostSyncTiming,
    state: Mutex<RegistryState>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("handles", &self.handles)
            .field("host_sync", &self.host_sync)
            .finish_non_exhaustive()
    }
}

impl Registry {
    pub fn new(
        config: HostConfig,
        driver: Arc<dyn HostDriver>,
        decompressor: Arc<dyn CpuDecompressor>,
    ) -> Arc<Self> {
        let handles = Arc::new(HandleTable::new(
            config.handle_table_capacity,
            config.scratch_pool_limit,
        ));
        Arc::new(Self {
            host_sync: HostSyncTiming::from_config(&config),
            config,
            driver,
            handles,
            decompressor,
            state: Mutex::new(RegistryState::default()),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    pub fn driver(&self) -> &Arc<dyn HostDriver> {
        &self.driver
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock()
    }

    /// Unbox a guest handle of the expected kind.
    fn resolve(&self, handle: BoxedHandle, kind: HandleKind) -> HostResult<HostHandle> {
        self.handles
            .unbox_typed(handle, kind)
            .ok_or(HostError::InvalidHandle {
                handle,
                expected: kind,
            })
    }

    /// Like [`Self::resolve`], but a null handle maps to a null host handle.
    fn resolve_optional(&self, handle: BoxedHandle, kind: HandleKind) -> HostResult<HostHandle> {
        if handle.is_null() {
            return Ok(HostHandle::NULL);
        }
        self.resolve(handle, kind)
    }

    fn resolve_record(&self, handle: BoxedHandle, kind: HandleKind) -> HostResult<Arc<HandleRecord>> {
        self.handles
            .record(handle)
            .filter(|record| record.kind() == kind)
            .ok_or(HostError::InvalidHandle {
                handle,
                expected: kind,
            })
    }

    /// Error for a handle that resolved but whose entry was gone once the lock was held: the
    /// guest destroyed it twice, or on two threads at once.
    fn stale(handle: BoxedHandle, expected: HandleKind) -> HostError {
        debug!(?handle, ?expected, "handle outlived its registry entry");
        HostError::InvalidHandle { handle, expected }
    }

    /// Host device handle and its dispatch table.
    fn device_dispatch(&self, device: BoxedHandle) -> HostResult<(HostHandle, Arc<DispatchTable>)> {
        let record = self.resolve_record(device, HandleKind::Device)?;
        Ok((record.object(), Arc::clone(record.dispatch())))
    }

    /// Box a child object of `device`, sharing the device's dispatch table.
    fn box_child(
        &self,
        kind: HandleKind,
        object: HostHandle,
        dispatch: &Arc<DispatchTable>,
    ) -> BoxedHandle {
        let ledger = kind.is_submission_capable().then(OrderLedger::new);
        self.handles
            .box_object(kind, object, Arc::clone(dispatch), false, ledger)
    }

    fn unbox_removed(&self, handle: BoxedHandle) {
        if self.handles.remove(handle).is_none() {
            fatal!(?handle, "registry entry outlived its handle record");
        }
    }

    /// Run `f` as unit `seqno` of `handle`'s ordered work.
    ///
    /// With `needs_host_sync`, waits until unit `seqno - 1` has run (or the host-sync timeout
    /// passes). The counter advances afterwards either way.
    pub fn run_ordered<T>(
        &self,
        handle: BoxedHandle,
        needs_host_sync: bool,
        seqno: u32,
        f: impl FnOnce() -> T,
    ) -> HostResult<T> {
        let kind = handle
            .kind()
            .filter(|kind| kind.is_submission_capable())
            .unwrap_or(HandleKind::Queue);
        let record = self.resolve_record(handle, kind)?;
        let Some(ledger) = record.ledger() else {
            fatal!(?handle, "submission handle has no order ledger");
        };
        let held = ledger.acquire();
        drop(record);
        let out = held.run_in_order(seqno, needs_host_sync, self.host_sync, f);
        held.release();
        Ok(out)
    }

    /// Ordering-only entry point for a queue: no host call, just the ledger turn.
    pub fn queue_host_sync(&self, queue: BoxedHandle, needs_host_sync: bool, seqno: u32) -> HostResult<()> {
        self.resolve(queue, HandleKind::Queue)?;
        self.run_ordered(queue, needs_host_sync, seqno, || ())
    }

    pub fn command_buffer_host_sync(
        &self,
        command_buffer: BoxedHandle,
        needs_host_sync: bool,
        seqno: u32,
    ) -> HostResult<()> {
        self.resolve(command_buffer, HandleKind::CommandBuffer)?;
        self.run_ordered(command_buffer, needs_host_sync, seqno, || ())
    }
}

impl Drop for Registry {
    /// Host shutdown: destroy whatever the guest left alive.
    fn drop(&mut self) {
        let mut instances: Vec<BoxedHandle> = self.lock().instances.values().map(|e| e.boxed).collect();
        instances.sort_unstable();
        for instance in instances {
            if let Err(err) = self.destroy_instance(instance) {
                warn!(?instance, %err, "instance teardown at shutdown failed");
            }
        }
    }
}
