use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::{BoxedHandle, HandleKind, OrderLedger, PooledBuffer, ScratchPool, GENERATION_MASK};
use crate::driver::{DispatchTable, HostHandle};
use crate::error::fatal;

/// What a boxed handle stands for.
pub struct HandleRecord {
    kind: HandleKind,
    object: HostHandle,
    dispatch: Arc<DispatchTable>,
    owns_dispatch: bool,
    ledger: Option<Arc<OrderLedger>>,
    creation_seq: u64,
    scratch: Mutex<Option<PooledBuffer>>,
    scratch_pool: Arc<ScratchPool>,
}

impl HandleRecord {
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn object(&self) -> HostHandle {
        self.object
    }

    pub fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    pub fn owns_dispatch(&self) -> bool {
        self.owns_dispatch
    }

    pub fn ledger(&self) -> Option<&Arc<OrderLedger>> {
        self.ledger.as_ref()
    }

    /// Run `f` with this record's scratch buffer, attaching one from the pool on first use.
    pub fn with_scratch<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut scratch = self.scratch.lock();
        let buf = scratch.get_or_insert_with(|| self.scratch_pool.acquire());
        f(buf)
    }
}

impl fmt::Debug for HandleRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRecord")
            .field("kind", &self.kind)
            .field("object", &self.object)
            .field("dispatch", &self.dispatch.id())
            .field("owns_dispatch", &self.owns_dispatch)
            .field("has_ledger", &self.ledger.is_some())
            .finish()
    }
}

struct Slot {
    /// Generation the next (or current) occupant carries.
    generation: u32,
    record: Option<Arc<HandleRecord>>,
}

struct SlotAllocator {
    free: Vec<u32>,
    watermark: u32,
    next_overflow: u32,
}

type DelayedCallback = Box<dyn FnOnce() + Send>;

struct DelayedRemoval {
    handle: BoxedHandle,
    callback: Option<DelayedCallback>,
}

fn next_generation(generation: u32) -> u32 {
    if generation >= GENERATION_MASK {
        1
    } else {
        generation + 1
    }
}

/// Concurrent map from guest handles to [`HandleRecord`]s.
///
/// The first `capacity` indices live in a fixed slot array with one `RwLock` per slot, so
/// lookups on different handles never contend. Indices past that spill into an ordered map and
/// are never reused. Fixed slots are recycled through a free list; each removal bumps the slot's
/// generation so an old handle can never resolve to the slot's next occupant.
pub struct HandleTable {
    slots: Box<[RwLock<Slot>]>,
    overflow: RwLock<BTreeMap<u32, (u32, Arc<HandleRecord>)>>,
    allocator: Mutex<SlotAllocator>,
    reverse: Mutex<HashMap<(HandleKind, HostHandle), BoxedHandle>>,
    delayed: Mutex<HashMap<BoxedHandle, Vec<DelayedRemoval>>>,
    restore_queue: Mutex<VecDeque<BoxedHandle>>,
    scratch_pool: Arc<ScratchPool>,
    creation_seq: AtomicU64,
    live: AtomicUsize,
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("capacity", &self.slots.len())
            .field("live", &self.len())
            .finish()
    }
}

impl HandleTable {
    pub fn new(capacity: usize, scratch_pool_limit: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize / 2);
        let slots = (0..capacity)
            .map(|_| {
                RwLock::new(Slot {
                    generation: 1,
                    record: None,
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            overflow: RwLock::new(BTreeMap::new()),
            allocator: Mutex::new(SlotAllocator {
                free: Vec::new(),
                watermark: 0,
                next_overflow: capacity as u32,
            }),
            reverse: Mutex::new(HashMap::new()),
            delayed: Mutex::new(HashMap::new()),
            restore_queue: Mutex::new(VecDeque::new()),
            scratch_pool: ScratchPool::new(scratch_pool_limit),
            creation_seq: AtomicU64::new(0),
            live: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn scratch_pool(&self) -> &Arc<ScratchPool> {
        &self.scratch_pool
    }

    /// Box `object`, or return its existing handle if it is already boxed.
    ///
    /// If the object is already boxed, the existing record keeps its dispatch ownership and
    /// the passed `dispatch` is not adopted.
    pub fn box_object(
        &self,
        kind: HandleKind,
        object: HostHandle,
        dispatch: Arc<DispatchTable>,
        owns_dispatch: bool,
        ledger: Option<Arc<OrderLedger>>,
    ) -> BoxedHandle {
        let mut reverse = self.reverse.lock();
        if let Some(&existing) = reverse.get(&(kind, object)) {
            if self.record(existing).is_some() {
                trace!(?existing, ?object, "object already boxed");
                return existing;
            }
        }

        let record = Arc::new(HandleRecord {
            kind,
            object,
            dispatch,
            owns_dispatch,
            ledger,
            creation_seq: self.creation_seq.fetch_add(1, Ordering::Relaxed),
            scratch: Mutex::new(None),
            scratch_pool: Arc::clone(&self.scratch_pool),
        });

        let handle = match self.next_restored_handle(kind) {
            Some(wanted) if self.install_at(wanted, &record) => wanted,
            Some(wanted) => {
                warn!(?wanted, "restored handle value is occupied; allocating a fresh one");
                self.install_fresh(kind, record)
            }
            None => self.install_fresh(kind, record),
        };
        reverse.insert((kind, object), handle);
        self.live.fetch_add(1, Ordering::AcqRel);
        handle
    }

    fn install_fresh(&self, kind: HandleKind, record: Arc<HandleRecord>) -> BoxedHandle {
        let mut alloc = self.allocator.lock();
        let index = if let Some(index) = alloc.free.pop() {
            index
        } else if (alloc.watermark as usize) < self.slots.len() {
            alloc.watermark += 1;
            alloc.watermark - 1
        } else {
            let index = alloc.next_overflow;
            alloc.next_overflow = alloc.next_overflow.wrapping_add(1);
            drop(alloc);
            let generation = 1;
            self.overflow.write().insert(index, (generation, record));
            return BoxedHandle::new(kind, generation, index);
        };
        drop(alloc);

        let mut slot = self.slots[index as usize].write();
        debug_assert!(slot.record.is_none());
        slot.record = Some(record);
        BoxedHandle::new(kind, slot.generation, index)
    }

    /// Place `record` at exactly `handle`. Fails if that index is occupied.
    fn install_at(&self, handle: BoxedHandle, record: &Arc<HandleRecord>) -> bool {
        let index = handle.index();
        let generation = handle.generation();
        if generation == 0 {
            return false;
        }

        if (index as usize) < self.slots.len() {
            let mut alloc = self.allocator.lock();
            if index >= alloc.watermark {
                let skipped = alloc.watermark..index;
                alloc.free.extend(skipped.rev());
                alloc.watermark = index + 1;
            } else if let Some(pos) = alloc.free.iter().position(|&i| i == index) {
                alloc.free.swap_remove(pos);
            } else {
                return false;
            }
            drop(alloc);
            let mut slot = self.slots[index as usize].write();
            slot.generation = generation;
            slot.record = Some(Arc::clone(record));
            return true;
        }

        let mut overflow = self.overflow.write();
        if overflow.contains_key(&index) {
            return false;
        }
        overflow.insert(index, (generation, Arc::clone(record)));
        drop(overflow);
        let mut alloc = self.allocator.lock();
        if index >= alloc.next_overflow {
            alloc.next_overflow = index.wrapping_add(1);
        }
        true
    }

    fn next_restored_handle(&self, kind: HandleKind) -> Option<BoxedHandle> {
        let mut queue = self.restore_queue.lock();
        match queue.front() {
            Some(front) if front.kind() == Some(kind) => queue.pop_front(),
            _ => None,
        }
    }

    /// Seed the handle values that replayed creations should receive, in creation order.
    pub fn load_created_handles(&self, handles: impl IntoIterator<Item = BoxedHandle>) {
        let mut queue = self.restore_queue.lock();
        queue.clear();
        queue.extend(handles);
    }

    /// Handle values seeded by [`Self::load_created_handles`] not yet handed out.
    pub fn pending_restored_handles(&self) -> usize {
        self.restore_queue.lock().len()
    }

    pub fn record(&self, handle: BoxedHandle) -> Option<Arc<HandleRecord>> {
        let kind = handle.kind()?;
        let index = handle.index();
        if (index as usize) < self.slots.len() {
            let slot = self.slots[index as usize].read();
            if slot.generation != handle.generation() {
                return None;
            }
            return slot.record.as_ref().filter(|r| r.kind == kind).cloned();
        }
        let overflow = self.overflow.read();
        overflow
            .get(&index)
            .filter(|(generation, r)| *generation == handle.generation() && r.kind == kind)
            .map(|(_, r)| Arc::clone(r))
    }

    pub fn unbox(&self, handle: BoxedHandle) -> Option<HostHandle> {
        self.record(handle).map(|r| r.object)
    }

    /// Like [`Self::unbox`], but also rejects a handle whose tag is not `kind`.
    pub fn unbox_typed(&self, handle: BoxedHandle, kind: HandleKind) -> Option<HostHandle> {
        if handle.kind() != Some(kind) {
            return None;
        }
        self.unbox(handle)
    }

    pub fn handle_for(&self, kind: HandleKind, object: HostHandle) -> Option<BoxedHandle> {
        let existing = *self.reverse.lock().get(&(kind, object))?;
        self.record(existing).map(|_| existing)
    }

    /// Invalidate `handle` immediately. Returns the record it stood for.
    pub fn remove(&self, handle: BoxedHandle) -> Option<Arc<HandleRecord>> {
        let kind = handle.kind()?;
        let index = handle.index();

        let record = if (index as usize) < self.slots.len() {
            let mut slot = self.slots[index as usize].write();
            if slot.generation != handle.generation()
                || !slot.record.as_ref().is_some_and(|r| r.kind == kind)
            {
                return None;
            }
            let record = slot.record.take()?;
            slot.generation = next_generation(slot.generation);
            drop(slot);
            self.allocator.lock().free.push(index);
            record
        } else {
            let mut overflow = self.overflow.write();
            match overflow.get(&index) {
                Some((generation, r)) if *generation == handle.generation() && r.kind == kind => {}
                _ => return None,
            }
            let (_, record) = overflow.remove(&index)?;
            record
        };

        {
            let mut reverse = self.reverse.lock();
            if reverse.get(&(kind, record.object)) == Some(&handle) {
                reverse.remove(&(kind, record.object));
            }
        }
        self.live.fetch_sub(1, Ordering::AcqRel);

        if record.owns_dispatch && !record.dispatch.release() {
            fatal!(?handle, dispatch = record.dispatch.id(), "dispatch table released twice");
        }
        trace!(?handle, object = ?record.object, "handle removed");
        Some(record)
    }

    /// Keep `handle` resolvable until `device`'s next cleanup pass, then remove it and run
    /// `callback`.
    pub fn remove_delayed(
        &self,
        handle: BoxedHandle,
        device: BoxedHandle,
        callback: Option<DelayedCallback>,
    ) {
        self.delayed
            .lock()
            .entry(device)
            .or_default()
            .push(DelayedRemoval { handle, callback });
    }

    pub fn pending_delayed_removals(&self, device: BoxedHandle) -> usize {
        self.delayed.lock().get(&device).map_or(0, Vec::len)
    }

    /// Cleanup pass for `device`: perform every removal deferred against it.
    pub fn process_delayed_removals(&self, device: BoxedHandle) -> usize {
        let pending = self.delayed.lock().remove(&device).unwrap_or_default();
        let count = pending.len();
        for removal in pending {
            if self.remove(removal.handle).is_none() {
                debug!(handle = ?removal.handle, "delayed removal of an already-removed handle");
            }
            if let Some(callback) = removal.callback {
                callback();
            }
        }
        count
    }

    /// Every live handle, oldest first.
    pub fn live_handles(&self) -> Vec<BoxedHandle> {
        let mut live: Vec<(u64, BoxedHandle)> = Vec::with_capacity(self.len());
        for (index, slot) in self.slots.iter().enumerate() {
            let slot = slot.read();
            if let Some(record) = &slot.record {
                live.push((
                    record.creation_seq,
                    BoxedHandle::new(record.kind, slot.generation, index as u32),
                ));
            }
        }
        for (&index, (generation, record)) in self.overflow.read().iter() {
            live.push((
                record.creation_seq,
                BoxedHandle::new(record.kind, *generation, index),
            ));
        }
        live.sort_unstable_by_key(|(seq, _)| *seq);
        live.into_iter().map(|(_, h)| h).collect()
    }
}
