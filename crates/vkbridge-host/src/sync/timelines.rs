use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::trace;

use crate::error::fatal;

/// Independent completion-ordering domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ring {
    Global,
    Context { ctx_id: u32, ring_idx: u8 },
}

pub type TaskId = u64;
pub type FenceId = u64;
pub type FenceCompletionCallback = Box<dyn FnOnce() + Send>;

enum TimelineItem {
    Task(TaskId),
    Fence {
        id: FenceId,
        callback: FenceCompletionCallback,
    },
}

struct TaskState {
    ring: Ring,
    completed: bool,
}

#[derive(Default)]
struct TimelineState {
    next_task_id: TaskId,
    tasks: HashMap<TaskId, TaskState>,
    rings: HashMap<Ring, VecDeque<TimelineItem>>,
}

impl TimelineState {
    /// Pop everything at the head of `ring` that is ready and collect the fence callbacks.
    fn drain_ready(&mut self, ring: Ring, ready: &mut Vec<(FenceId, FenceCompletionCallback)>) {
        let Some(queue) = self.rings.get_mut(&ring) else {
            return;
        };
        loop {
            match queue.front() {
                Some(TimelineItem::Task(id)) => {
                    let done = self.tasks.get(id).is_some_and(|t| t.completed);
                    if !done {
                        break;
                    }
                    let id = *id;
                    queue.pop_front();
                    self.tasks.remove(&id);
                }
                Some(TimelineItem::Fence { .. }) => {
                    if let Some(TimelineItem::Fence { id, callback }) = queue.pop_front() {
                        ready.push((id, callback));
                    }
                }
                None => break,
            }
        }
        if queue.is_empty() {
            self.rings.remove(&ring);
        }
    }
}

/// Ring-keyed task and fence queues.
///
/// A fence fires once every task enqueued before it on the same ring has completed, no matter
/// in which order those tasks complete. Rings never wait on each other.
///
/// With `with_async_callback`, ready fences fire on the thread that made them ready (the
/// completing worker, or the enqueuer if nothing is pending). Otherwise they fire only from
/// [`Timelines::poll`]. Callbacks always run after the internal lock is dropped, in ring order.
pub struct Timelines {
    state: Mutex<TimelineState>,
    with_async_callback: bool,
}

impl Timelines {
    pub fn new(with_async_callback: bool) -> Self {
        Self {
            state: Mutex::new(TimelineState::default()),
            with_async_callback,
        }
    }

    pub fn with_async_callback(&self) -> bool {
        self.with_async_callback
    }

    pub fn enqueue_task(&self, ring: Ring) -> TaskId {
        let mut state = self.state.lock();
        let id = state.next_task_id;
        state.next_task_id += 1;
        state.tasks.insert(
            id,
            TaskState {
                ring,
                completed: false,
            },
        );
        state
            .rings
            .entry(ring)
            .or_default()
            .push_back(TimelineItem::Task(id));
        trace!(task = id, ?ring, "timeline task enqueued");
        id
    }

    pub fn enqueue_fence(&self, ring: Ring, fence_id: FenceId, callback: FenceCompletionCallback) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock();
            state
                .rings
                .entry(ring)
                .or_default()
                .push_back(TimelineItem::Fence {
                    id: fence_id,
                    callback,
                });
            if self.with_async_callback {
                state.drain_ready(ring, &mut ready);
            }
        }
        Self::fire(ready);
    }

    /// Mark `task_id` complete. Completing an unknown task, or one twice, is fatal.
    pub fn notify_task_completion(&self, task_id: TaskId) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock();
            let ring = match state.tasks.get_mut(&task_id) {
                Some(task) if task.completed => {
                    fatal!(task = task_id, "timeline task completed twice")
                }
                Some(task) => {
                    task.completed = true;
                    task.ring
                }
                None => fatal!(task = task_id, "completion for unknown timeline task"),
            };
            trace!(task = task_id, ?ring, "timeline task completed");
            if self.with_async_callback {
                state.drain_ready(ring, &mut ready);
            }
        }
        Self::fire(ready);
    }

    /// Fire every ready fence on every ring.
    pub fn poll(&self) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock();
            let rings: Vec<Ring> = state.rings.keys().copied().collect();
            for ring in rings {
                state.drain_ready(ring, &mut ready);
            }
        }
        Self::fire(ready);
    }

    /// Items still queued on `ring`.
    pub fn pending(&self, ring: Ring) -> usize {
        self.state.lock().rings.get(&ring).map_or(0, VecDeque::len)
    }

    fn fire(ready: Vec<(FenceId, FenceCompletionCallback)>) {
        for (id, callback) in ready {
            trace!(fence = id, "timeline fence signaled");
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder() -> (Arc<Mutex<Vec<FenceId>>>, impl Fn(FenceId) -> FenceCompletionCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = Arc::clone(&log);
        (log, move |id| {
            let log = Arc::clone(&log2);
            Box::new(move || log.lock().push(id)) as FenceCompletionCallback
        })
    }

    #[test]
    fn fence_without_pending_tasks_fires_immediately() {
        let timelines = Timelines::new(true);
        let (log, cb) = recorder();
        timelines.enqueue_fence(Ring::Global, 1, cb(1));
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn fences_wait_for_every_earlier_task() {
        let timelines = Timelines::new(true);
        let (log, cb) = recorder();
        let t1 = timelines.enqueue_task(Ring::Global);
        timelines.enqueue_fence(Ring::Global, 1, cb(1));
        let t2 = timelines.enqueue_task(Ring::Global);
        timelines.enqueue_fence(Ring::Global, 2, cb(2));

        // Out-of-order completion: nothing may fire until t1 is done.
        timelines.notify_task_completion(t2);
        assert!(log.lock().is_empty());
        timelines.notify_task_completion(t1);
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(timelines.pending(Ring::Global), 0);
    }

    #[test]
    fn rings_are_independent() {
        let timelines = Timelines::new(true);
        let (log, cb) = recorder();
        let a = Ring::Context {
            ctx_id: 1,
            ring_idx: 0,
        };
        let b = Ring::Context {
            ctx_id: 1,
            ring_idx: 1,
        };
        let _stuck = timelines.enqueue_task(a);
        timelines.enqueue_fence(a, 10, cb(10));
        let tb = timelines.enqueue_task(b);
        timelines.enqueue_fence(b, 20, cb(20));

        timelines.notify_task_completion(tb);
        assert_eq!(*log.lock(), vec![20]);
        assert_eq!(timelines.pending(a), 2);
    }

    #[test]
    fn polled_mode_defers_to_poll() {
        let timelines = Timelines::new(false);
        let (log, cb) = recorder();
        let t = timelines.enqueue_task(Ring::Global);
        timelines.enqueue_fence(Ring::Global, 7, cb(7));
        timelines.notify_task_completion(t);
        assert!(log.lock().is_empty());
        timelines.poll();
        assert_eq!(*log.lock(), vec![7]);
    }

    #[test]
    fn callbacks_may_reenter_timelines() {
        let timelines = Arc::new(Timelines::new(true));
        let inner = Arc::clone(&timelines);
        let t = timelines.enqueue_task(Ring::Global);
        timelines.enqueue_fence(
            Ring::Global,
            1,
            Box::new(move || {
                inner.enqueue_task(Ring::Global);
            }),
        );
        timelines.notify_task_completion(t);
        assert_eq!(timelines.pending(Ring::Global), 1);
    }
}
