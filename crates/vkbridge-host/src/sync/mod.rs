//! Completion signalling: ring timelines, guest-visible counters, and the sync worker pool that
//! performs blocking waits off the submission path.

mod sync_timeline;
mod sync_worker;
mod timelines;
mod worker_pool;

pub use sync_timeline::SyncTimeline;
pub use sync_worker::{Completion, FenceSync, FenceWaitStatus, HostFenceWaiter, SyncWorker, WorkerContext};
pub use timelines::{FenceCompletionCallback, FenceId, Ring, TaskId, Timelines};
pub use worker_pool::WorkerPool;
