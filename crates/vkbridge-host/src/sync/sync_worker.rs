use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ash::vk;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use super::{FenceCompletionCallback, SyncTimeline, WorkerPool};
use crate::config::HostConfig;
use crate::error::{HostError, HostResult};
use crate::handle::BoxedHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceWaitStatus {
    Signaled,
    TimedOut,
    Failed,
}

impl FenceWaitStatus {
    fn as_vk(self) -> vk::Result {
        match self {
            Self::Signaled => vk::Result::SUCCESS,
            Self::TimedOut => vk::Result::TIMEOUT,
            Self::Failed => vk::Result::ERROR_UNKNOWN,
        }
    }
}

/// Guest-exported fence of the GL-style API, waited on by sync workers.
pub trait FenceSync: Send + Sync {
    fn client_wait(&self, timeout: Duration) -> FenceWaitStatus;
}

/// Blocking waits on registry-managed objects, issued from sync workers.
pub trait HostFenceWaiter: Send + Sync {
    fn wait_for_fence(&self, fence: BoxedHandle, timeout: Duration) -> vk::Result;
    fn wait_qsri(&self, image: BoxedHandle, timeout: Duration) -> vk::Result;
}

/// Per-thread setup for workers that need a current context before they can wait.
pub trait WorkerContext: Send + Sync {
    fn init(&self, worker: usize);
    fn teardown(&self, worker: usize);
}

/// What to do once a wait finishes.
pub enum Completion {
    Callback(FenceCompletionCallback),
    /// Bump the ring's guest-visible counter by one.
    Timeline(Arc<SyncTimeline>),
}

impl Completion {
    fn complete(self) {
        match self {
            Self::Callback(callback) => callback(),
            Self::Timeline(timeline) => timeline.inc(1),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Completion::Callback"),
            Self::Timeline(t) => write!(f, "Completion::Timeline({})", t.value()),
        }
    }
}

enum SyncCommand {
    InitContext,
    WaitFence {
        fence: Arc<dyn FenceSync>,
        completion: Completion,
    },
    WaitVkFence {
        fence: BoxedHandle,
        completion: Completion,
    },
    WaitVkQsri {
        image: BoxedHandle,
        completion: Option<Completion>,
    },
    General(Box<dyn FnOnce() + Send>),
    BlockedWaitNoTimeline(Arc<dyn FenceSync>),
    Exit,
}

impl SyncCommand {
    fn name(&self) -> &'static str {
        match self {
            Self::InitContext => "init-context",
            Self::WaitFence { .. } => "wait-fence",
            Self::WaitVkFence { .. } => "wait-vk-fence",
            Self::WaitVkQsri { .. } => "wait-vk-qsri",
            Self::General(_) => "general",
            Self::BlockedWaitNoTimeline(_) => "blocked-wait-no-timeline",
            Self::Exit => "exit",
        }
    }
}

/// One-shot slot a worker publishes a result into.
#[derive(Default)]
struct ResultSlot {
    value: Mutex<Option<vk::Result>>,
    published: Condvar,
}

impl ResultSlot {
    fn publish(&self, result: vk::Result) {
        *self.value.lock() = Some(result);
        self.published.notify_all();
    }

    fn wait(&self) -> vk::Result {
        let mut value = self.value.lock();
        loop {
            if let Some(result) = *value {
                return result;
            }
            self.published.wait(&mut value);
        }
    }
}

struct SyncItem {
    cmd: SyncCommand,
    result: Option<Arc<ResultSlot>>,
}

struct WorkerEnv {
    waiter: Arc<dyn HostFenceWaiter>,
    context: Option<Arc<dyn WorkerContext>>,
    fence_timeout: Duration,
}

impl WorkerEnv {
    fn run(&self, worker: usize, cmd: SyncCommand) -> vk::Result {
        let name = cmd.name();
        match cmd {
            SyncCommand::InitContext => {
                if let Some(context) = &self.context {
                    context.init(worker);
                }
                vk::Result::SUCCESS
            }
            SyncCommand::WaitFence { fence, completion } => {
                let status = fence.client_wait(self.fence_timeout);
                if status != FenceWaitStatus::Signaled {
                    warn!(worker, ?status, "fence wait did not signal; completing anyway");
                }
                completion.complete();
                status.as_vk()
            }
            SyncCommand::WaitVkFence { fence, completion } => {
                let result = self.waiter.wait_for_fence(fence, self.fence_timeout);
                if result != vk::Result::SUCCESS {
                    warn!(worker, ?fence, ?result, "host fence wait failed; completing anyway");
                }
                completion.complete();
                result
            }
            SyncCommand::WaitVkQsri { image, completion } => {
                let result = self.waiter.wait_qsri(image, self.fence_timeout);
                if result != vk::Result::SUCCESS {
                    warn!(worker, ?image, ?result, "presentation wait failed; completing anyway");
                }
                if let Some(completion) = completion {
                    completion.complete();
                }
                result
            }
            SyncCommand::General(f) => {
                f();
                vk::Result::SUCCESS
            }
            SyncCommand::BlockedWaitNoTimeline(fence) => fence.client_wait(self.fence_timeout).as_vk(),
            SyncCommand::Exit => {
                if let Some(context) = &self.context {
                    context.teardown(worker);
                }
                debug!(worker, command = name, "sync worker exiting");
                vk::Result::SUCCESS
            }
        }
    }
}

/// Worker pool performing blocking completion waits off the submission path.
///
/// A dispatcher thread owns the pool's lifecycle: it parks until shutdown is requested, then
/// closes the pool and joins every worker.
pub struct SyncWorker {
    pool: Arc<WorkerPool<SyncItem>>,
    exiting: Arc<(Mutex<bool>, Condvar)>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl fmt::Debug for SyncWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncWorker")
            .field("workers", &self.pool.size())
            .field("shut_down", &self.shut_down.load(Ordering::Acquire))
            .finish()
    }
}

impl SyncWorker {
    pub fn start(
        config: &HostConfig,
        waiter: Arc<dyn HostFenceWaiter>,
        context: Option<Arc<dyn WorkerContext>>,
    ) -> io::Result<Self> {
        let has_context = context.is_some();
        let env = WorkerEnv {
            waiter,
            context,
            fence_timeout: config.fence_wait_timeout(),
        };
        let pool = Arc::new(WorkerPool::start(
            "vkbridge-sync",
            config.sync_worker_count,
            move |worker, item: SyncItem| {
                let result = env.run(worker, item.cmd);
                if let Some(slot) = item.result {
                    slot.publish(result);
                }
            },
        )?);

        let exiting = Arc::new((Mutex::new(false), Condvar::new()));
        let dispatcher = {
            let pool = Arc::clone(&pool);
            let exiting = Arc::clone(&exiting);
            thread::Builder::new()
                .name("vkbridge-sync-dispatch".to_string())
                .spawn(move || {
                    let (flag, cond) = &*exiting;
                    let mut exit = flag.lock();
                    while !*exit {
                        cond.wait(&mut exit);
                    }
                    drop(exit);
                    pool.done();
                    pool.join();
                })?
        };

        let worker = Self {
            pool,
            exiting,
            dispatcher: Mutex::new(Some(dispatcher)),
            shut_down: AtomicBool::new(false),
        };
        if has_context {
            worker.broadcast_and_wait(|| SyncCommand::InitContext);
        }
        Ok(worker)
    }

    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    fn check_running(&self) -> HostResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(HostError::ShutDown);
        }
        Ok(())
    }

    fn send(&self, cmd: SyncCommand) -> HostResult<()> {
        self.check_running()?;
        if !self.pool.enqueue(SyncItem { cmd, result: None }) {
            return Err(HostError::ShutDown);
        }
        Ok(())
    }

    fn send_and_wait(&self, cmd: SyncCommand) -> HostResult<vk::Result> {
        self.check_running()?;
        let slot = Arc::new(ResultSlot::default());
        let item = SyncItem {
            cmd,
            result: Some(Arc::clone(&slot)),
        };
        if !self.pool.enqueue(item) {
            return Err(HostError::ShutDown);
        }
        Ok(slot.wait())
    }

    fn broadcast_and_wait(&self, make: impl Fn() -> SyncCommand) {
        let slots: Vec<Arc<ResultSlot>> = (0..self.pool.size())
            .map(|_| Arc::new(ResultSlot::default()))
            .collect();
        let queued = self.pool.broadcast_indexed(|worker| SyncItem {
            cmd: make(),
            result: Some(Arc::clone(&slots[worker])),
        });
        if queued {
            for (worker, slot) in slots.iter().enumerate() {
                let result = slot.wait();
                if result != vk::Result::SUCCESS {
                    warn!(worker, ?result, "per-worker sync command failed");
                }
            }
        }
    }

    /// Wait for a guest fence, then bump `timeline`.
    pub fn trigger_wait(&self, fence: Arc<dyn FenceSync>, timeline: Arc<SyncTimeline>) -> HostResult<()> {
        self.send(SyncCommand::WaitFence {
            fence,
            completion: Completion::Timeline(timeline),
        })
    }

    pub fn trigger_wait_with_callback(
        &self,
        fence: Arc<dyn FenceSync>,
        callback: FenceCompletionCallback,
    ) -> HostResult<()> {
        self.send(SyncCommand::WaitFence {
            fence,
            completion: Completion::Callback(callback),
        })
    }

    /// Wait for a registry-managed fence, then bump `timeline`.
    pub fn trigger_wait_vk(&self, fence: BoxedHandle, timeline: Arc<SyncTimeline>) -> HostResult<()> {
        self.send(SyncCommand::WaitVkFence {
            fence,
            completion: Completion::Timeline(timeline),
        })
    }

    pub fn trigger_wait_vk_with_callback(
        &self,
        fence: BoxedHandle,
        callback: FenceCompletionCallback,
    ) -> HostResult<()> {
        self.send(SyncCommand::WaitVkFence {
            fence,
            completion: Completion::Callback(callback),
        })
    }

    pub fn trigger_wait_vk_qsri_with_callback(
        &self,
        image: BoxedHandle,
        callback: FenceCompletionCallback,
    ) -> HostResult<()> {
        self.send(SyncCommand::WaitVkQsri {
            image,
            completion: Some(Completion::Callback(callback)),
        })
    }

    /// Wait for an image's presentation release on a worker and return the wait result.
    pub fn trigger_wait_vk_qsri_blocked(&self, image: BoxedHandle) -> HostResult<vk::Result> {
        self.send_and_wait(SyncCommand::WaitVkQsri {
            image,
            completion: None,
        })
    }

    /// Wait for a guest fence on a worker without touching any timeline.
    pub fn trigger_blocked_wait_no_timeline(&self, fence: Arc<dyn FenceSync>) -> HostResult<vk::Result> {
        self.send_and_wait(SyncCommand::BlockedWaitNoTimeline(fence))
    }

    pub fn trigger_general(&self, f: impl FnOnce() + Send + 'static) -> HostResult<()> {
        self.send(SyncCommand::General(Box::new(f)))
    }

    /// Run `f` on a worker and wait until it has finished.
    pub fn run_general_blocking(&self, f: impl FnOnce() + Send + 'static) -> HostResult<()> {
        self.send_and_wait(SyncCommand::General(Box::new(f)))
            .map(|_| ())
    }

    /// Stop the workers. Every queued command still runs; later submissions fail.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.broadcast_and_wait(|| SyncCommand::Exit);

        let (flag, cond) = &*self.exiting;
        *flag.lock() = true;
        cond.notify_all();

        if let Some(dispatcher) = self.dispatcher.lock().take() {
            if dispatcher.join().is_err() {
                error!("sync dispatcher thread panicked");
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct NeverWaiter;

    impl HostFenceWaiter for NeverWaiter {
        fn wait_for_fence(&self, _fence: BoxedHandle, _timeout: Duration) -> vk::Result {
            vk::Result::SUCCESS
        }

        fn wait_qsri(&self, _image: BoxedHandle, _timeout: Duration) -> vk::Result {
            vk::Result::TIMEOUT
        }
    }

    struct StuckFence;

    impl FenceSync for StuckFence {
        fn client_wait(&self, _timeout: Duration) -> FenceWaitStatus {
            FenceWaitStatus::TimedOut
        }
    }

    #[derive(Default)]
    struct CountingContext {
        inits: AtomicUsize,
        teardowns: AtomicUsize,
    }

    impl WorkerContext for CountingContext {
        fn init(&self, _worker: usize) {
            self.inits.fetch_add(1, Ordering::SeqCst);
        }

        fn teardown(&self, _worker: usize) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> HostConfig {
        HostConfig::default().with_sync_worker_count(2)
    }

    #[test]
    fn timed_out_wait_still_advances_timeline() {
        let worker = SyncWorker::start(&config(), Arc::new(NeverWaiter), None).unwrap();
        let timeline = SyncTimeline::new();
        worker
            .trigger_wait(Arc::new(StuckFence), Arc::clone(&timeline))
            .unwrap();
        assert!(timeline.wait_for(1, Duration::from_secs(5)));
    }

    #[test]
    fn blocked_wait_reports_status() {
        let worker = SyncWorker::start(&config(), Arc::new(NeverWaiter), None).unwrap();
        assert_eq!(
            worker.trigger_blocked_wait_no_timeline(Arc::new(StuckFence)).unwrap(),
            vk::Result::TIMEOUT
        );
        assert_eq!(
            worker.trigger_wait_vk_qsri_blocked(BoxedHandle::NULL).unwrap(),
            vk::Result::TIMEOUT
        );
    }

    #[test]
    fn context_is_set_up_and_torn_down_per_worker() {
        let ctx = Arc::new(CountingContext::default());
        let worker = SyncWorker::start(
            &config(),
            Arc::new(NeverWaiter),
            Some(Arc::clone(&ctx) as Arc<dyn WorkerContext>),
        )
        .unwrap();
        assert_eq!(ctx.inits.load(Ordering::SeqCst), 2);
        worker.shutdown();
        assert_eq!(ctx.teardowns.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_broadcast_still_waits_for_every_worker() {
        let worker = SyncWorker::start(&config(), Arc::new(NeverWaiter), None).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        worker.broadcast_and_wait(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            SyncCommand::BlockedWaitNoTimeline(Arc::new(StuckFence))
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(worker.run_general_blocking(|| {}).is_ok());
    }

    #[test]
    fn submissions_after_shutdown_are_rejected() {
        let worker = SyncWorker::start(&config(), Arc::new(NeverWaiter), None).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        worker
            .run_general_blocking(move || ran2.store(true, Ordering::SeqCst))
            .unwrap();
        assert!(ran.load(Ordering::SeqCst));

        worker.shutdown();
        assert!(matches!(worker.trigger_general(|| {}), Err(HostError::ShutDown)));
    }
}
