mod common;

use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use vkbridge_host::driver::{FenceCreateInfo, SoftHostDriver};
use vkbridge_host::emulation::NoCpuDecompressor;
use vkbridge_host::sync::{HostFenceWaiter, Ring, SyncWorker, Timelines};
use vkbridge_host::HostConfig;

#[test]
fn shuffled_submitters_run_in_sequence_order() {
    const UNITS: u32 = 32;
    let host = common::host(SoftHostDriver::new());
    let observed = Arc::new(Mutex::new(Vec::new()));

    let mut seqnos: Vec<u32> = (1..=UNITS).collect();
    seqnos.shuffle(&mut rand::thread_rng());

    let barrier = Arc::new(Barrier::new(UNITS as usize));
    let threads: Vec<_> = seqnos
        .into_iter()
        .map(|seqno| {
            let registry = Arc::clone(&host.registry);
            let observed = Arc::clone(&observed);
            let barrier = Arc::clone(&barrier);
            let queue = host.queue;
            thread::spawn(move || {
                barrier.wait();
                registry
                    .run_ordered(queue, true, seqno, || observed.lock().push(seqno))
                    .expect("ordered run");
            })
        })
        .collect();
    for t in threads {
        t.join().expect("submitter panicked");
    }

    assert_eq!(*observed.lock(), (1..=UNITS).collect::<Vec<_>>());
}

#[test]
fn command_buffers_order_independently_of_queues() {
    let host = common::host(SoftHostDriver::new());
    let pool = host
        .registry
        .create_command_pool(host.device, &Default::default())
        .expect("command pool");
    let cb = host.registry.allocate_command_buffers(host.device, pool, 1).expect("allocate")[0];

    // The queue is still waiting for its unit 1; the command buffer is not.
    host.registry.command_buffer_host_sync(cb, true, 1).expect("cb unit 1");
    host.registry.command_buffer_host_sync(cb, true, 2).expect("cb unit 2");
    host.registry.queue_host_sync(host.queue, true, 1).expect("queue unit 1");
}

#[test]
fn missing_predecessor_times_out_and_advances() {
    let host = common::host_with(
        SoftHostDriver::new(),
        HostConfig::default().with_host_sync_timeout(Duration::from_millis(50)),
        Arc::new(NoCpuDecompressor),
    );

    let start = Instant::now();
    host.registry.queue_host_sync(host.queue, true, 2).expect("unit 2");
    assert!(start.elapsed() >= Duration::from_millis(50));

    // Unit 2 advanced the counter, so unit 3 runs without waiting.
    let start = Instant::now();
    host.registry.queue_host_sync(host.queue, true, 3).expect("unit 3");
    assert!(start.elapsed() < Duration::from_millis(50));
}

#[test]
fn rings_complete_independently() {
    let host = common::host(SoftHostDriver::new());
    let config = HostConfig::default().with_sync_worker_count(2);
    let worker = SyncWorker::start(
        &config,
        Arc::clone(&host.registry) as Arc<dyn HostFenceWaiter>,
        None,
    )
    .expect("start sync worker");
    let timelines = Arc::new(Timelines::new(true));

    let stuck = host
        .registry
        .create_fence(host.device, &FenceCreateInfo::default())
        .expect("fence a");
    let released = host
        .registry
        .create_fence(host.device, &FenceCreateInfo::default())
        .expect("fence b");

    let ring_a = Ring::Context { ctx_id: 1, ring_idx: 0 };
    let ring_b = Ring::Context { ctx_id: 2, ring_idx: 0 };
    let (tx, rx) = mpsc::channel();

    for (ring, fence, fence_id) in [(ring_a, stuck, 10u64), (ring_b, released, 20u64)] {
        let task = timelines.enqueue_task(ring);
        let t = Arc::clone(&timelines);
        worker
            .trigger_wait_vk_with_callback(fence, Box::new(move || t.notify_task_completion(task)))
            .expect("queue wait");
        let tx = tx.clone();
        timelines.enqueue_fence(ring, fence_id, Box::new(move || tx.send(fence_id).expect("send")));
    }

    let host_b = host.registry.handles().unbox(released).expect("fence b is live");
    host.driver.signal_fence(host_b);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(20));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    assert_eq!(timelines.pending(ring_a), 2);

    let host_a = host.registry.handles().unbox(stuck).expect("fence a is live");
    host.driver.signal_fence(host_a);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(10));
    worker.shutdown();
}

#[test]
fn fence_waits_for_every_earlier_task_on_its_ring() {
    let timelines = Timelines::new(false);
    let first = timelines.enqueue_task(Ring::Global);
    let second = timelines.enqueue_task(Ring::Global);
    let fired = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::clone(&fired);
    timelines.enqueue_fence(Ring::Global, 5, Box::new(move || f.lock().push(5)));

    timelines.notify_task_completion(second);
    timelines.poll();
    assert!(fired.lock().is_empty());

    timelines.notify_task_completion(first);
    timelines.poll();
    assert_eq!(*fired.lock(), vec![5]);
    assert_eq!(timelines.pending(Ring::Global), 0);
}
