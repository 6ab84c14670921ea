//! Engine-level tests: ordering and non-overlap across many lanes, and
//! completion observer guarantees under the full worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stratus_dispatch::{Chain, Completion, Dispatcher, DispatcherConfig};

fn engine(workers: usize) -> Dispatcher {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dispatcher = Dispatcher::new(DispatcherConfig::with_workers(workers));
    dispatcher
        .initialize(Duration::from_secs(1))
        .expect("initialize dispatcher");
    dispatcher
}

#[test]
fn test_many_lanes_preserve_per_lane_order() {
    let dispatcher = engine(4);
    let lanes: Vec<_> = (0..8)
        .map(|_| dispatcher.create_lane().expect("create lane"))
        .collect();
    let logs: Vec<Arc<Mutex<Vec<usize>>>> =
        (0..lanes.len()).map(|_| Arc::default()).collect();

    // Interleave submissions across lanes from several producer threads.
    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let lanes = lanes.clone();
            let logs = logs.clone();
            std::thread::spawn(move || {
                for step in 0..64usize {
                    let lane_index = (producer * 64 + step * 7) % lanes.len();
                    let token = producer * 1_000 + step;
                    let log = Arc::clone(&logs[lane_index]);
                    lanes[lane_index]
                        .submit(move || log.lock().expect("log lock").push(token))
                        .expect("submit");
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().expect("producer thread");
    }

    for lane in &lanes {
        assert!(lane.destroy(Duration::from_secs(5)));
    }

    // Within each lane, each producer's tokens must appear in its own
    // submission order.
    for log in &logs {
        let entries = log.lock().expect("log lock");
        for producer in 0..4 {
            let mine: Vec<_> = entries
                .iter()
                .filter(|token| **token / 1_000 == producer)
                .copied()
                .collect();
            let mut sorted = mine.clone();
            sorted.sort_unstable();
            assert_eq!(mine, sorted, "producer {producer} reordered");
        }
    }
    dispatcher.destroy(Duration::from_secs(2));
}

#[test]
fn test_late_observers_fire_exactly_once_in_order() {
    let dispatcher = engine(2);
    let lane = dispatcher.create_lane().expect("create lane");

    let completion: Completion<u32> = Completion::new();
    completion.resolve(7);

    let fired = Arc::new(Mutex::new(Vec::new()));
    let mut derived = Vec::new();
    for index in 0..16usize {
        let fired = Arc::clone(&fired);
        derived.push(completion.observe(&lane, move |outcome| {
            assert_eq!(*outcome, Ok(7));
            fired.lock().expect("fired lock").push(index);
            Chain::Ready(Ok(index))
        }));
    }
    for (index, completion) in derived.iter().enumerate() {
        assert!(completion.wait(Duration::from_secs(1)));
        let outcome = completion.outcome().expect("resolved");
        assert_eq!(*outcome, Ok(index));
    }
    assert_eq!(
        *fired.lock().expect("fired lock"),
        (0..16).collect::<Vec<_>>()
    );
    dispatcher.destroy(Duration::from_secs(2));
}

#[test]
fn test_observer_chains_survive_worker_contention() {
    let dispatcher = engine(2);
    let lane = dispatcher.create_lane().expect("create lane");
    let hops = Arc::new(AtomicUsize::new(0));

    let root: Completion<u32> = Completion::new();
    let mut tip = root.clone();
    for _ in 0..64 {
        let hops = Arc::clone(&hops);
        tip = tip.observe(&lane, move |outcome| {
            hops.fetch_add(1, Ordering::SeqCst);
            Chain::Ready(outcome.clone().map(|value| value + 1))
        });
    }

    root.resolve(0);
    assert!(tip.wait(Duration::from_secs(2)));
    assert_eq!(tip.value(), Some(64));
    assert_eq!(hops.load(Ordering::SeqCst), 64);
    dispatcher.destroy(Duration::from_secs(2));
}
