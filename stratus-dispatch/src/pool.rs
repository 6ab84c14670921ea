//! Worker pool draining ready lanes.
//!
//! Workers are plain OS threads sharing one ready queue. A lane enqueues
//! itself exactly once when it transitions from idle to draining; the
//! worker that pops it runs its queued tasks to empty and moves on. Lanes
//! therefore never migrate mid-drain and never run on two workers at once.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::DispatchError;
use crate::lane::Lane;

struct ReadyState {
    queue: std::collections::VecDeque<Lane>,
    shutdown: bool,
}

struct PoolShared {
    ready: Mutex<ReadyState>,
    available: Condvar,
    started: Mutex<usize>,
    started_cond: Condvar,
}

/// Handle lanes use to enqueue themselves when they become ready.
#[derive(Clone)]
pub(crate) struct Scheduler {
    shared: Arc<PoolShared>,
}

impl Scheduler {
    pub(crate) fn schedule(&self, lane: Lane) {
        let mut ready = self.shared.ready.lock();
        ready.queue.push_back(lane);
        drop(ready);
        self.shared.available.notify_one();
    }
}

/// Fixed pool of worker threads servicing ready lanes.
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                ready: Mutex::new(ReadyState {
                    queue: std::collections::VecDeque::new(),
                    shutdown: false,
                }),
                available: Condvar::new(),
                started: Mutex::new(0),
                started_cond: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn scheduler(&self) -> Scheduler {
        Scheduler {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Spawn `count` workers and wait until each reports running.
    pub(crate) fn spawn_workers(
        &self,
        count: usize,
        timeout: Duration,
    ) -> Result<(), DispatchError> {
        let mut threads = self.threads.lock();
        for index in 0..count {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name(format!("stratus-worker-{index}"))
                .spawn(move || worker_loop(shared))
                .map_err(|source| DispatchError::WorkerSpawn {
                    message: source.to_string(),
                })?;
            threads.push(handle);
        }
        drop(threads);

        let deadline = Instant::now() + timeout;
        let mut started = self.shared.started.lock();
        while *started < count {
            if self
                .shared
                .started_cond
                .wait_until(&mut started, deadline)
                .timed_out()
            {
                return Err(DispatchError::WorkerStartTimeout { waited: timeout });
            }
        }
        Ok(())
    }

    /// Stop workers once the ready queue runs dry.
    ///
    /// Lanes already enqueued are still drained before a worker exits.
    pub(crate) fn shutdown(&self) {
        let mut ready = self.shared.ready.lock();
        ready.shutdown = true;
        drop(ready);
        self.shared.available.notify_all();
    }

    /// Join worker threads. Call only after the lanes are drained;
    /// workers blocked in a task would block the join as well.
    pub(crate) fn join(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked outside a lane task");
            }
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    {
        let mut started = shared.started.lock();
        *started += 1;
        shared.started_cond.notify_all();
    }
    loop {
        let lane = {
            let mut ready = shared.ready.lock();
            loop {
                if let Some(lane) = ready.queue.pop_front() {
                    break lane;
                }
                if ready.shutdown {
                    return;
                }
                shared.available.wait(&mut ready);
            }
        };
        lane.drain();
    }
}
