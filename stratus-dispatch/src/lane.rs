//! Serialized execution lanes.
//!
//! A [`Lane`] is an ordered queue of tasks plus the guarantee that at most
//! one of its tasks runs at any time, in submission order. Different lanes
//! run concurrently on the dispatcher's worker pool; one lane gives its
//! tasks the illusion of a single-threaded world.
//!
//! A task body runs to completion on the draining worker; it may start
//! further asynchronous work and return, but it must not block on
//! [`Completion::wait`](crate::Completion::wait), which would deadlock the
//! lane against itself.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use stratus_core::{Disposition, Fault, FaultTracer};

use crate::error::DispatchError;
use crate::pool::Scheduler;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

struct LaneState {
    queue: VecDeque<Task>,
    /// Set while a worker owns the queue; cleared when it runs dry.
    draining: bool,
    /// Set by `destroy`; no further submissions are accepted.
    closed: bool,
}

struct LaneInner {
    id: u64,
    scheduler: Scheduler,
    tracer: Arc<dyn FaultTracer>,
    state: Mutex<LaneState>,
    drained: Condvar,
}

/// A serialized execution context.
///
/// Cheaply cloneable handle; all clones refer to the same queue.
#[derive(Clone)]
pub struct Lane {
    inner: Arc<LaneInner>,
}

impl Lane {
    pub(crate) fn new(id: u64, scheduler: Scheduler, tracer: Arc<dyn FaultTracer>) -> Self {
        Self {
            inner: Arc::new(LaneInner {
                id,
                scheduler,
                tracer,
                state: Mutex::new(LaneState {
                    queue: VecDeque::new(),
                    draining: false,
                    closed: false,
                }),
                drained: Condvar::new(),
            }),
        }
    }

    /// Identifier for logging.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Append a task to the lane's queue.
    ///
    /// If the lane is idle it schedules itself onto the worker pool; if a
    /// worker is already draining it, the task is picked up by the same
    /// drain in order.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::LaneClosed`] after [`Lane::destroy`]; the
    /// task is dropped, which fires any cancel-on-drop guards it carries.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<(), DispatchError> {
        let schedule = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(DispatchError::LaneClosed { lane: self.inner.id });
            }
            state.queue.push_back(Box::new(task));
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };
        if schedule {
            self.inner.scheduler.schedule(self.clone());
        }
        Ok(())
    }

    /// Run queued tasks until the queue is empty. Called by pool workers.
    pub(crate) fn drain(&self) {
        loop {
            let task = {
                let mut state = self.inner.state.lock();
                match state.queue.pop_front() {
                    Some(task) => task,
                    None => {
                        state.draining = false;
                        drop(state);
                        self.inner.drained.notify_all();
                        return;
                    }
                }
            };
            if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                // The lane keeps going; the panic is recorded, not lost.
                let fault = Fault::from_panic(payload.as_ref());
                tracing::warn!(lane = self.inner.id, %fault, "lane task panicked");
                self.inner.tracer.record(Disposition::LaneTask, &fault);
            }
        }
    }

    /// Stop accepting submissions and wait up to `timeout` for the queue
    /// to drain.
    ///
    /// Returns whether the drain completed in time. A `false` return means
    /// tasks are still queued or running; they keep draining in the
    /// background unless the owning dispatcher is torn down.
    pub fn destroy(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        state.closed = true;
        while !state.queue.is_empty() || state.draining {
            if self
                .inner
                .drained
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.queue.is_empty() && !state.draining;
            }
        }
        true
    }

    /// Whether the lane has neither queued nor running tasks.
    pub fn is_idle(&self) -> bool {
        let state = self.inner.state.lock();
        state.queue.is_empty() && !state.draining
    }

    /// Number of tasks waiting in the queue (excluding a running one).
    pub fn backlog(&self) -> usize {
        self.inner.state.lock().queue.len()
    }
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Lane")
            .field("id", &self.inner.id)
            .field("backlog", &state.queue.len())
            .field("draining", &state.draining)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::dispatcher::{Dispatcher, DispatcherConfig};

    fn engine(workers: usize) -> Dispatcher {
        let dispatcher = Dispatcher::new(DispatcherConfig::with_workers(workers));
        dispatcher
            .initialize(Duration::from_secs(1))
            .expect("initialize dispatcher");
        dispatcher
    }

    #[test]
    fn test_tasks_run_in_submission_order() {
        let dispatcher = engine(4);
        let lane = dispatcher.create_lane().expect("create lane");
        let log = Arc::new(StdMutex::new(Vec::new()));

        for index in 0..256usize {
            let log = Arc::clone(&log);
            lane.submit(move || log.lock().expect("log lock").push(index))
                .expect("submit");
        }
        assert!(lane.destroy(Duration::from_secs(5)));
        assert_eq!(*log.lock().expect("log lock"), (0..256).collect::<Vec<_>>());
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_tasks_never_overlap() {
        let dispatcher = engine(4);
        let lane = dispatcher.create_lane().expect("create lane");
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        for _ in 0..128 {
            let active = Arc::clone(&active);
            let overlaps = Arc::clone(&overlaps);
            lane.submit(move || {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                std::thread::sleep(Duration::from_micros(50));
                active.fetch_sub(1, Ordering::SeqCst);
            })
            .expect("submit");
        }
        assert!(lane.destroy(Duration::from_secs(10)));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_lanes_run_concurrently() {
        let dispatcher = engine(2);
        let lane_a = dispatcher.create_lane().expect("create lane a");
        let lane_b = dispatcher.create_lane().expect("create lane b");

        // Task on lane A blocks until the task on lane B has run; only
        // possible if the lanes execute on different workers.
        let gate = Arc::new((parking_lot::Mutex::new(false), Condvar::new()));

        let gate_a = Arc::clone(&gate);
        lane_a
            .submit(move || {
                let (lock, cond) = &*gate_a;
                let mut passed = lock.lock();
                while !*passed {
                    cond.wait(&mut passed);
                }
            })
            .expect("submit a");

        let gate_b = Arc::clone(&gate);
        lane_b
            .submit(move || {
                let (lock, cond) = &*gate_b;
                *lock.lock() = true;
                cond.notify_all();
            })
            .expect("submit b");

        assert!(lane_a.destroy(Duration::from_secs(5)));
        assert!(lane_b.destroy(Duration::from_secs(5)));
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_destroyed_lane_rejects_submissions() {
        let dispatcher = engine(1);
        let lane = dispatcher.create_lane().expect("create lane");
        assert!(lane.destroy(Duration::from_secs(1)));

        let result = lane.submit(|| {});
        assert!(matches!(result, Err(DispatchError::LaneClosed { .. })));
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_panicking_task_does_not_stop_the_lane() {
        struct CountingTracer(AtomicUsize);
        impl FaultTracer for CountingTracer {
            fn record(&self, _disposition: Disposition, _fault: &Fault) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let tracer = Arc::new(CountingTracer(AtomicUsize::new(0)));
        let dispatcher = crate::Dispatcher::with_fault_tracer(
            crate::DispatcherConfig::with_workers(1),
            tracer.clone(),
        );
        dispatcher
            .initialize(Duration::from_secs(1))
            .expect("initialize dispatcher");
        let lane = dispatcher.create_lane().expect("create lane");
        let ran_after = Arc::new(AtomicUsize::new(0));

        lane.submit(|| panic!("task exploded")).expect("submit");
        let ran = Arc::clone(&ran_after);
        lane.submit(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .expect("submit");

        assert!(lane.destroy(Duration::from_secs(5)));
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
        assert_eq!(tracer.0.load(Ordering::SeqCst), 1);
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_destroy_reports_timeout() {
        let dispatcher = engine(1);
        let lane = dispatcher.create_lane().expect("create lane");
        lane.submit(|| std::thread::sleep(Duration::from_millis(400)))
            .expect("submit");

        // Give the worker a moment to start the sleeping task.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!lane.destroy(Duration::from_millis(20)));

        // The queue still drains afterwards.
        assert!(lane.destroy(Duration::from_secs(5)));
        dispatcher.destroy(Duration::from_secs(1));
    }
}
