//! The dispatch reactor: lanes, stand-ins, and their lifecycle.
//!
//! A [`Dispatcher`] owns the worker pool and every lane created through
//! it. Components obtain stand-ins here, bind them to handlers on chosen
//! lanes, and tear the whole engine down with a bounded drain at shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use stratus_core::{FaultTracer, TracingFaultTracer};

use crate::error::DispatchError;
use crate::lane::Lane;
use crate::pool::WorkerPool;
use crate::standin::{Handler, StandIn};

/// Configuration for the dispatch engine.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Number of worker threads servicing lanes.
    pub workers: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
        }
    }
}

impl DispatcherConfig {
    /// Configuration with an explicit worker count.
    pub fn with_workers(workers: usize) -> Self {
        Self { workers: workers.max(1) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Terminated,
}

struct DispatcherInner {
    config: DispatcherConfig,
    pool: WorkerPool,
    tracer: Arc<dyn FaultTracer>,
    lanes: Mutex<Vec<Lane>>,
    phase: Mutex<Phase>,
    next_lane: AtomicU64,
    next_stand_in: AtomicU64,
}

/// Owner of the worker pool, all lanes, and all stand-in bindings.
///
/// Cheaply cloneable handle; clones share the same engine.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Create a dispatcher with the default fault tracer.
    pub fn new(config: DispatcherConfig) -> Self {
        Self::with_fault_tracer(config, Arc::new(TracingFaultTracer))
    }

    /// Create a dispatcher routing unobserved faults to `tracer`.
    pub fn with_fault_tracer(config: DispatcherConfig, tracer: Arc<dyn FaultTracer>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                pool: WorkerPool::new(),
                tracer,
                lanes: Mutex::new(Vec::new()),
                phase: Mutex::new(Phase::Created),
                next_lane: AtomicU64::new(1),
                next_stand_in: AtomicU64::new(1),
            }),
        }
    }

    /// Spawn the worker pool and wait for startup within `timeout`.
    ///
    /// Lanes created (and tasks submitted) before initialization simply
    /// queue until workers exist.
    ///
    /// # Errors
    ///
    /// [`DispatchError::AlreadyRunning`] on a second initialization,
    /// [`DispatchError::ShuttingDown`] after destroy, or a worker
    /// spawn/startup failure.
    pub fn initialize(&self, timeout: Duration) -> Result<(), DispatchError> {
        {
            let mut phase = self.inner.phase.lock();
            match *phase {
                Phase::Created => *phase = Phase::Running,
                Phase::Running => return Err(DispatchError::AlreadyRunning),
                Phase::Terminated => return Err(DispatchError::ShuttingDown),
            }
        }
        tracing::debug!(workers = self.inner.config.workers, "dispatcher starting");
        self.inner
            .pool
            .spawn_workers(self.inner.config.workers, timeout)
    }

    /// Create a new lane owned by this dispatcher.
    ///
    /// # Errors
    ///
    /// [`DispatchError::ShuttingDown`] once destroy has begun.
    pub fn create_lane(&self) -> Result<Lane, DispatchError> {
        if *self.inner.phase.lock() == Phase::Terminated {
            return Err(DispatchError::ShuttingDown);
        }
        let id = self.inner.next_lane.fetch_add(1, Ordering::Relaxed);
        let lane = Lane::new(id, self.inner.pool.scheduler(), Arc::clone(&self.inner.tracer));
        self.inner.lanes.lock().push(lane.clone());
        Ok(lane)
    }

    /// Create an unbound stand-in; its invocations buffer until bound.
    pub fn stand_in(&self) -> StandIn {
        let id = self.inner.next_stand_in.fetch_add(1, Ordering::Relaxed);
        StandIn::new(id, Arc::clone(&self.inner.tracer))
    }

    /// Bind a stand-in to a handler running on `lane`.
    ///
    /// Buffered invocations flush to the lane in submission order.
    ///
    /// # Errors
    ///
    /// [`DispatchError::AlreadyBound`] if the stand-in is bound (use
    /// [`Dispatcher::rebind`] when replacing a binding is intended), or
    /// [`DispatchError::Terminated`] after termination.
    pub fn bind(
        &self,
        stand_in: &StandIn,
        handler: impl Handler,
        lane: &Lane,
    ) -> Result<(), DispatchError> {
        stand_in.bind(Arc::new(Mutex::new(handler)), lane.clone(), false)
    }

    /// Replace a stand-in's binding.
    ///
    /// Atomic with respect to in-flight dispatch: invocations already
    /// submitted complete against the old handler, later ones go to the
    /// new one.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Terminated`] after termination.
    pub fn rebind(
        &self,
        stand_in: &StandIn,
        handler: impl Handler,
        lane: &Lane,
    ) -> Result<(), DispatchError> {
        stand_in.bind(Arc::new(Mutex::new(handler)), lane.clone(), true)
    }

    /// Terminate a stand-in: subsequent invocations fail immediately with
    /// a terminated fault; buffered ones fail now.
    pub fn terminate(&self, stand_in: &StandIn) {
        stand_in.terminate();
    }

    /// The fault tracer shared with lanes and transports.
    pub fn fault_tracer(&self) -> Arc<dyn FaultTracer> {
        Arc::clone(&self.inner.tracer)
    }

    /// Drain every owned lane and stop the workers.
    ///
    /// Returns whether every lane drained within `timeout`. On `false`,
    /// undrained tasks are eventually discarded with their cancel guards
    /// fired; callers should treat it as forced teardown.
    pub fn destroy(&self, timeout: Duration) -> bool {
        {
            let mut phase = self.inner.phase.lock();
            if *phase == Phase::Terminated {
                return true;
            }
            *phase = Phase::Terminated;
        }
        let deadline = Instant::now() + timeout;
        let lanes: Vec<Lane> = self.inner.lanes.lock().clone();
        let mut drained = true;
        for lane in &lanes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            drained &= lane.destroy(remaining);
        }
        self.inner.pool.shutdown();
        if drained {
            self.inner.pool.join();
        } else {
            tracing::warn!("dispatcher destroy timed out before lanes drained");
        }
        drained
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.inner.config.workers)
            .field("lanes", &self.inner.lanes.lock().len())
            .field("phase", &*self.inner.phase.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_twice_is_rejected() {
        let dispatcher = Dispatcher::new(DispatcherConfig::with_workers(1));
        dispatcher
            .initialize(Duration::from_secs(1))
            .expect("first initialize");
        assert!(matches!(
            dispatcher.initialize(Duration::from_secs(1)),
            Err(DispatchError::AlreadyRunning)
        ));
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_destroy_drains_owned_lanes() {
        let dispatcher = Dispatcher::new(DispatcherConfig::with_workers(2));
        dispatcher
            .initialize(Duration::from_secs(1))
            .expect("initialize");
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        for _ in 0..4 {
            let lane = dispatcher.create_lane().expect("create lane");
            for _ in 0..16 {
                let counter = Arc::clone(&counter);
                lane.submit(move || {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                })
                .expect("submit");
            }
        }
        assert!(dispatcher.destroy(Duration::from_secs(5)));
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 64);
    }

    #[test]
    fn test_create_lane_after_destroy_is_rejected() {
        let dispatcher = Dispatcher::new(DispatcherConfig::with_workers(1));
        dispatcher
            .initialize(Duration::from_secs(1))
            .expect("initialize");
        assert!(dispatcher.destroy(Duration::from_secs(1)));
        assert!(matches!(
            dispatcher.create_lane(),
            Err(DispatchError::ShuttingDown)
        ));
    }

    #[test]
    fn test_destroy_before_initialize_succeeds_when_empty() {
        let dispatcher = Dispatcher::new(DispatcherConfig::default());
        assert!(dispatcher.destroy(Duration::from_millis(100)));
    }
}
