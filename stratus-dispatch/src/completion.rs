//! Single-assignment completions with observer chaining.
//!
//! A [`Completion`] is the handle through which every asynchronous outcome
//! in the runtime travels. Whoever starts an operation creates one; the
//! operation's implementation resolves it exactly once with a value or a
//! [`Fault`]; any number of waiters either block on [`Completion::wait`]
//! (off lane workers only) or chain continuations with
//! [`Completion::observe`], which never blocks a thread: continuations are
//! submitted as tasks on a caller-chosen [`Lane`] when the upstream
//! completion resolves.
//!
//! Observers registered after resolution are not lost: they are submitted
//! immediately. A continuation that panics resolves its derived completion
//! with [`Fault::Panicked`] instead of unwinding through the lane worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use stratus_core::Fault;

use crate::lane::Lane;

/// Outcome of a continuation: either a ready result or a further
/// completion to chain into the derived completion.
pub enum Chain<T> {
    /// The continuation finished synchronously.
    Ready(Result<T, Fault>),

    /// The continuation started more asynchronous work; the derived
    /// completion adopts this one's eventual outcome.
    Pending(Completion<T>),
}

impl<T> From<Result<T, Fault>> for Chain<T> {
    fn from(result: Result<T, Fault>) -> Self {
        Chain::Ready(result)
    }
}

impl<T> From<Completion<T>> for Chain<T> {
    fn from(completion: Completion<T>) -> Self {
        Chain::Pending(completion)
    }
}

type ObserverFn<T> = Box<dyn FnOnce(Arc<Result<T, Fault>>) + Send>;

enum Observer<T> {
    /// Continuation submitted as a task on a lane.
    Task { lane: Lane, run: ObserverFn<T> },

    /// Internal forwarding hook, run inline on the resolving thread.
    Inline(ObserverFn<T>),
}

enum State<T> {
    Pending(Vec<Observer<T>>),
    Resolved(Arc<Result<T, Fault>>),
}

struct Shared<T> {
    state: Mutex<State<T>>,
    resolved: Condvar,
}

/// Single-assignment future for an outcome-or-fault.
///
/// Cloning yields another handle to the same shared state; resolving any
/// clone resolves them all. The payload type must be `Send + Sync` because
/// the resolved outcome is shared with observers running on other threads.
///
/// # Deadlock warning
///
/// [`Completion::wait`] blocks the calling thread. Calling it from inside a
/// lane task can deadlock the lane against itself; lane code must use
/// [`Completion::observe`] instead.
pub struct Completion<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Completion<T> {
    /// Create a pending completion.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
                resolved: Condvar::new(),
            }),
        }
    }

    /// Create a completion already resolved with `result`.
    pub fn ready(result: Result<T, Fault>) -> Self {
        let completion = Self::new();
        completion.finish(Arc::new(result), true);
        completion
    }

    /// Resolve with a success value.
    ///
    /// # Panics
    ///
    /// Panics if the completion is already resolved; a second resolution
    /// is a protocol-usage bug, not a runtime fault.
    pub fn resolve(&self, value: T) {
        let done = self.finish(Arc::new(Ok(value)), true);
        debug_assert!(done);
    }

    /// Resolve with a fault.
    ///
    /// # Panics
    ///
    /// Panics if the completion is already resolved.
    pub fn fail(&self, fault: Fault) {
        let done = self.finish(Arc::new(Err(fault)), true);
        debug_assert!(done);
    }

    /// Resolve with a success value unless already resolved.
    ///
    /// Returns whether this call performed the resolution. Used on race-prone
    /// paths (drop guards, cancellation) where losing the race is benign.
    pub fn try_resolve(&self, value: T) -> bool {
        self.finish(Arc::new(Ok(value)), false)
    }

    /// Resolve with a fault unless already resolved.
    ///
    /// Returns whether this call performed the resolution.
    pub fn try_fail(&self, fault: Fault) -> bool {
        self.finish(Arc::new(Err(fault)), false)
    }

    fn finish(&self, outcome: Arc<Result<T, Fault>>, strict: bool) -> bool {
        let observers = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Resolved(_) => {
                    if strict {
                        panic!("completion resolved twice");
                    }
                    return false;
                }
                State::Pending(observers) => {
                    let observers = std::mem::take(observers);
                    *state = State::Resolved(Arc::clone(&outcome));
                    observers
                }
            }
        };
        self.shared.resolved.notify_all();
        for observer in observers {
            Self::dispatch(observer, Arc::clone(&outcome));
        }
        true
    }

    fn dispatch(observer: Observer<T>, outcome: Arc<Result<T, Fault>>) {
        match observer {
            Observer::Task { lane, run } => {
                // A closed lane drops the task; the continuation's
                // cancel-on-drop guard fails the derived completion.
                let _ = lane.submit(move || run(outcome));
            }
            Observer::Inline(run) => run(outcome),
        }
    }

    /// Register a continuation to run on `lane` once this completion
    /// resolves, returning a completion for the continuation's own result.
    ///
    /// Continuations registered before resolution run in registration
    /// order. A continuation registered after resolution is submitted
    /// immediately rather than being lost. If the continuation panics or
    /// its lane is gone, the derived completion fails instead of hanging.
    pub fn observe<U, F>(&self, lane: &Lane, f: F) -> Completion<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&Result<T, Fault>) -> Chain<U> + Send + 'static,
    {
        let derived = Completion::<U>::new();
        let guard = CancelOnDrop::new(derived.clone());
        let run: ObserverFn<T> = Box::new(move |outcome| {
            let derived = guard.disarm();
            match catch_unwind(AssertUnwindSafe(|| f(outcome.as_ref()))) {
                Ok(Chain::Ready(result)) => {
                    derived.finish(Arc::new(result), false);
                }
                Ok(Chain::Pending(next)) => next.pipe_into(derived),
                Err(payload) => {
                    derived.try_fail(Fault::from_panic(payload.as_ref()));
                }
            }
        });
        self.register(Observer::Task {
            lane: lane.clone(),
            run,
        });
        derived
    }

    /// Forward this completion's eventual outcome into `target`.
    ///
    /// The hook runs inline on whichever thread resolves this completion;
    /// it only hands the shared outcome over, so that is cheap.
    pub fn pipe_into(&self, target: Completion<T>) {
        self.register(Observer::Inline(Box::new(move |outcome| {
            target.finish(outcome, false);
        })));
    }

    fn register(&self, observer: Observer<T>) {
        let outcome = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                State::Pending(observers) => {
                    observers.push(observer);
                    return;
                }
                State::Resolved(outcome) => Arc::clone(outcome),
            }
        };
        // Registered after resolution: fire immediately instead of losing it.
        Self::dispatch(observer, outcome);
    }

    /// Block the calling thread until resolution or the timeout elapses.
    ///
    /// Returns whether the completion resolved before the deadline. A
    /// `false` return does not cancel anything; the operation may still
    /// resolve later.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if matches!(*state, State::Resolved(_)) {
                return true;
            }
            if self.shared.resolved.wait_until(&mut state, deadline).timed_out() {
                return matches!(*state, State::Resolved(_));
            }
        }
    }

    /// Whether the completion has resolved.
    pub fn is_resolved(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Resolved(_))
    }

    /// The resolved outcome, shared; `None` while pending.
    pub fn outcome(&self) -> Option<Arc<Result<T, Fault>>> {
        match &*self.shared.state.lock() {
            State::Resolved(outcome) => Some(Arc::clone(outcome)),
            State::Pending(_) => None,
        }
    }

    /// The success value, cloned; `None` while pending or failed.
    pub fn value(&self) -> Option<T>
    where
        T: Clone,
    {
        self.outcome()
            .and_then(|outcome| outcome.as_ref().as_ref().ok().cloned())
    }

    /// The fault, cloned; `None` while pending or succeeded.
    pub fn fault(&self) -> Option<Fault> {
        self.outcome()
            .and_then(|outcome| outcome.as_ref().as_ref().err().cloned())
    }
}

/// Fails the wrapped completion with [`Fault::Cancelled`] if dropped
/// without being disarmed, meaning the continuation it belongs to was dropped
/// unexecuted (lane closed or queue discarded at teardown).
struct CancelOnDrop<T: Send + Sync + 'static> {
    completion: Option<Completion<T>>,
}

impl<T: Send + Sync + 'static> CancelOnDrop<T> {
    fn new(completion: Completion<T>) -> Self {
        Self {
            completion: Some(completion),
        }
    }

    fn disarm(mut self) -> Completion<T> {
        self.completion
            .take()
            .expect("cancel guard disarmed twice")
    }
}

impl<T: Send + Sync + 'static> Drop for CancelOnDrop<T> {
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            completion.try_fail(Fault::Cancelled);
        }
    }
}
