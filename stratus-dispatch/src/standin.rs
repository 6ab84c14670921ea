//! Callback stand-ins: deferred invocation proxies.
//!
//! A [`StandIn`] looks like a callback target but never executes anything
//! itself. Each call on it is reified into an [`Invocation`] record
//! (a [`MethodId`] plus boxed arguments) and submitted to whatever lane
//! and [`Handler`] the stand-in is currently bound to. Until a binding
//! exists, invocations buffer in order; after termination they fail
//! immediately with [`Fault::Terminated`].
//!
//! Method identifiers are compile-time constants derived from the method
//! name, so dispatch is a match on a `u64` instead of reflection:
//!
//! ```
//! use stratus_dispatch::MethodId;
//!
//! const ADD: MethodId = MethodId::of("add");
//! assert_eq!(ADD, MethodId::of("add"));
//! assert_ne!(ADD, MethodId::of("sub"));
//! ```

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;
use stratus_core::{Disposition, Fault, FaultTracer};

use crate::completion::Completion;
use crate::error::DispatchError;
use crate::lane::Lane;

/// Boxed invocation arguments and results.
///
/// `Sync` is required because resolved invocation results are shared with
/// observers on other lanes.
pub type Args = Box<dyn Any + Send + Sync>;

/// Stable identifier for a callback method, hashed from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(
    /// The stable hash value.
    pub u64,
);

impl MethodId {
    /// FNV-1a hash of the method name, computable in const context.
    pub const fn of(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let mut i = 0;
        while i < bytes.len() {
            hash ^= bytes[i] as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            i += 1;
        }
        Self(hash)
    }
}

impl std::fmt::Display for MethodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One reified call: which method, with what arguments.
pub struct Invocation {
    /// Identifier of the invoked method.
    pub method: MethodId,
    /// Boxed arguments; the handler downcasts to the concrete type.
    pub args: Args,
}

impl Invocation {
    /// Build an invocation from a method id and any argument value.
    pub fn new<A: Any + Send + Sync>(method: MethodId, args: A) -> Self {
        Self {
            method,
            args: Box::new(args),
        }
    }

    /// Downcast the arguments to a concrete type, by reference.
    pub fn args_as<A: Any>(&self) -> Option<&A> {
        self.args.downcast_ref::<A>()
    }
}

/// Concrete callback implementation a stand-in can be bound to.
///
/// `handle` runs on the bound lane, one invocation at a time, and must
/// resolve (or stash, or adopt into) the given [`Reply`].
pub trait Handler: Send + 'static {
    /// Process one invocation.
    fn handle(&mut self, invocation: Invocation, reply: Reply);
}

impl<F> Handler for F
where
    F: FnMut(Invocation, Reply) + Send + 'static,
{
    fn handle(&mut self, invocation: Invocation, reply: Reply) {
        self(invocation, reply)
    }
}

/// Slot for an invocation's result.
///
/// Resolve it inline for synchronous handlers, move it into a pending
/// correlation for deferred replies, or [`Reply::adopt`] another
/// completion. Dropping it unresolved fails the invocation with
/// [`Fault::Abandoned`] so the caller never hangs on a forgotten reply.
pub struct Reply {
    slot: Option<Completion<Args>>,
}

impl Reply {
    fn new(slot: Option<Completion<Args>>) -> Self {
        Self { slot }
    }

    /// Whether the caller is waiting on a result (`false` for
    /// fire-and-forget notifications).
    pub fn expects_result(&self) -> bool {
        self.slot.is_some()
    }

    /// Resolve with a success value.
    pub fn succeed<T: Any + Send + Sync>(mut self, value: T) {
        if let Some(completion) = self.slot.take() {
            completion.resolve(Box::new(value));
        }
    }

    /// Resolve with a fault.
    pub fn fail(mut self, fault: Fault) {
        if let Some(completion) = self.slot.take() {
            completion.fail(fault);
        }
    }

    /// Adopt another completion's eventual outcome as the reply.
    pub fn adopt(mut self, completion: Completion<Args>) {
        if let Some(slot) = self.slot.take() {
            completion.pipe_into(slot);
        }
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if let Some(completion) = self.slot.take() {
            if completion.try_fail(Fault::Abandoned) {
                tracing::warn!("reply slot dropped without resolution");
            }
        }
    }
}

struct Buffered {
    invocation: Invocation,
    slot: Option<Completion<Args>>,
}

#[derive(Clone)]
struct Binding {
    handler: Arc<Mutex<dyn Handler>>,
    lane: Lane,
}

enum BindState {
    Unbound { buffered: Vec<Buffered> },
    Bound(Binding),
    Rebinding,
    Terminated,
}

struct StandInInner {
    id: u64,
    tracer: Arc<dyn FaultTracer>,
    state: Mutex<BindState>,
}

/// Deferred-invocation proxy for an arbitrary callback interface.
///
/// Created by [`Dispatcher::stand_in`](crate::Dispatcher::stand_in);
/// bound, rebound, and terminated through the dispatcher. Cloning yields
/// another handle to the same binding.
#[derive(Clone)]
pub struct StandIn {
    inner: Arc<StandInInner>,
}

impl StandIn {
    pub(crate) fn new(id: u64, tracer: Arc<dyn FaultTracer>) -> Self {
        Self {
            inner: Arc::new(StandInInner {
                id,
                tracer,
                state: Mutex::new(BindState::Unbound {
                    buffered: Vec::new(),
                }),
            }),
        }
    }

    /// Identifier for logging.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Invoke a method, returning a completion for its result.
    ///
    /// Unbound: the invocation buffers until the first bind. Terminated:
    /// the completion comes back already failed with
    /// [`Fault::Terminated`].
    pub fn invoke(&self, invocation: Invocation) -> Completion<Args> {
        let completion = Completion::new();
        self.dispatch(invocation, Some(completion.clone()));
        completion
    }

    /// Invoke a method, discarding the result (fire-and-forget).
    pub fn notify(&self, invocation: Invocation) {
        self.dispatch(invocation, None);
    }

    fn dispatch(&self, invocation: Invocation, slot: Option<Completion<Args>>) {
        let binding = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                BindState::Unbound { buffered } => {
                    buffered.push(Buffered { invocation, slot });
                    return;
                }
                BindState::Bound(binding) => binding.clone(),
                BindState::Rebinding | BindState::Terminated => {
                    if let Some(completion) = slot {
                        completion.fail(Fault::Terminated);
                    } else {
                        self.inner
                            .tracer
                            .record(Disposition::LaneTask, &Fault::Terminated);
                    }
                    return;
                }
            }
        };
        Self::submit(&self.inner, &binding, invocation, slot);
    }

    /// Submit one invocation against a captured binding. Invocations
    /// submitted before a rebind keep the binding they captured.
    fn submit(
        inner: &Arc<StandInInner>,
        binding: &Binding,
        invocation: Invocation,
        slot: Option<Completion<Args>>,
    ) {
        let handler = Arc::clone(&binding.handler);
        let reply = Reply::new(slot);
        let standin_id = inner.id;
        let submitted = binding.lane.submit(move || {
            tracing::trace!(stand_in = standin_id, method = %invocation.method, "dispatching invocation");
            handler.lock().handle(invocation, reply);
        });
        if submitted.is_err() {
            // The closed lane dropped the task; the reply's drop guard
            // already failed the caller's completion.
            tracing::debug!(stand_in = standin_id, "invocation dropped, lane closed");
        }
    }

    pub(crate) fn bind(
        &self,
        handler: Arc<Mutex<dyn Handler>>,
        lane: Lane,
        rebind: bool,
    ) -> Result<(), DispatchError> {
        let mut state = self.inner.state.lock();
        let previous = std::mem::replace(&mut *state, BindState::Rebinding);
        match previous {
            BindState::Unbound { buffered } => {
                let binding = Binding { handler, lane };
                *state = BindState::Bound(binding.clone());
                // Flush under the lock so a concurrent invoke cannot
                // overtake the buffered backlog.
                for entry in buffered {
                    Self::submit(&self.inner, &binding, entry.invocation, entry.slot);
                }
                Ok(())
            }
            BindState::Bound(old) => {
                if rebind {
                    *state = BindState::Bound(Binding { handler, lane });
                    Ok(())
                } else {
                    *state = BindState::Bound(old);
                    Err(DispatchError::AlreadyBound { stand_in: self.inner.id })
                }
            }
            BindState::Rebinding => {
                *state = BindState::Terminated;
                Err(DispatchError::Terminated { stand_in: self.inner.id })
            }
            BindState::Terminated => {
                *state = BindState::Terminated;
                Err(DispatchError::Terminated { stand_in: self.inner.id })
            }
        }
    }

    pub(crate) fn terminate(&self) {
        let previous = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut *state, BindState::Terminated)
        };
        if let BindState::Unbound { buffered } = previous {
            for entry in buffered {
                if let Some(completion) = entry.slot {
                    completion.fail(Fault::Terminated);
                }
            }
        }
    }
}

impl std::fmt::Debug for StandIn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        let phase = match &*state {
            BindState::Unbound { buffered } => format!("unbound({} buffered)", buffered.len()),
            BindState::Bound(_) => "bound".to_string(),
            BindState::Rebinding => "rebinding".to_string(),
            BindState::Terminated => "terminated".to_string(),
        };
        f.debug_struct("StandIn")
            .field("id", &self.inner.id)
            .field("state", &phase)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dispatcher::{Dispatcher, DispatcherConfig};

    const ADD: MethodId = MethodId::of("add");
    const LOG: MethodId = MethodId::of("log");

    fn engine() -> Dispatcher {
        let dispatcher = Dispatcher::new(DispatcherConfig::with_workers(2));
        dispatcher
            .initialize(Duration::from_secs(1))
            .expect("initialize dispatcher");
        dispatcher
    }

    /// Adds the two numbers it is given; records notifications.
    struct Arith {
        notified: Arc<Mutex<Vec<MethodId>>>,
    }

    impl Handler for Arith {
        fn handle(&mut self, invocation: Invocation, reply: Reply) {
            match invocation.method {
                ADD => {
                    let (a, b) = *invocation
                        .args_as::<(i64, i64)>()
                        .expect("add arguments");
                    reply.succeed(a + b);
                }
                LOG => {
                    self.notified.lock().push(invocation.method);
                }
                other => reply.fail(Fault::other(format!("unknown method {other}"))),
            }
        }
    }

    #[test]
    fn test_method_id_is_stable() {
        assert_eq!(MethodId::of("add"), ADD);
        assert_ne!(MethodId::of("add"), MethodId::of("sub"));
    }

    #[test]
    fn test_invoke_resolves_through_handler() {
        let dispatcher = engine();
        let lane = dispatcher.create_lane().expect("create lane");
        let stand_in = dispatcher.stand_in();
        dispatcher
            .bind(
                &stand_in,
                Arith {
                    notified: Arc::new(Mutex::new(Vec::new())),
                },
                &lane,
            )
            .expect("bind");

        let completion = stand_in.invoke(Invocation::new(ADD, (2i64, 3i64)));
        assert!(completion.wait(Duration::from_secs(1)));
        let outcome = completion.outcome().expect("resolved");
        let sum = outcome
            .as_ref()
            .as_ref()
            .expect("success")
            .downcast_ref::<i64>()
            .copied()
            .expect("i64 result");
        assert_eq!(sum, 5);
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_unbound_invocations_buffer_in_order() {
        let dispatcher = engine();
        let lane = dispatcher.create_lane().expect("create lane");
        let stand_in = dispatcher.stand_in();
        let notified = Arc::new(Mutex::new(Vec::new()));

        // Submitted before any binding exists.
        stand_in.notify(Invocation::new(LOG, ()));
        let pending = stand_in.invoke(Invocation::new(ADD, (1i64, 1i64)));
        stand_in.notify(Invocation::new(LOG, ()));

        dispatcher
            .bind(
                &stand_in,
                Arith {
                    notified: Arc::clone(&notified),
                },
                &lane,
            )
            .expect("bind");

        assert!(pending.wait(Duration::from_secs(1)));
        assert!(lane.destroy(Duration::from_secs(1)));
        assert_eq!(notified.lock().len(), 2);
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_double_bind_is_rejected() {
        let dispatcher = engine();
        let lane = dispatcher.create_lane().expect("create lane");
        let stand_in = dispatcher.stand_in();
        let handler = |_: Invocation, reply: Reply| reply.succeed(());

        dispatcher.bind(&stand_in, handler, &lane).expect("bind");
        let result = dispatcher.bind(&stand_in, handler, &lane);
        assert!(matches!(result, Err(DispatchError::AlreadyBound { .. })));
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_rebind_routes_later_invocations_to_new_handler() {
        let dispatcher = engine();
        let lane = dispatcher.create_lane().expect("create lane");
        let stand_in = dispatcher.stand_in();

        dispatcher
            .bind(&stand_in, |_: Invocation, reply: Reply| reply.succeed(1i64), &lane)
            .expect("bind");
        let first = stand_in.invoke(Invocation::new(ADD, ()));
        assert!(first.wait(Duration::from_secs(1)));

        dispatcher
            .rebind(&stand_in, |_: Invocation, reply: Reply| reply.succeed(2i64), &lane)
            .expect("rebind");
        let second = stand_in.invoke(Invocation::new(ADD, ()));
        assert!(second.wait(Duration::from_secs(1)));

        let outcome = second.outcome().expect("resolved");
        let value = outcome
            .as_ref()
            .as_ref()
            .expect("success")
            .downcast_ref::<i64>()
            .copied()
            .expect("i64");
        assert_eq!(value, 2);
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_terminated_stand_in_fails_invocations() {
        let dispatcher = engine();
        let stand_in = dispatcher.stand_in();
        let buffered = stand_in.invoke(Invocation::new(ADD, ()));

        dispatcher.terminate(&stand_in);

        // Buffered invocation failed at termination, later ones fail now.
        assert_eq!(buffered.fault(), Some(Fault::Terminated));
        let after = stand_in.invoke(Invocation::new(ADD, ()));
        assert_eq!(after.fault(), Some(Fault::Terminated));
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_dropped_reply_fails_with_abandoned() {
        let dispatcher = engine();
        let lane = dispatcher.create_lane().expect("create lane");
        let stand_in = dispatcher.stand_in();
        dispatcher
            .bind(&stand_in, |_: Invocation, reply: Reply| drop(reply), &lane)
            .expect("bind");

        let completion = stand_in.invoke(Invocation::new(ADD, ()));
        assert!(completion.wait(Duration::from_secs(1)));
        assert_eq!(completion.fault(), Some(Fault::Abandoned));
        dispatcher.destroy(Duration::from_secs(1));
    }

    #[test]
    fn test_reply_adopts_deferred_completion() {
        let dispatcher = engine();
        let lane = dispatcher.create_lane().expect("create lane");
        let stand_in = dispatcher.stand_in();
        let deferred: Completion<Args> = Completion::new();

        let deferred_for_handler = deferred.clone();
        dispatcher
            .bind(
                &stand_in,
                move |_: Invocation, reply: Reply| reply.adopt(deferred_for_handler.clone()),
                &lane,
            )
            .expect("bind");

        let completion = stand_in.invoke(Invocation::new(ADD, ()));
        assert!(!completion.wait(Duration::from_millis(30)));

        deferred.resolve(Box::new(7i64));
        assert!(completion.wait(Duration::from_secs(1)));
        dispatcher.destroy(Duration::from_secs(1));
    }
}
