//! Component endpoints: call/cast over a framed channel.
//!
//! An [`Endpoint`] layers the component protocol over one [`Channel`]:
//! sessions open with a handshake and close with a termination message or
//! channel loss; `call` correlates a request to its asynchronous reply
//! through a per-session [`PendingTable`] and resolves a typed
//! [`Completion`]; `cast` is fire-and-forget; inbound requests are routed
//! into the dispatch engine through a bound callback [`StandIn`].
//!
//! Failure semantics follow the channel: when the transport dies, every
//! session's pending correlations are cancelled so no caller hangs
//! forever.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use stratus_core::{DataCodec, Disposition, Fault, FaultTracer, Reference};
use stratus_dispatch::{Chain, Completion, Dispatcher, Invocation, Lane, MethodId, StandIn};

use crate::channel::{Channel, ChannelConfig, ChannelObserver, CloseReason};
use crate::error::EndpointError;
use crate::pending::{PendingError, PendingTable, Resolution};
use crate::protocol::{Envelope, EnvelopeCodec, Payload, RoleId, SessionId};
use crate::transport::ChannelTransport;

/// Arguments delivered to a bound callback for each inbound call or cast.
///
/// Handlers downcast invocation arguments to this type and, for calls,
/// must succeed their [`Reply`](stratus_dispatch::Reply) with a
/// [`Value`]; anything else is answered with a fault.
#[derive(Debug, Clone)]
pub struct CallInputs {
    /// Operation inputs sent by the caller.
    pub inputs: Value,
    /// Opaque extra data from the call request; `Null` for casts.
    pub extra: Value,
}

/// Observer for session lifecycle events on an endpoint.
///
/// Callbacks run on the endpoint channel's inbound lane. Default
/// implementations do nothing.
pub trait SessionObserver: Send + Sync + 'static {
    /// A session was established (locally or by the peer).
    fn session_created(&self, session: &SessionId) {
        let _ = session;
    }

    /// A session ended cleanly; its pending correlations were cancelled.
    fn session_destroyed(&self, session: &SessionId) {
        let _ = session;
    }

    /// A session was lost to a transport or protocol failure.
    fn session_failed(&self, session: &SessionId, fault: &Fault) {
        let _ = (session, fault);
    }
}

struct Session {
    peer: RoleId,
    pending: Arc<PendingTable<Reference, Value>>,
}

struct EndpointInner<D: DataCodec> {
    role: RoleId,
    codec: D,
    lane: Lane,
    channel: OnceLock<Channel<EnvelopeCodec<D>>>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    callback: Mutex<Option<StandIn>>,
    observer: Mutex<Option<Arc<dyn SessionObserver>>>,
    tracer: Arc<dyn FaultTracer>,
}

/// A component endpoint over one duplex channel.
///
/// Cheaply cloneable handle; clones share the same channel and sessions.
pub struct Endpoint<D: DataCodec> {
    inner: Arc<EndpointInner<D>>,
}

impl<D: DataCodec> Clone for Endpoint<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: DataCodec> Endpoint<D> {
    /// Create an endpoint for `role` over `transport`.
    ///
    /// The endpoint is not live until [`Endpoint::initialize`]; bind the
    /// callback and session observer in between.
    ///
    /// # Errors
    ///
    /// Fails if the channel cannot be opened or the dispatcher refuses a
    /// lane.
    pub fn open(
        transport: impl ChannelTransport,
        role: RoleId,
        codec: D,
        dispatcher: &Dispatcher,
        config: ChannelConfig,
    ) -> Result<Self, EndpointError> {
        let lane = dispatcher.create_lane()?;
        let channel = Channel::open(
            transport,
            EnvelopeCodec::new(codec.clone()),
            dispatcher,
            config,
        )?;
        let inner = Arc::new(EndpointInner {
            role,
            codec,
            lane,
            channel: OnceLock::new(),
            sessions: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
            observer: Mutex::new(None),
            tracer: dispatcher.fault_tracer(),
        });
        channel.set_observer(Arc::clone(&inner) as Arc<dyn ChannelObserver<Envelope>>);
        if inner.channel.set(channel).is_err() {
            unreachable!("endpoint channel installed twice");
        }
        Ok(Self { inner })
    }

    /// Bring the underlying channel up.
    ///
    /// # Errors
    ///
    /// Propagates channel initialization failures.
    pub fn initialize(&self, timeout: Duration) -> Result<(), EndpointError> {
        self.inner.channel().initialize(timeout)?;
        Ok(())
    }

    /// Bind the callback stand-in receiving inbound calls and casts.
    ///
    /// The stand-in must be bound to a handler via the dispatcher; for
    /// each inbound call the handler receives [`CallInputs`] under the
    /// [`MethodId`] of the operation name and must succeed its reply
    /// with a [`Value`].
    ///
    /// # Errors
    ///
    /// [`EndpointError::CallbackAlreadyBound`] on a second bind.
    pub fn bind_callback(&self, stand_in: &StandIn) -> Result<(), EndpointError> {
        let mut callback = self.inner.callback.lock();
        if callback.is_some() {
            return Err(EndpointError::CallbackAlreadyBound);
        }
        *callback = Some(stand_in.clone());
        Ok(())
    }

    /// Register the session lifecycle observer.
    pub fn set_session_observer(&self, observer: Arc<dyn SessionObserver>) {
        *self.inner.observer.lock() = Some(observer);
    }

    /// Open a session towards `peer`, sending the handshake message.
    ///
    /// # Errors
    ///
    /// Propagates the channel send failure; no session is registered in
    /// that case.
    pub fn open_session(&self, peer: RoleId) -> Result<SessionId, EndpointError> {
        let session = SessionId::fresh(&self.inner.role, &peer);
        {
            let mut sessions = self.inner.sessions.lock();
            sessions.insert(
                session.clone(),
                Session {
                    peer: peer.clone(),
                    pending: Arc::new(PendingTable::new()),
                },
            );
        }
        let hello = Envelope::new(
            session.clone(),
            self.inner.codec.content_type(),
            Payload::Hello {
                initiator: self.inner.role.clone(),
                responder: peer,
            },
        );
        if let Err(error) = self.inner.channel().send(&hello) {
            self.inner.sessions.lock().remove(&session);
            return Err(error.into());
        }
        tracing::debug!(%session, "session opened");
        self.inner.notify_created(&session);
        Ok(session)
    }

    /// Close a session: cancel its pending calls, send the termination
    /// message, and notify the observer.
    ///
    /// # Errors
    ///
    /// [`EndpointError::UnknownSession`] if no such session exists.
    pub fn close_session(
        &self,
        session: &SessionId,
        reason: Option<String>,
    ) -> Result<(), EndpointError> {
        let removed = self.inner.sessions.lock().remove(session);
        let state = removed.ok_or_else(|| EndpointError::UnknownSession {
            session: session.clone(),
        })?;
        let cancelled = state.pending.cancel_all(Fault::Cancelled);
        if cancelled > 0 {
            tracing::debug!(%session, cancelled, "cancelled pending calls at session close");
        }
        let goodbye = Envelope::new(
            session.clone(),
            self.inner.codec.content_type(),
            Payload::Goodbye { reason },
        );
        if let Err(error) = self.inner.channel().send(&goodbye) {
            tracing::debug!(%session, %error, "termination message not sent");
        }
        self.inner.notify_destroyed(session);
        Ok(())
    }

    /// Issue a correlated call within `session`.
    ///
    /// Returns a completion for the typed outputs; every failure mode
    /// (unknown session, encode failure, send failure, remote fault,
    /// cancellation) arrives as the completion's fault rather than a
    /// thrown error.
    pub fn call<I, O>(
        &self,
        session: &SessionId,
        operation: &str,
        inputs: &I,
    ) -> Completion<O>
    where
        I: Serialize,
        O: DeserializeOwned + Send + Sync + 'static,
    {
        self.call_with_extra(session, operation, inputs, Value::Null)
    }

    /// [`Endpoint::call`] with opaque extra data passed through to the
    /// callee untouched.
    pub fn call_with_extra<I, O>(
        &self,
        session: &SessionId,
        operation: &str,
        inputs: &I,
        extra: Value,
    ) -> Completion<O>
    where
        I: Serialize,
        O: DeserializeOwned + Send + Sync + 'static,
    {
        let pending = match self.inner.session_pending(session) {
            Some(pending) => pending,
            None => {
                return Completion::ready(Err(Fault::other(format!(
                    "unknown session {session}"
                ))))
            }
        };
        let inputs = match serde_json::to_value(inputs) {
            Ok(inputs) => inputs,
            Err(error) => {
                return Completion::ready(Err(Fault::other(format!(
                    "inputs not serializable: {error}"
                ))))
            }
        };

        let reference = Reference::fresh();
        let raw: Completion<Value> = Completion::new();
        if let Err(error) = pending.register(reference, raw.clone()) {
            return Completion::ready(Err(match error {
                PendingError::Closed => Fault::Cancelled,
                other => Fault::other(other),
            }));
        }

        let request = Envelope::new(
            session.clone(),
            self.inner.codec.content_type(),
            Payload::CallRequest {
                reference,
                operation: operation.to_string(),
                inputs,
                extra,
            },
        );
        tracing::trace!(%session, %reference, operation, "call issued");
        if let Err(error) = self.inner.channel().send(&request) {
            let fault = send_fault(&error);
            // Registered above; the entry must still be there.
            if pending.resolve_failure(&reference, fault).is_err() {
                tracing::error!(%reference, "call entry vanished before send failure");
            }
        }

        raw.observe(&self.inner.lane, |outcome| match outcome {
            Ok(value) => Chain::Ready(
                serde_json::from_value::<O>(value.clone())
                    .map_err(|error| Fault::decode(format!("outputs: {error}"))),
            ),
            Err(fault) => Chain::Ready(Err(fault.clone())),
        })
    }

    /// Issue a fire-and-forget cast within `session`.
    ///
    /// The returned completion reflects the local send outcome only; the
    /// remote side neither replies nor acknowledges.
    pub fn cast<I: Serialize>(
        &self,
        session: &SessionId,
        operation: &str,
        inputs: &I,
    ) -> Completion<()> {
        if self.inner.session_pending(session).is_none() {
            return Completion::ready(Err(Fault::other(format!("unknown session {session}"))));
        }
        let inputs = match serde_json::to_value(inputs) {
            Ok(inputs) => inputs,
            Err(error) => {
                return Completion::ready(Err(Fault::other(format!(
                    "inputs not serializable: {error}"
                ))))
            }
        };
        let request = Envelope::new(
            session.clone(),
            self.inner.codec.content_type(),
            Payload::CastRequest {
                operation: operation.to_string(),
                inputs,
            },
        );
        match self.inner.channel().send(&request) {
            Ok(()) => Completion::ready(Ok(())),
            Err(error) => Completion::ready(Err(send_fault(&error))),
        }
    }

    /// Number of calls awaiting replies within `session`.
    pub fn pending_count(&self, session: &SessionId) -> usize {
        self.inner
            .session_pending(session)
            .map_or(0, |pending| pending.len())
    }

    /// Whether the underlying channel is up.
    pub fn is_active(&self) -> bool {
        self.inner.channel().is_active()
    }

    /// Drain in-flight calls, then terminate the channel.
    ///
    /// Waits up to `timeout` for every session's pending calls to
    /// resolve; calls still pending at the deadline are failed with
    /// [`Fault::Cancelled`]. Returns whether everything drained in time.
    pub fn destroy(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let sessions: Vec<(SessionId, Session)> =
            self.inner.sessions.lock().drain().collect();

        let mut drained = true;
        for (_, session) in &sessions {
            let remaining = deadline.saturating_duration_since(Instant::now());
            drained &= session.pending.wait_idle(remaining);
        }
        for (id, session) in &sessions {
            let cancelled = session.pending.cancel_all(Fault::Cancelled);
            if cancelled > 0 {
                tracing::warn!(session = %id, cancelled, "forced teardown cancelled pending calls");
            }
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        drained &= self.inner.channel().terminate(remaining);
        for (id, _) in &sessions {
            self.inner.notify_destroyed(id);
        }
        drained
    }
}

fn send_fault(error: &crate::error::ChannelError) -> Fault {
    match error {
        crate::error::ChannelError::Inactive => Fault::ChannelInactive,
        other => Fault::other(other),
    }
}

impl<D: DataCodec> EndpointInner<D> {
    fn channel(&self) -> &Channel<EnvelopeCodec<D>> {
        self.channel
            .get()
            .expect("endpoint channel installed at open")
    }

    fn session_pending(&self, session: &SessionId) -> Option<Arc<PendingTable<Reference, Value>>> {
        self.sessions
            .lock()
            .get(session)
            .map(|state| Arc::clone(&state.pending))
    }

    fn notify_created(&self, session: &SessionId) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.session_created(session);
        }
    }

    fn notify_destroyed(&self, session: &SessionId) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.session_destroyed(session);
        }
    }

    fn notify_failed(&self, session: &SessionId, fault: &Fault) {
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.session_failed(session, fault);
        }
    }

    fn protocol_fault(&self, message: impl std::fmt::Display) {
        let fault = Fault::other(message);
        tracing::error!(%fault, "protocol violation");
        self.tracer.record(Disposition::Channel, &fault);
    }

    fn send_reply(&self, session: &SessionId, reference: Reference, outcome: Result<Value, Fault>) {
        let reply = Envelope::new(
            session.clone(),
            self.codec.content_type(),
            Payload::CallReply { reference, outcome },
        );
        if let Err(error) = self.channel().send(&reply) {
            tracing::debug!(%session, %reference, %error, "reply not sent, channel down");
        }
    }

    fn on_hello(&self, session: SessionId, initiator: RoleId, responder: RoleId) {
        if responder != self.role {
            self.protocol_fault(format!(
                "handshake for role {responder}, this endpoint is {role}",
                role = self.role
            ));
            return;
        }
        {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(&session) {
                drop(sessions);
                self.protocol_fault(format!("duplicate handshake for session {session}"));
                return;
            }
            sessions.insert(
                session.clone(),
                Session {
                    peer: initiator,
                    pending: Arc::new(PendingTable::new()),
                },
            );
        }
        tracing::debug!(%session, "session accepted");
        self.notify_created(&session);
    }

    fn on_call_request(
        &self,
        session: SessionId,
        reference: Reference,
        operation: String,
        inputs: Value,
        extra: Value,
    ) {
        if self.session_pending(&session).is_none() {
            self.protocol_fault(format!("call request on unknown session {session}"));
            return;
        }
        let stand_in = self.callback.lock().clone();
        let stand_in = match stand_in {
            Some(stand_in) => stand_in,
            None => {
                self.send_reply(
                    &session,
                    reference,
                    Err(Fault::remote("no callback bound at callee")),
                );
                return;
            }
        };

        let invocation = Invocation::new(MethodId::of(&operation), CallInputs { inputs, extra });
        let completion = stand_in.invoke(invocation);

        // Reply from the endpoint's own lane once the handler resolves.
        let channel = self.channel().clone();
        let content_type = self.codec.content_type();
        completion.observe(&self.lane, move |outcome| {
            let outcome = match outcome {
                Ok(args) => match args.downcast_ref::<Value>() {
                    Some(value) => Ok(value.clone()),
                    None => Err(Fault::remote("callback produced a non-value result")),
                },
                Err(fault) => Err(fault.clone()),
            };
            let reply = Envelope::new(
                session.clone(),
                content_type,
                Payload::CallReply { reference, outcome },
            );
            if let Err(error) = channel.send(&reply) {
                tracing::debug!(%session, %reference, %error, "reply not sent, channel down");
            }
            Chain::Ready(Ok(()))
        });
    }

    fn on_call_reply(&self, session: SessionId, reference: Reference, outcome: Result<Value, Fault>) {
        let pending = match self.session_pending(&session) {
            Some(pending) => pending,
            None => {
                self.protocol_fault(format!("reply on unknown session {session}"));
                return;
            }
        };
        let resolved = match outcome {
            Ok(value) => pending.resolve_success(&reference, value),
            Err(fault) => pending.resolve_failure(&reference, fault),
        };
        match resolved {
            Ok(Resolution::Delivered) => {}
            Ok(Resolution::Superseded) => {
                tracing::debug!(%session, %reference, "late reply for cancelled call ignored");
            }
            Err(_) => {
                // An unmatched reply is a protocol violation, not noise.
                let fault = Fault::other(format!("unmatched reply {reference} on {session}"));
                tracing::error!(%fault, "dropping unmatched reply");
                self.tracer.record(Disposition::UnmatchedReply, &fault);
            }
        }
    }

    fn on_cast_request(&self, session: SessionId, operation: String, inputs: Value) {
        if self.session_pending(&session).is_none() {
            self.protocol_fault(format!("cast request on unknown session {session}"));
            return;
        }
        let stand_in = self.callback.lock().clone();
        match stand_in {
            Some(stand_in) => stand_in.notify(Invocation::new(
                MethodId::of(&operation),
                CallInputs {
                    inputs,
                    extra: Value::Null,
                },
            )),
            None => tracing::warn!(%session, operation, "cast dropped, no callback bound"),
        }
    }

    fn on_goodbye(&self, session: SessionId, reason: Option<String>) {
        let removed = self.sessions.lock().remove(&session);
        match removed {
            Some(state) => {
                let cancelled = state.pending.cancel_all(Fault::Cancelled);
                tracing::debug!(%session, ?reason, cancelled, "session terminated by peer");
                self.notify_destroyed(&session);
            }
            None => self.protocol_fault(format!("termination for unknown session {session}")),
        }
    }
}

impl<D: DataCodec> ChannelObserver<Envelope> for EndpointInner<D> {
    fn on_message(&self, envelope: Envelope) {
        if !envelope.is_consistent() {
            self.protocol_fault(format!(
                "message class {:?} does not match its payload",
                envelope.head.class
            ));
            return;
        }
        let session = envelope.head.session;
        match envelope.payload {
            Payload::Hello {
                initiator,
                responder,
            } => self.on_hello(session, initiator, responder),
            Payload::CallRequest {
                reference,
                operation,
                inputs,
                extra,
            } => self.on_call_request(session, reference, operation, inputs, extra),
            Payload::CallReply { reference, outcome } => {
                self.on_call_reply(session, reference, outcome)
            }
            Payload::CastRequest { operation, inputs } => {
                self.on_cast_request(session, operation, inputs)
            }
            Payload::Goodbye { reason } => self.on_goodbye(session, reason),
        }
    }

    fn on_closed(&self, reason: CloseReason) {
        let sessions: Vec<(SessionId, Session)> = self.sessions.lock().drain().collect();
        if sessions.is_empty() {
            return;
        }
        let fault = match &reason {
            CloseReason::PeerClosed | CloseReason::LocalShutdown => Fault::ChannelInactive,
            CloseReason::TransportFault { message } => Fault::other(message),
        };
        for (id, session) in sessions {
            let cancelled = session.pending.cancel_all(fault.clone());
            tracing::debug!(session = %id, peer = %session.peer, cancelled, ?reason, "session lost with channel");
            match &reason {
                CloseReason::LocalShutdown => self.notify_destroyed(&id),
                _ => self.notify_failed(&id, &fault),
            }
        }
    }

    fn on_fault(&self, fault: Fault) {
        tracing::warn!(%fault, "channel reported a decode fault");
    }
}
