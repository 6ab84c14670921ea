//! Duplex framed-message channels.
//!
//! A [`Channel`] owns a transport's reader and writer halves on dedicated
//! I/O threads. Outbound messages are encoded and queued without blocking
//! the caller beyond buffering; inbound bytes are buffered across partial
//! reads, framed, decoded, and handed to the registered observer as tasks
//! on a per-channel lane, never on the I/O thread, so a slow handler
//! cannot stall unrelated traffic.
//!
//! On peer EOF or a transport fault the channel flips inactive, refuses
//! further sends, and delivers `on_closed` after every already-decoded
//! message.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use stratus_core::{Disposition, Fault, FaultTracer};
use stratus_dispatch::{Dispatcher, Lane};

use crate::error::ChannelError;
use crate::transport::{ChannelTransport, CloseHook};
use crate::wire::{Frame, FrameError, DEFAULT_MAX_SECTION_SIZE};

/// Encoder/decoder between logical messages and wire frames.
///
/// Metadata and body are produced independently, so implementations can
/// route on metadata without touching the body.
pub trait FrameCodec: Send + Sync + 'static {
    /// The logical message type carried by the channel.
    type Message: Send + 'static;

    /// Encode a message into a frame.
    ///
    /// # Errors
    ///
    /// Returns a codec error if either section fails to serialize.
    fn encode(&self, message: &Self::Message) -> Result<Frame, stratus_core::CodecError>;

    /// Decode a frame into a message.
    ///
    /// # Errors
    ///
    /// Returns a codec error if either section fails to deserialize.
    fn decode(&self, frame: &Frame) -> Result<Self::Message, stratus_core::CodecError>;
}

/// Configuration for channel I/O behavior.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Size of the read buffer handed to each transport read.
    pub read_buffer_size: usize,

    /// Upper bound for one frame section; larger claims close the
    /// channel as corrupt.
    pub max_section_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
            max_section_size: DEFAULT_MAX_SECTION_SIZE,
        }
    }
}

/// Why a channel became inactive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection (EOF).
    PeerClosed,

    /// The transport failed or the inbound stream was corrupt.
    TransportFault {
        /// Description of the failure.
        message: String,
    },

    /// This side terminated the channel.
    LocalShutdown,
}

/// Receiver for a channel's decoded messages and lifecycle events.
///
/// All callbacks run as tasks on the channel's inbound lane, in order:
/// every `on_message` for traffic received before closure is delivered
/// before `on_closed`.
pub trait ChannelObserver<M>: Send + Sync + 'static {
    /// A decoded inbound message.
    fn on_message(&self, message: M);

    /// The channel became inactive.
    fn on_closed(&self, reason: CloseReason);

    /// A well-framed message failed to decode; traffic continues.
    fn on_fault(&self, fault: Fault) {
        let _ = fault;
    }
}

struct OutboundState {
    queue: std::collections::VecDeque<Vec<u8>>,
    /// The writer popped a frame and has not finished writing it yet.
    in_flight: bool,
    closed: bool,
}

/// Writer-thread feed: encoded frames awaiting the transport.
struct Outbound {
    state: Mutex<OutboundState>,
    ready: Condvar,
    drained: Condvar,
}

impl Outbound {
    fn new() -> Self {
        Self {
            state: Mutex::new(OutboundState {
                queue: std::collections::VecDeque::new(),
                in_flight: false,
                closed: false,
            }),
            ready: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    fn push(&self, bytes: Vec<u8>) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ChannelError::Inactive);
        }
        state.queue.push_back(bytes);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Refuse new sends; the writer drains what is queued, then exits.
    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
        self.drained.notify_all();
    }

    /// Pop the next outgoing frame, or `None` once closed and empty.
    fn pop(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        loop {
            if let Some(bytes) = state.queue.pop_front() {
                state.in_flight = true;
                return Some(bytes);
            }
            if state.closed {
                return None;
            }
            self.ready.wait(&mut state);
        }
    }

    /// Writer finished (or abandoned) the popped frame.
    fn wrote(&self) {
        let mut state = self.state.lock();
        state.in_flight = false;
        if state.queue.is_empty() {
            drop(state);
            self.drained.notify_all();
        }
    }

    /// Wait until every queued frame has been written out.
    fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.queue.is_empty() || state.in_flight {
            if self.drained.wait_until(&mut state, deadline).timed_out() {
                return state.queue.is_empty() && !state.in_flight;
            }
        }
        true
    }
}

type BoxedReader = Box<dyn Read + Send>;
type BoxedWriter = Box<dyn Write + Send>;

struct Parts {
    reader: BoxedReader,
    writer: BoxedWriter,
    closer: CloseHook,
}

struct ChannelShared<C: FrameCodec> {
    codec: C,
    config: ChannelConfig,
    lane: Lane,
    tracer: Arc<dyn FaultTracer>,
    observer: Mutex<Option<Arc<dyn ChannelObserver<C::Message>>>>,
    active: AtomicBool,
    parts: Mutex<Option<Parts>>,
    closer: Mutex<Option<CloseHook>>,
    outbound: Outbound,
}

impl<C: FrameCodec> ChannelShared<C> {
    /// Deliver a decoded message through the inbound lane.
    fn deliver(&self, message: C::Message) {
        let observer = self.observer.lock().clone();
        match observer {
            Some(observer) => {
                let submitted = self.lane.submit(move || observer.on_message(message));
                if submitted.is_err() {
                    tracing::debug!("inbound message dropped, channel lane closed");
                }
            }
            None => tracing::warn!("inbound message dropped, no observer registered"),
        }
    }

    /// Report a recoverable decode fault.
    fn report_fault(&self, fault: Fault) {
        self.tracer.record(Disposition::Channel, &fault);
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            let _ = self.lane.submit(move || observer.on_fault(fault));
        }
    }

    /// Flip inactive and deliver `on_closed` exactly once.
    fn close(&self, reason: CloseReason) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(?reason, "channel closing");
        self.outbound.close();
        if let Some(closer) = self.closer.lock().take() {
            closer();
        }
        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            let _ = self.lane.submit(move || observer.on_closed(reason));
        }
    }
}

/// A duplex framed-message channel over one transport.
///
/// Cheaply cloneable handle; clones share the same connection.
pub struct Channel<C: FrameCodec> {
    shared: Arc<ChannelShared<C>>,
}

impl<C: FrameCodec> Clone for Channel<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: FrameCodec> Channel<C> {
    /// Create a channel over `transport`.
    ///
    /// The channel is not live until [`Channel::initialize`] spawns its
    /// I/O threads; register the observer in between.
    ///
    /// # Errors
    ///
    /// Fails if the transport cannot be split or the dispatcher refuses
    /// a new lane.
    pub fn open(
        transport: impl ChannelTransport,
        codec: C,
        dispatcher: &Dispatcher,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        let (reader, writer, closer) = transport.into_parts()?;
        let lane = dispatcher.create_lane()?;
        Ok(Self {
            shared: Arc::new(ChannelShared {
                codec,
                config,
                lane,
                tracer: dispatcher.fault_tracer(),
                observer: Mutex::new(None),
                active: AtomicBool::new(false),
                parts: Mutex::new(Some(Parts {
                    reader: Box::new(reader),
                    writer: Box::new(writer),
                    closer,
                })),
                closer: Mutex::new(None),
                outbound: Outbound::new(),
            }),
        })
    }

    /// Register the observer receiving decoded messages and lifecycle
    /// events. Must happen before [`Channel::initialize`]; inbound
    /// traffic with no observer is dropped.
    pub fn set_observer(&self, observer: Arc<dyn ChannelObserver<C::Message>>) {
        *self.shared.observer.lock() = Some(observer);
    }

    /// Spawn the reader and writer threads.
    ///
    /// # Errors
    ///
    /// [`ChannelError::AlreadyInitialized`] on a second call, or a spawn
    /// failure.
    pub fn initialize(&self, _timeout: Duration) -> Result<(), ChannelError> {
        let parts = self
            .shared
            .parts
            .lock()
            .take()
            .ok_or(ChannelError::AlreadyInitialized)?;
        *self.shared.closer.lock() = Some(parts.closer);
        self.shared.active.store(true, Ordering::SeqCst);

        let reader_shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("stratus-channel-reader".to_string())
            .spawn(move || read_loop(reader_shared, parts.reader))
            .map_err(ChannelError::Io)?;

        let writer_shared = Arc::clone(&self.shared);
        std::thread::Builder::new()
            .name("stratus-channel-writer".to_string())
            .spawn(move || write_loop(writer_shared, parts.writer))
            .map_err(ChannelError::Io)?;
        Ok(())
    }

    /// Encode and queue a message for sending.
    ///
    /// Asynchronous: returns once the frame is buffered for the writer
    /// thread.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Inactive`] once the channel is down, or a codec
    /// error if encoding fails.
    pub fn send(&self, message: &C::Message) -> Result<(), ChannelError> {
        if !self.shared.active.load(Ordering::SeqCst) {
            return Err(ChannelError::Inactive);
        }
        let frame = self.shared.codec.encode(message)?;
        self.shared.outbound.push(frame.encode())
    }

    /// Whether the channel is up.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// The lane inbound messages are delivered on.
    pub fn lane(&self) -> &Lane {
        &self.shared.lane
    }

    /// Stop sending, flush queued frames within `timeout`, and tear the
    /// transport down.
    ///
    /// Returns whether the outbound queue drained in time.
    pub fn terminate(&self, timeout: Duration) -> bool {
        if !self.shared.active.load(Ordering::SeqCst) {
            return true;
        }
        let drained = self.shared.outbound.wait_drained(timeout);
        self.shared.close(CloseReason::LocalShutdown);
        drained
    }
}

fn read_loop<C: FrameCodec>(shared: Arc<ChannelShared<C>>, mut reader: BoxedReader) {
    let mut chunk = vec![0u8; shared.config.read_buffer_size.max(1)];
    let mut buffer = BytesMut::new();
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => {
                shared.close(CloseReason::PeerClosed);
                return;
            }
            Ok(n) => n,
            Err(error) => {
                if shared.active.load(Ordering::SeqCst) {
                    let fault = Fault::other(format!("transport read failed: {error}"));
                    shared.tracer.record(Disposition::Channel, &fault);
                    shared.close(CloseReason::TransportFault {
                        message: error.to_string(),
                    });
                }
                return;
            }
        };
        buffer.extend_from_slice(&chunk[..n]);

        loop {
            match Frame::decode(&mut buffer, shared.config.max_section_size) {
                Ok(Some(frame)) => match shared.codec.decode(&frame) {
                    Ok(message) => shared.deliver(message),
                    Err(error) => {
                        // Framing is intact; skip the one bad message.
                        shared.report_fault(Fault::decode(error));
                    }
                },
                Ok(None) => break,
                Err(error @ FrameError::SectionTooLarge { .. }) => {
                    // Desynchronized stream; nothing after this point can
                    // be trusted.
                    let fault = Fault::decode(&error);
                    shared.tracer.record(Disposition::Channel, &fault);
                    shared.close(CloseReason::TransportFault {
                        message: error.to_string(),
                    });
                    return;
                }
            }
        }
    }
}

fn write_loop<C: FrameCodec>(shared: Arc<ChannelShared<C>>, mut writer: BoxedWriter) {
    while let Some(bytes) = shared.outbound.pop() {
        let result = writer.write_all(&bytes).and_then(|()| writer.flush());
        shared.outbound.wrote();
        if let Err(error) = result {
            if shared.active.load(Ordering::SeqCst) {
                let fault = Fault::other(format!("transport write failed: {error}"));
                shared.tracer.record(Disposition::Channel, &fault);
                shared.close(CloseReason::TransportFault {
                    message: error.to_string(),
                });
            }
            return;
        }
    }
}
