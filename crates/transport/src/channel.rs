//! Framed message channel over a duplex stream
//!
//! A [`MessageChannel`] frames outgoing `(type code, attributes, response
//! context)` triples into length-prefixed binary packets and parses incoming
//! ones, using the [`ReadPump`](crate::read_pump::ReadPump) for reads and a
//! single writer task for writes. Events are delivered on the receiver
//! returned by the constructor.
//!
//! Protocol errors are per-message: the channel reports them and keeps
//! serving traffic. Stream errors disconnect the channel, exactly once.

use crate::error::{ErrorKind, ErrorReason, Result, TransportError};
use crate::read_pump::{PumpEvent, ReadPump};
use bytes::{BufMut, Bytes, BytesMut};
use graywire_protocol::types::{HEADER_LEN, START_BYTE, UNKNOWN_CONTEXT};
use graywire_protocol::{Attributes, FrameHeader, ProtocolError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Pump token for header reads
const TOKEN_HEADER: u64 = 0;
/// Pump token for payload reads
const TOKEN_PAYLOAD: u64 = 1;
/// Pump token for draining the payload of a corrupt frame
const TOKEN_DISCARD: u64 = 2;

/// Channel events
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// A complete message arrived and parsed cleanly
    MessageReceived {
        /// Context assigned by the peer
        context: u64,
        /// Application type code
        type_code: u64,
        /// Response context, or `UNKNOWN_CONTEXT`
        response_context: u64,
        /// Attribute payload
        attrs: Attributes,
    },
    /// A previously accepted `send` was committed to the stream
    SendComplete {
        /// Context returned by the `send` call
        context: u64,
    },
    /// A per-message failure; the channel keeps running
    Error {
        /// Which operation failed
        kind: ErrorKind,
        /// Failure category
        reason: ErrorReason,
        /// Message context, where one was parsed
        context: Option<u64>,
        /// Human-readable detail
        detail: String,
    },
    /// The stream is gone; emitted exactly once per channel lifetime
    Disconnected,
}

/// An outgoing frame queued for the writer task
struct Outgoing {
    context: u64,
    frame: Bytes,
}

struct SendState {
    next_context: u64,
    write_tx: Option<UnboundedSender<Outgoing>>,
}

struct ChannelInner {
    send_state: Mutex<SendState>,
    pump: ReadPump,
    event_tx: UnboundedSender<ChannelEvent>,
    disconnected: AtomicBool,
    disposed: AtomicBool,
    cancel: CancellationToken,
    remote_addr: Option<SocketAddr>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelInner {
    /// Exactly-once disconnect: the winning swap emits the event and stops
    /// the workers.
    fn emit_disconnected(&self) {
        if !self.disconnected.swap(true, Ordering::AcqRel) {
            debug!(remote = ?self.remote_addr, "channel disconnected");
            let _ = self.event_tx.send(ChannelEvent::Disconnected);
            self.cancel.cancel();
        }
    }

    fn emit_error(
        &self,
        kind: ErrorKind,
        reason: ErrorReason,
        context: Option<u64>,
        detail: String,
    ) {
        let _ = self.event_tx.send(ChannelEvent::Error {
            kind,
            reason,
            context,
            detail,
        });
    }
}

/// Handle to a framed message channel.
///
/// Cheap to clone; all clones refer to the same channel.
#[derive(Clone)]
pub struct MessageChannel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("remote_addr", &self.inner.remote_addr)
            .field("disconnected", &self.inner.disconnected.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MessageChannel {
    /// Create a channel around an already-connected duplex stream.
    ///
    /// The receive workers start immediately; events arrive on the returned
    /// receiver.
    pub fn from_stream<S>(
        stream: S,
        remote_addr: Option<SocketAddr>,
    ) -> (Self, UnboundedReceiver<ChannelEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (pump, pump_events) = ReadPump::new(Box::new(read_half));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ChannelInner {
            send_state: Mutex::new(SendState {
                next_context: 1,
                write_tx: Some(write_tx),
            }),
            pump,
            event_tx,
            disconnected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            remote_addr,
            workers: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(write_worker(
            Arc::clone(&inner),
            Box::new(write_half),
            write_rx,
        ));
        let receiver = tokio::spawn(receive_worker(Arc::clone(&inner), pump_events));
        if let Ok(mut workers) = inner.workers.lock() {
            workers.push(writer);
            workers.push(receiver);
        }

        (Self { inner }, event_rx)
    }

    /// Dial a TCP endpoint and build a channel on the connection
    pub async fn connect(addr: &str) -> Result<(Self, UnboundedReceiver<ChannelEvent>)> {
        let stream = TcpStream::connect(addr).await?;
        let remote_addr = stream.peer_addr().ok();
        info!(?remote_addr, "connected message channel");
        Ok(Self::from_stream(stream, remote_addr))
    }

    /// Remote endpoint address, when the underlying stream has one
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// Token that fires when the channel's workers stop (disconnect or
    /// disposal); overlays select on it so they never wait on a dead
    /// channel.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Whether the channel is still connected and not disposed
    pub fn is_connected(&self) -> bool {
        !self.inner.disconnected.load(Ordering::Acquire)
            && !self.inner.disposed.load(Ordering::Acquire)
    }

    /// Send a message with no response context
    pub fn send(&self, type_code: u64, attrs: &Attributes) -> Result<u64> {
        self.send_response(type_code, attrs, UNKNOWN_CONTEXT)
    }

    /// Send a message, optionally tagging it as a response.
    ///
    /// Allocates the next message context, queues the frame for the ordered
    /// writer, and returns the context immediately. `SendComplete` fires
    /// once the frame is committed to the stream. On any synchronous
    /// failure no context is consumed and no frame is written.
    pub fn send_response(
        &self,
        type_code: u64,
        attrs: &Attributes,
        response_context: u64,
    ) -> Result<u64> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Disposed);
        }
        if self.inner.disconnected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }

        // Serialize the payload before taking the send lock; this is where
        // oversize attributes and total-length overflow surface.
        let mut payload = BytesMut::with_capacity(attrs.encoded_len().min(1 << 20) as usize);
        if let Err(err) = attrs.encode_into(&mut payload) {
            // An oversize single value is its own caller-observable failure,
            // distinct from the send-failed cases.
            let kind = match err {
                ProtocolError::ValueTooLong { .. } => ErrorKind::MessageTooLong,
                _ => ErrorKind::MessageSendFailed,
            };
            self.inner.emit_error(kind, ErrorReason::ProtocolError, None, err.to_string());
            return Err(err.into());
        }
        let total = HEADER_LEN as u64 + payload.len() as u64;
        if total > i32::MAX as u64 {
            let err = ProtocolError::FrameTooLong(total as usize);
            self.inner.emit_error(
                ErrorKind::MessageSendFailed,
                ErrorReason::ProtocolError,
                None,
                err.to_string(),
            );
            return Err(err.into());
        }

        // Context allocation and enqueue happen under one lock so the
        // writer commits frames in context order.
        let mut state = self
            .inner
            .send_state
            .lock()
            .map_err(|_| TransportError::Disposed)?;
        let write_tx = state.write_tx.as_ref().ok_or(TransportError::NotConnected)?;

        let context = state.next_context;
        if context == UNKNOWN_CONTEXT {
            // Context space exhausted; the sentinel must never go out as a
            // message context.
            return Err(TransportError::NotConnected);
        }

        let mut frame = BytesMut::with_capacity(total as usize);
        frame.put_u8(START_BYTE);
        frame.put_i32_le(total as i32);
        frame.put_u64_le(context);
        frame.put_u64_le(response_context);
        frame.put_u64_le(type_code);
        frame.put_slice(&payload);

        write_tx
            .send(Outgoing {
                context,
                frame: frame.freeze(),
            })
            .map_err(|_| TransportError::NotConnected)?;
        state.next_context += 1;
        trace!(context, type_code, "queued outgoing message");
        Ok(context)
    }

    /// Stop the workers, dispose the read pump, and release the stream.
    /// Idempotent.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut state) = self.inner.send_state.lock() {
            state.write_tx = None;
        }
        self.inner.cancel.cancel();
        self.inner.pump.dispose().await;
        let workers: Vec<JoinHandle<()>> = self
            .inner
            .workers
            .lock()
            .ok()
            .map(|mut slot| slot.drain(..).collect())
            .unwrap_or_default();
        for worker in workers {
            let _ = worker.await;
        }
        debug!(remote = ?self.inner.remote_addr, "message channel disposed");
    }
}

async fn write_worker(
    inner: Arc<ChannelInner>,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut write_rx: UnboundedReceiver<Outgoing>,
) {
    loop {
        let outgoing = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            outgoing = write_rx.recv() => match outgoing {
                Some(outgoing) => outgoing,
                None => break,
            },
        };

        let committed = async {
            writer.write_all(&outgoing.frame).await?;
            writer.flush().await
        }
        .await;

        match committed {
            Ok(()) => {
                trace!(context = outgoing.context, len = outgoing.frame.len(), "frame committed");
                if !inner.disconnected.load(Ordering::Acquire) {
                    let _ = inner.event_tx.send(ChannelEvent::SendComplete {
                        context: outgoing.context,
                    });
                }
            }
            Err(err) => {
                warn!(context = outgoing.context, error = %err, "write failed");
                inner.emit_disconnected();
                break;
            }
        }
    }
}

/// What the receive worker expects the next pump completion to be
enum RecvState {
    Header,
    Payload(FrameHeader),
    Discard,
}

async fn receive_worker(inner: Arc<ChannelInner>, mut pump_events: UnboundedReceiver<PumpEvent>) {
    if inner.pump.begin_read(HEADER_LEN, TOKEN_HEADER).is_err() {
        return;
    }
    let mut state = RecvState::Header;

    loop {
        let event = tokio::select! {
            _ = inner.cancel.cancelled() => break,
            event = pump_events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let (buf, token) = match event {
            PumpEvent::Completed { buf, token } => (buf, token),
            PumpEvent::Disconnected => {
                inner.emit_disconnected();
                break;
            }
        };
        trace!(token, len = buf.len(), "pump completion");

        // Decide what to emit and what to read next.
        let next_read = match std::mem::replace(&mut state, RecvState::Header) {
            RecvState::Header => process_header(&inner, &buf, &mut state),
            RecvState::Payload(header) => process_payload(&inner, header, &buf),
            RecvState::Discard => {
                debug!(len = buf.len(), "drained payload of corrupt frame");
                (HEADER_LEN, TOKEN_HEADER)
            }
        };

        if inner.disconnected.load(Ordering::Acquire) {
            break;
        }
        if inner.pump.begin_read(next_read.0, next_read.1).is_err() {
            break;
        }
        inner.pump.end_read();
    }
}

fn process_header(inner: &ChannelInner, buf: &[u8], state: &mut RecvState) -> (usize, u64) {
    let header = match FrameHeader::parse(buf) {
        Ok(header) => header,
        Err(err) => {
            // The length field itself is unusable, so there is nothing to
            // drain; try the next header.
            inner.emit_error(
                ErrorKind::MessageReceiveFailed,
                ErrorReason::ProtocolError,
                None,
                err.to_string(),
            );
            return (HEADER_LEN, TOKEN_HEADER);
        }
    };

    if let Err(err) = header.validate() {
        inner.emit_error(
            ErrorKind::MessageReceiveFailed,
            ErrorReason::ProtocolError,
            None,
            err.to_string(),
        );
        // The length field parsed, so drain the announced payload to stay
        // aligned on the stream.
        if header.payload_len > 0 {
            *state = RecvState::Discard;
            return (header.payload_len, TOKEN_DISCARD);
        }
        return (HEADER_LEN, TOKEN_HEADER);
    }

    if header.payload_len == 0 {
        deliver(inner, header, Attributes::new());
        return (HEADER_LEN, TOKEN_HEADER);
    }

    *state = RecvState::Payload(header);
    (header.payload_len, TOKEN_PAYLOAD)
}

fn process_payload(inner: &ChannelInner, header: FrameHeader, buf: &[u8]) -> (usize, u64) {
    match Attributes::decode(buf) {
        Ok(attrs) => deliver(inner, header, attrs),
        Err(err) => inner.emit_error(
            ErrorKind::MessageReceiveFailed,
            ErrorReason::ProtocolError,
            Some(header.context),
            err.to_string(),
        ),
    }
    (HEADER_LEN, TOKEN_HEADER)
}

fn deliver(inner: &ChannelInner, header: FrameHeader, attrs: Attributes) {
    if inner.disconnected.load(Ordering::Acquire) {
        return;
    }
    trace!(
        context = header.context,
        type_code = header.type_code,
        attrs = attrs.len(),
        "message received"
    );
    let _ = inner.event_tx.send(ChannelEvent::MessageReceived {
        context: header.context,
        type_code: header.type_code,
        response_context: header.response_context,
        attrs,
    });
}
