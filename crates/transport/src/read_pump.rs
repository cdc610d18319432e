//! Serialized exact-length reads over the read half of a stream
//!
//! The pump turns a stream that may deliver partial reads into a source of
//! completed fixed-length buffers. Requests are serviced strictly FIFO by a
//! single worker, and the worker does not dequeue the next request until the
//! consumer acknowledges the previous completion with [`ReadPump::end_read`].
//! That gate keeps at most one completion in flight, which is what lets the
//! consumer issue the next `begin_read` from inside its completion handling
//! without reentrancy hazards.

use crate::error::{Result, TransportError};
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A queued exact-length read request
struct ReadRequest {
    /// Bytes to fill
    len: usize,
    /// Opaque consumer state echoed back in the completion
    token: u64,
}

/// Events delivered by the pump worker
#[derive(Debug)]
pub enum PumpEvent {
    /// A request's buffer was filled to exactly the requested length
    Completed {
        /// The filled buffer
        buf: Bytes,
        /// Token supplied with the request
        token: u64,
    },
    /// The stream hit EOF or an I/O error; the worker has stopped
    Disconnected,
}

/// Handle to a running read pump
#[derive(Debug)]
pub struct ReadPump {
    request_tx: UnboundedSender<ReadRequest>,
    gate: Arc<Notify>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ReadPump {
    /// Spawn a pump worker owning `reader`.
    ///
    /// Returns the handle and the receiver on which completions and the
    /// terminal `Disconnected` event are delivered.
    pub fn new(
        reader: Box<dyn AsyncRead + Send + Unpin>,
    ) -> (Self, UnboundedReceiver<PumpEvent>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let gate = Arc::new(Notify::new());
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(pump_worker(
            reader,
            request_rx,
            event_tx,
            Arc::clone(&gate),
            cancel.clone(),
        ));

        (
            Self {
                request_tx,
                gate,
                cancel,
                worker: Mutex::new(Some(worker)),
                disposed: AtomicBool::new(false),
            },
            event_rx,
        )
    }

    /// Enqueue a request to fill a fresh buffer to exactly `len` bytes.
    ///
    /// Returns immediately; the only failure mode is a disposed pump.
    pub fn begin_read(&self, len: usize, token: u64) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Disposed);
        }
        self.request_tx
            .send(ReadRequest { len, token })
            .map_err(|_| TransportError::Disposed)
    }

    /// Acknowledge the completion currently in flight, letting the worker
    /// dequeue the next request.
    pub fn end_read(&self) {
        self.gate.notify_one();
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let worker = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn pump_worker(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    mut request_rx: UnboundedReceiver<ReadRequest>,
    event_tx: UnboundedSender<PumpEvent>,
    gate: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = request_rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let mut buf = BytesMut::zeroed(request.len);
        let filled = tokio::select! {
            _ = cancel.cancelled() => break,
            result = reader.read_exact(&mut buf) => result,
        };

        match filled {
            Ok(_) => {
                trace!(len = request.len, token = request.token, "read request filled");
                if event_tx
                    .send(PumpEvent::Completed {
                        buf: buf.freeze(),
                        token: request.token,
                    })
                    .is_err()
                {
                    break;
                }
                // Hold here until the consumer acknowledges the completion.
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = gate.notified() => {}
                }
            }
            Err(err) => {
                debug!(error = %err, "read pump stream terminated");
                let _ = event_tx.send(PumpEvent::Disconnected);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_fifo_exact_fills_across_partial_writes() {
        let (client, server) = tokio::io::duplex(8);
        let (reader, _writer) = tokio::io::split(server);
        let (pump, mut events) = ReadPump::new(Box::new(reader));

        pump.begin_read(4, 1).unwrap();
        pump.begin_read(3, 2).unwrap();

        // Feed the stream in fragments smaller than either request.
        let mut client = client;
        tokio::spawn(async move {
            for chunk in [&b"ab"[..], &b"cd"[..], &b"ef"[..], &b"g"[..]] {
                client.write_all(chunk).await.unwrap();
            }
            // Keep the writer alive so no EOF interleaves with completions.
            std::future::pending::<()>().await;
        });

        match events.recv().await.unwrap() {
            PumpEvent::Completed { buf, token } => {
                assert_eq!(token, 1);
                assert_eq!(&buf[..], b"abcd");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        pump.end_read();

        match events.recv().await.unwrap() {
            PumpEvent::Completed { buf, token } => {
                assert_eq!(token, 2);
                assert_eq!(&buf[..], b"efg");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        pump.end_read();

        pump.dispose().await;
    }

    #[tokio::test]
    async fn test_eof_raises_disconnected() {
        let (client, server) = tokio::io::duplex(8);
        let (reader, _writer) = tokio::io::split(server);
        let (pump, mut events) = ReadPump::new(Box::new(reader));

        pump.begin_read(4, 7).unwrap();
        drop(client);

        assert!(matches!(
            events.recv().await.unwrap(),
            PumpEvent::Disconnected
        ));
        pump.dispose().await;
    }

    #[tokio::test]
    async fn test_begin_read_after_dispose_fails() {
        let (_client, server) = tokio::io::duplex(8);
        let (reader, _writer) = tokio::io::split(server);
        let (pump, _events) = ReadPump::new(Box::new(reader));

        pump.dispose().await;
        assert!(matches!(
            pump.begin_read(1, 0),
            Err(TransportError::Disposed)
        ));
    }
}
