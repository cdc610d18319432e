//! Listening-side channel acceptor
//!
//! A thin accept loop: every accepted TCP connection is wrapped in a
//! [`MessageChannel`] and surfaced as a `Connected` event.

use crate::channel::{ChannelEvent, MessageChannel};
use crate::error::Result;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Bind address
    pub bind_addr: String,
}

impl ListenerConfig {
    /// Listen on all interfaces on `port`
    pub fn new(port: u16) -> Self {
        Self {
            bind_addr: format!("0.0.0.0:{port}"),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4747".to_string(),
        }
    }
}

/// Listener events
#[derive(Debug)]
pub enum ListenerEvent {
    /// A connection was accepted and wrapped in a channel
    Connected {
        /// The new channel
        channel: MessageChannel,
        /// The channel's event receiver
        events: UnboundedReceiver<ChannelEvent>,
        /// Peer address
        remote_addr: SocketAddr,
    },
}

/// Accepts connections and constructs a message channel per connection
#[derive(Debug)]
pub struct ChannelListener {
    config: ListenerConfig,
    local_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelListener {
    /// Create a listener; nothing is bound until [`ChannelListener::start`]
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            local_addr: None,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Bind the socket and start the accept loop.
    ///
    /// Accept errors are logged and the loop keeps listening.
    pub async fn start(&mut self) -> Result<UnboundedReceiver<ListenerEvent>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.local_addr = Some(listener.local_addr()?);
        info!(addr = ?self.local_addr, "channel listener started");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote_addr)) => {
                        info!(%remote_addr, "accepted connection");
                        let (channel, events) =
                            MessageChannel::from_stream(stream, Some(remote_addr));
                        if event_tx
                            .send(ListenerEvent::Connected {
                                channel,
                                events,
                                remote_addr,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "failed to accept connection");
                    }
                }
            }
        });
        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
        Ok(event_rx)
    }

    /// Local bound address, available after [`ChannelListener::start`]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to exit. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
