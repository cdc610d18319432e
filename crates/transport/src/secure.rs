//! Symmetric-encryption overlay for a message channel
//!
//! A [`SecureChannel`] wraps a [`MessageChannel`], encrypting each outgoing
//! attribute bundle under the outbound key/IV and decrypting inbound ones
//! under the independent inbound key/IV. On the wire every secure message is
//! type `7919` with a single `"M"` attribute carrying the ciphertext; the
//! outer framing, including the message context, stays plaintext.

use crate::channel::{ChannelEvent, MessageChannel};
use crate::error::{Result, TransportError};
use graywire_protocol::crypto::{CbcCipher, SymmetricMaterial};
use graywire_protocol::types::{ATTR_ENVELOPE, SECURE_ENVELOPE_TYPE};
use graywire_protocol::Attributes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Failure categories surfaced by [`SecureEvent::Errored`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureErrorKind {
    /// Wrong envelope shape or malformed decrypted payload
    Format,
    /// Decryption failed
    Cryptography,
    /// Re-emitted error from the underlying channel
    Unknown,
}

/// Secure channel events
#[derive(Debug, Clone)]
pub enum SecureEvent {
    /// A message decrypted and parsed cleanly
    MessageReceived {
        /// Outer message context, carried through as-is
        context: u64,
        /// Decrypted inner attributes
        attrs: Attributes,
    },
    /// A per-message failure; the channel keeps running
    Errored {
        /// Failure category
        kind: SecureErrorKind,
        /// Outer message context, where one applies
        context: Option<u64>,
        /// Human-readable detail
        detail: String,
    },
    /// The underlying channel disconnected
    Disconnected,
}

/// A message channel with per-direction symmetric encryption on payloads.
///
/// Owns the wrapped [`MessageChannel`] and disposes it on its own disposal.
pub struct SecureChannel {
    channel: MessageChannel,
    outbound: CbcCipher,
    disposed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("remote_addr", &self.channel.remote_addr())
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Wrap a message channel with established key material.
    ///
    /// `events` must be the wrapped channel's event receiver; the secure
    /// channel takes over consuming it.
    pub fn new(
        channel: MessageChannel,
        events: UnboundedReceiver<ChannelEvent>,
        outbound: &SymmetricMaterial,
        inbound: &SymmetricMaterial,
    ) -> (Self, UnboundedReceiver<SecureEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(secure_worker(
            events,
            event_tx,
            CbcCipher::new(inbound),
            channel.cancel_token(),
        ));
        (
            Self {
                channel,
                outbound: CbcCipher::new(outbound),
                disposed: AtomicBool::new(false),
                worker: Mutex::new(Some(worker)),
            },
            event_rx,
        )
    }

    /// Encrypt an attribute bundle and send it.
    ///
    /// Returns the outer message context.
    pub fn send(&self, attrs: &Attributes) -> Result<u64> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Disposed);
        }
        let blob = attrs.encode()?;
        let ciphertext = self.outbound.encrypt(&blob);
        let mut outer = Attributes::new();
        outer.insert(ATTR_ENVELOPE, ciphertext)?;
        self.channel.send(SECURE_ENVELOPE_TYPE, &outer)
    }

    /// Remote endpoint address of the wrapped channel
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.channel.remote_addr()
    }

    /// Dispose this channel and the wrapped message channel. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel.dispose().await;
        let worker = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        debug!("secure channel disposed");
    }
}

async fn secure_worker(
    mut events: UnboundedReceiver<ChannelEvent>,
    event_tx: UnboundedSender<SecureEvent>,
    inbound: CbcCipher,
    channel_cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = channel_cancel.cancelled() => {
                // The channel stopped. A disconnect queues its event before
                // cancelling, so drain what is left; a plain disposal leaves
                // nothing terminal behind and the worker just exits.
                while let Ok(event) = events.try_recv() {
                    if handle_event(event, &event_tx, &inbound) {
                        return;
                    }
                }
                return;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        if handle_event(event, &event_tx, &inbound) {
            return;
        }
    }
}

/// Process one underlying event; returns true when the worker should stop.
fn handle_event(
    event: ChannelEvent,
    event_tx: &UnboundedSender<SecureEvent>,
    inbound: &CbcCipher,
) -> bool {
    match event {
        ChannelEvent::MessageReceived {
            context,
            type_code,
            attrs,
            ..
        } => {
            let _ = event_tx.send(decrypt_message(context, type_code, &attrs, inbound));
            false
        }
        ChannelEvent::SendComplete { context } => {
            trace!(context, "secure frame committed");
            false
        }
        ChannelEvent::Error {
            context, detail, ..
        } => {
            let _ = event_tx.send(SecureEvent::Errored {
                kind: SecureErrorKind::Unknown,
                context,
                detail,
            });
            false
        }
        ChannelEvent::Disconnected => {
            let _ = event_tx.send(SecureEvent::Disconnected);
            true
        }
    }
}

fn decrypt_message(
    context: u64,
    type_code: u64,
    attrs: &Attributes,
    inbound: &CbcCipher,
) -> SecureEvent {
    let envelope = match attrs.get(ATTR_ENVELOPE) {
        Some(envelope) if type_code == SECURE_ENVELOPE_TYPE && attrs.len() == 1 => envelope,
        _ => {
            return SecureEvent::Errored {
                kind: SecureErrorKind::Format,
                context: Some(context),
                detail: format!(
                    "expected type {SECURE_ENVELOPE_TYPE} with a single {ATTR_ENVELOPE:?} \
                     attribute, got type {type_code} with {} attributes",
                    attrs.len()
                ),
            };
        }
    };

    let plaintext = match inbound.decrypt(envelope) {
        Ok(plaintext) => plaintext,
        Err(err) => {
            return SecureEvent::Errored {
                kind: SecureErrorKind::Cryptography,
                context: Some(context),
                detail: err.to_string(),
            };
        }
    };

    match Attributes::decode(&plaintext) {
        Ok(inner) => SecureEvent::MessageReceived {
            context,
            attrs: inner,
        },
        Err(err) => SecureEvent::Errored {
            kind: SecureErrorKind::Format,
            context: Some(context),
            detail: err.to_string(),
        },
    }
}
