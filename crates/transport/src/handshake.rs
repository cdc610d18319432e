//! Two-step asymmetric handshake negotiating a secure channel
//!
//! Over a plaintext [`MessageChannel`], each endpoint ships its RSA public
//! key (type `4391`, attribute `"R"`) and answers a received public key with
//! its freshly generated AES key and IV, OAEP-wrapped (type `4392`,
//! attributes `"V"` and `"K"`). Once an endpoint has both sent its wrapped
//! material and decrypted the peer's, the handshake is complete and the
//! channel is handed to a [`SecureChannel`].
//!
//! The handshaker is transient: it emits exactly one terminal event,
//! `Completed` or `Errored`, and is disposable the instant either fires.
//! Partial success is never surfaced.

use crate::channel::{ChannelEvent, MessageChannel};
use crate::error::{HandshakeFailure, Result, TransportError};
use crate::secure::{SecureChannel, SecureEvent};
use graywire_protocol::crypto::{PeerPublicKey, RsaKeyPair, SymmetricMaterial, RSA_KEY_BITS};
use graywire_protocol::types::{
    ATTR_PUBLIC_KEY, ATTR_WRAPPED_IV, ATTR_WRAPPED_KEY, HANDSHAKE_KEY_MATERIAL_TYPE,
    HANDSHAKE_PUBLIC_KEY_TYPE,
};
use graywire_protocol::Attributes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{self, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Handshake parameters
#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    /// RSA modulus length for the local keypair.
    ///
    /// Tests shrink this to keep key generation fast; peers need no
    /// agreement on it since the public key blob is self-describing.
    pub rsa_key_bits: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            rsa_key_bits: RSA_KEY_BITS,
        }
    }
}

/// Handshaker events; exactly one is emitted per handshaker
#[derive(Debug)]
pub enum HandshakeEvent {
    /// Both directions completed; the channel is now secure
    Completed {
        /// The ready secure channel, owning the former message channel
        channel: SecureChannel,
        /// Event receiver for the secure channel
        events: UnboundedReceiver<SecureEvent>,
    },
    /// The handshake terminated without a secure channel
    Errored {
        /// Why it failed
        reason: HandshakeFailure,
    },
}

enum Command {
    Initiate,
}

/// Handle to a running handshaker
#[derive(Debug)]
pub struct Handshaker {
    command_tx: UnboundedSender<Command>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl Handshaker {
    /// Start a handshaker over a plaintext channel with default parameters.
    ///
    /// `events` must be the channel's event receiver; the handshaker
    /// consumes it and threads it through to the secure channel on success.
    pub fn new(
        channel: MessageChannel,
        events: UnboundedReceiver<ChannelEvent>,
    ) -> (Self, UnboundedReceiver<HandshakeEvent>) {
        Self::with_config(channel, events, HandshakeConfig::default())
    }

    /// Start a handshaker with explicit parameters
    pub fn with_config(
        channel: MessageChannel,
        events: UnboundedReceiver<ChannelEvent>,
        config: HandshakeConfig,
    ) -> (Self, UnboundedReceiver<HandshakeEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(handshake_worker(
            channel,
            events,
            config,
            command_rx,
            event_tx,
            cancel.clone(),
        ));

        (
            Self {
                command_tx,
                cancel,
                worker: Mutex::new(Some(worker)),
                disposed: AtomicBool::new(false),
            },
            event_rx,
        )
    }

    /// Send the local public key to the peer.
    ///
    /// One side initiating is enough: a handshaker that receives a public
    /// key before having sent its own responds with its own first.
    pub fn initiate(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Disposed);
        }
        self.command_tx
            .send(Command::Initiate)
            .map_err(|_| TransportError::Disposed)
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

/// Per-handshake mutable state, owned by the worker
struct HandshakeState {
    keypair: RsaKeyPair,
    outbound_material: SymmetricMaterial,
    sent_public_key: bool,
    outbound_complete: bool,
    inbound_material: Option<SymmetricMaterial>,
}

impl HandshakeState {
    fn is_complete(&self) -> bool {
        self.outbound_complete && self.inbound_material.is_some()
    }
}

async fn handshake_worker(
    channel: MessageChannel,
    mut events: UnboundedReceiver<ChannelEvent>,
    config: HandshakeConfig,
    mut command_rx: UnboundedReceiver<Command>,
    event_tx: UnboundedSender<HandshakeEvent>,
    cancel: CancellationToken,
) {
    // RSA key generation is heavy; keep it off the async threads. Commands
    // and events queue up behind it and are handled as soon as it lands.
    let bits = config.rsa_key_bits;
    let keypair = tokio::select! {
        _ = cancel.cancelled() => return,
        generated = task::spawn_blocking(move || RsaKeyPair::generate_with_bits(bits)) => {
            match generated {
                Ok(Ok(keypair)) => keypair,
                Ok(Err(err)) => {
                    fail(&channel, &event_tx, HandshakeFailure::KeyGeneration(err.to_string())).await;
                    return;
                }
                Err(err) => {
                    fail(&channel, &event_tx, HandshakeFailure::KeyGeneration(err.to_string())).await;
                    return;
                }
            }
        }
    };
    debug!(bits, "handshake keypair ready");

    let mut state = HandshakeState {
        keypair,
        outbound_material: SymmetricMaterial::generate(),
        sent_public_key: false,
        outbound_complete: false,
        inbound_material: None,
    };
    let channel_cancel = channel.cancel_token();

    let outcome = loop {
        let step = tokio::select! {
            _ = cancel.cancelled() => return,
            _ = channel_cancel.cancelled() => {
                // Drain anything the channel queued before it stopped; a
                // disconnect will have queued its Disconnected event.
                loop {
                    match events.try_recv() {
                        Ok(event) => match process_event(&channel, &mut state, event) {
                            Ok(()) if state.is_complete() => break,
                            Ok(()) => continue,
                            Err(reason) => {
                                fail(&channel, &event_tx, reason).await;
                                return;
                            }
                        },
                        Err(_) => {
                            fail(&channel, &event_tx, HandshakeFailure::ChannelDisconnected).await;
                            return;
                        }
                    }
                }
                Ok(())
            }
            command = command_rx.recv() => match command {
                Some(Command::Initiate) => send_public_key(&channel, &mut state),
                None => return,
            },
            event = events.recv() => match event {
                Some(event) => process_event(&channel, &mut state, event),
                None => break Err(HandshakeFailure::ChannelDisconnected),
            },
        };

        match step {
            Ok(()) if state.is_complete() => break Ok(()),
            Ok(()) => {}
            Err(reason) => break Err(reason),
        }
    };

    match outcome {
        Ok(()) => {
            info!(remote = ?channel.remote_addr(), "handshake complete");
            let inbound = match state.inbound_material.take() {
                Some(inbound) => inbound,
                // Unreachable: is_complete() checked above.
                None => {
                    fail(
                        &channel,
                        &event_tx,
                        HandshakeFailure::Format("handshake completed without inbound material".into()),
                    )
                    .await;
                    return;
                }
            };
            let (secure, secure_events) =
                SecureChannel::new(channel, events, &state.outbound_material, &inbound);
            let _ = event_tx.send(HandshakeEvent::Completed {
                channel: secure,
                events: secure_events,
            });
        }
        Err(reason) => fail(&channel, &event_tx, reason).await,
    }
}

async fn fail(
    channel: &MessageChannel,
    event_tx: &UnboundedSender<HandshakeEvent>,
    reason: HandshakeFailure,
) {
    warn!(%reason, "handshake failed");
    let _ = event_tx.send(HandshakeEvent::Errored { reason });
    // A failed handshake never hands the channel back; dispose it.
    channel.dispose().await;
}

fn process_event(
    channel: &MessageChannel,
    state: &mut HandshakeState,
    event: ChannelEvent,
) -> std::result::Result<(), HandshakeFailure> {
    match event {
        ChannelEvent::MessageReceived {
            type_code, attrs, ..
        } => match type_code {
            HANDSHAKE_PUBLIC_KEY_TYPE => on_public_key(channel, state, &attrs),
            HANDSHAKE_KEY_MATERIAL_TYPE => on_key_material(state, &attrs),
            other => Err(HandshakeFailure::Format(format!(
                "unexpected message type {other} during handshake"
            ))),
        },
        ChannelEvent::SendComplete { context } => {
            trace!(context, "handshake frame committed");
            Ok(())
        }
        ChannelEvent::Error { detail, .. } => Err(HandshakeFailure::ChannelError(detail)),
        ChannelEvent::Disconnected => Err(HandshakeFailure::ChannelDisconnected),
    }
}

fn send_public_key(
    channel: &MessageChannel,
    state: &mut HandshakeState,
) -> std::result::Result<(), HandshakeFailure> {
    if state.sent_public_key {
        return Ok(());
    }
    let blob = state
        .keypair
        .public_key_blob()
        .map_err(|err| HandshakeFailure::KeyGeneration(err.to_string()))?;
    let mut attrs = Attributes::new();
    attrs
        .insert(ATTR_PUBLIC_KEY, blob)
        .map_err(|err| HandshakeFailure::Format(err.to_string()))?;
    channel
        .send(HANDSHAKE_PUBLIC_KEY_TYPE, &attrs)
        .map_err(to_channel_failure)?;
    state.sent_public_key = true;
    debug!("sent handshake public key");
    Ok(())
}

fn on_public_key(
    channel: &MessageChannel,
    state: &mut HandshakeState,
    attrs: &Attributes,
) -> std::result::Result<(), HandshakeFailure> {
    if state.outbound_complete {
        return Err(HandshakeFailure::Format(
            "peer sent a second public key".into(),
        ));
    }
    let blob = match attrs.get(ATTR_PUBLIC_KEY) {
        Some(blob) if attrs.len() == 1 => blob,
        _ => {
            return Err(HandshakeFailure::Format(format!(
                "public key message must carry exactly one {ATTR_PUBLIC_KEY:?} attribute"
            )));
        }
    };
    let peer = PeerPublicKey::from_blob(blob)
        .map_err(|err| HandshakeFailure::Format(err.to_string()))?;

    // Answering before we have offered our own key would leave the peer's
    // inbound side dangling; offer first.
    send_public_key(channel, state)?;

    let wrapped_iv = peer
        .wrap_blob(state.outbound_material.iv())
        .map_err(|err| HandshakeFailure::Format(err.to_string()))?;
    let wrapped_key = peer
        .wrap_blob(state.outbound_material.key())
        .map_err(|err| HandshakeFailure::Format(err.to_string()))?;

    let mut reply = Attributes::new();
    reply
        .insert(ATTR_WRAPPED_IV, wrapped_iv)
        .map_err(|err| HandshakeFailure::Format(err.to_string()))?;
    reply
        .insert(ATTR_WRAPPED_KEY, wrapped_key)
        .map_err(|err| HandshakeFailure::Format(err.to_string()))?;
    channel
        .send(HANDSHAKE_KEY_MATERIAL_TYPE, &reply)
        .map_err(to_channel_failure)?;

    state.outbound_complete = true;
    debug!("outbound handshake direction complete");
    Ok(())
}

fn on_key_material(
    state: &mut HandshakeState,
    attrs: &Attributes,
) -> std::result::Result<(), HandshakeFailure> {
    if state.inbound_material.is_some() {
        return Err(HandshakeFailure::Format(
            "peer sent key material twice".into(),
        ));
    }
    let (wrapped_iv, wrapped_key) = match (attrs.get(ATTR_WRAPPED_IV), attrs.get(ATTR_WRAPPED_KEY))
    {
        (Some(iv), Some(key)) if attrs.len() == 2 => (iv, key),
        _ => {
            return Err(HandshakeFailure::Format(format!(
                "key material message must carry exactly {ATTR_WRAPPED_IV:?} and {ATTR_WRAPPED_KEY:?}"
            )));
        }
    };

    let iv = state
        .keypair
        .unwrap_blob(wrapped_iv)
        .map_err(|err| HandshakeFailure::DecryptionFailed(err.to_string()))?;
    let key = state
        .keypair
        .unwrap_blob(wrapped_key)
        .map_err(|err| HandshakeFailure::DecryptionFailed(err.to_string()))?;

    state.inbound_material = Some(
        SymmetricMaterial::from_parts(&key, &iv)
            .map_err(|err| HandshakeFailure::DecryptionFailed(err.to_string()))?,
    );
    debug!("inbound handshake direction complete");
    Ok(())
}

fn to_channel_failure(err: TransportError) -> HandshakeFailure {
    match err {
        TransportError::NotConnected | TransportError::Disposed => {
            HandshakeFailure::ChannelDisconnected
        }
        other => HandshakeFailure::ChannelError(other.to_string()),
    }
}
