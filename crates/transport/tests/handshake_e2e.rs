//! Handshake and secure-channel end-to-end tests
//!
//! RSA keypairs in these tests use a small modulus to keep key generation
//! fast; the exchange and wrapping paths are identical to the default
//! parameters.

use bytes::Bytes;
use graywire_protocol::crypto::SymmetricMaterial;
use graywire_protocol::types::{
    ATTR_ENVELOPE, HANDSHAKE_PUBLIC_KEY_TYPE, SECURE_ENVELOPE_TYPE, UNKNOWN_CONTEXT,
};
use graywire_protocol::{Attributes, Frame};
use graywire_transport::{
    ChannelEvent, HandshakeConfig, HandshakeEvent, HandshakeFailure, Handshaker, MessageChannel,
    SecureChannel, SecureErrorKind, SecureEvent,
};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const TEST_RSA_BITS: usize = 1024;

type ChannelSide = (MessageChannel, UnboundedReceiver<ChannelEvent>);

fn channel_pair() -> (ChannelSide, ChannelSide) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        MessageChannel::from_stream(a, None),
        MessageChannel::from_stream(b, None),
    )
}

fn test_config() -> HandshakeConfig {
    HandshakeConfig {
        rsa_key_bits: TEST_RSA_BITS,
    }
}

async fn completed(
    events: &mut UnboundedReceiver<HandshakeEvent>,
) -> (SecureChannel, UnboundedReceiver<SecureEvent>) {
    match timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for handshake")
        .expect("handshake event stream closed")
    {
        HandshakeEvent::Completed { channel, events } => (channel, events),
        HandshakeEvent::Errored { reason } => panic!("handshake failed: {reason}"),
    }
}

async fn next_secure(events: &mut UnboundedReceiver<SecureEvent>) -> SecureEvent {
    timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for secure event")
        .expect("secure event stream closed")
}

#[tokio::test]
async fn test_handshake_single_initiator_completes_both_sides() {
    let ((a, a_events), (b, b_events)) = channel_pair();
    let (a_hs, mut a_hs_events) = Handshaker::with_config(a, a_events, test_config());
    let (b_hs, mut b_hs_events) = Handshaker::with_config(b, b_events, test_config());

    // Only one side initiates; the responder offers its own key on receipt.
    a_hs.initiate().unwrap();

    let (a_secure, mut a_secure_events) = completed(&mut a_hs_events).await;
    let (b_secure, mut b_secure_events) = completed(&mut b_hs_events).await;
    a_hs.dispose().await;
    b_hs.dispose().await;

    // Crosswise key agreement: traffic decrypts in both directions.
    let mut attrs = Attributes::new();
    attrs.insert("hello", &b"world"[..]).unwrap();
    a_secure.send(&attrs).unwrap();
    match next_secure(&mut b_secure_events).await {
        SecureEvent::MessageReceived {
            attrs: received, ..
        } => {
            assert_eq!(received.get("hello").unwrap().as_ref(), b"world");
            assert_eq!(received.len(), 1);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let mut reply = Attributes::new();
    reply.insert("status", &b"ok"[..]).unwrap();
    b_secure.send(&reply).unwrap();
    match next_secure(&mut a_secure_events).await {
        SecureEvent::MessageReceived {
            attrs: received, ..
        } => assert_eq!(received.get("status").unwrap().as_ref(), b"ok"),
        other => panic!("unexpected event: {other:?}"),
    }

    a_secure.dispose().await;
    b_secure.dispose().await;
}

#[tokio::test]
async fn test_secure_wire_is_ciphertext() {
    // Secure side built directly from key material; the peer stays a plain
    // channel so the test can inspect what actually crosses the wire.
    let ((a, a_events), (_b, mut b_events)) = channel_pair();
    let outbound = SymmetricMaterial::generate();
    let inbound = SymmetricMaterial::generate();
    let (a_secure, _a_secure_events) = SecureChannel::new(a, a_events, &outbound, &inbound);

    let mut attrs = Attributes::new();
    attrs.insert("hello", &b"world"[..]).unwrap();
    let context = a_secure.send(&attrs).unwrap();
    assert_eq!(context, 1);

    match timeout(Duration::from_secs(5), b_events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        ChannelEvent::MessageReceived {
            context,
            type_code,
            attrs: outer,
            ..
        } => {
            assert_eq!(context, 1);
            assert_eq!(type_code, SECURE_ENVELOPE_TYPE);
            assert_eq!(outer.len(), 1);
            let envelope = outer.get(ATTR_ENVELOPE).expect("envelope attribute");
            assert!(
                !envelope.windows(5).any(|w| w == b"world"),
                "plaintext leaked into the envelope"
            );
        }
        other => panic!("unexpected event: {other:?}"),
    }

    a_secure.dispose().await;
}

#[tokio::test]
async fn test_secure_roundtrip_without_handshake() {
    let ((a, a_events), (b, b_events)) = channel_pair();
    let forward = SymmetricMaterial::generate();
    let backward = SymmetricMaterial::generate();
    let (a_secure, _a_events) = SecureChannel::new(a, a_events, &forward, &backward);
    let (b_secure, mut b_secure_events) = SecureChannel::new(b, b_events, &backward, &forward);

    let mut attrs = Attributes::new();
    attrs.insert("k1", &[0xde, 0xad][..]).unwrap();
    attrs.insert("k2", Bytes::new()).unwrap();
    a_secure.send(&attrs).unwrap();

    match next_secure(&mut b_secure_events).await {
        SecureEvent::MessageReceived {
            attrs: received, ..
        } => assert_eq!(received, attrs),
        other => panic!("unexpected event: {other:?}"),
    }

    a_secure.dispose().await;
    b_secure.dispose().await;
}

#[tokio::test]
async fn test_secure_channel_rejects_malformed_envelopes() {
    let (mut raw, peer) = tokio::io::duplex(64 * 1024);
    let forward = SymmetricMaterial::generate();
    let backward = SymmetricMaterial::generate();
    let (b, b_events) = MessageChannel::from_stream(peer, None);
    let (b_secure, mut b_secure_events) = SecureChannel::new(b, b_events, &backward, &forward);

    // Wrong attribute set.
    let mut wrong = Attributes::new();
    wrong.insert("X", &b"junk"[..]).unwrap();
    let frame = Frame {
        context: 1,
        response_context: UNKNOWN_CONTEXT,
        type_code: SECURE_ENVELOPE_TYPE,
        attrs: wrong,
    }
    .encode()
    .unwrap();
    raw.write_all(&frame).await.unwrap();
    match next_secure(&mut b_secure_events).await {
        SecureEvent::Errored { kind, context, .. } => {
            assert_eq!(kind, SecureErrorKind::Format);
            assert_eq!(context, Some(1));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    // Garbage ciphertext.
    let mut garbage = Attributes::new();
    garbage.insert(ATTR_ENVELOPE, &[0u8; 13][..]).unwrap();
    let frame = Frame {
        context: 2,
        response_context: UNKNOWN_CONTEXT,
        type_code: SECURE_ENVELOPE_TYPE,
        attrs: garbage,
    }
    .encode()
    .unwrap();
    raw.write_all(&frame).await.unwrap();
    match next_secure(&mut b_secure_events).await {
        SecureEvent::Errored { kind, .. } => assert_eq!(kind, SecureErrorKind::Cryptography),
        other => panic!("unexpected event: {other:?}"),
    }

    // A well-formed envelope still decrypts afterwards.
    let cipher = graywire_protocol::crypto::CbcCipher::new(&forward);
    let mut inner = Attributes::new();
    inner.insert("still", &b"alive"[..]).unwrap();
    let mut envelope = Attributes::new();
    envelope
        .insert(ATTR_ENVELOPE, cipher.encrypt(&inner.encode().unwrap()))
        .unwrap();
    let frame = Frame {
        context: 3,
        response_context: UNKNOWN_CONTEXT,
        type_code: SECURE_ENVELOPE_TYPE,
        attrs: envelope,
    }
    .encode()
    .unwrap();
    raw.write_all(&frame).await.unwrap();
    match next_secure(&mut b_secure_events).await {
        SecureEvent::MessageReceived {
            context,
            attrs: received,
        } => {
            assert_eq!(context, 3);
            assert_eq!(received, inner);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    b_secure.dispose().await;
}

#[tokio::test]
async fn test_handshake_rejects_wrong_attribute_set() {
    let (mut raw, peer) = tokio::io::duplex(64 * 1024);
    let (b, b_events) = MessageChannel::from_stream(peer, None);
    let (b_hs, mut b_hs_events) = Handshaker::with_config(b, b_events, test_config());

    let mut wrong = Attributes::new();
    wrong.insert("Q", &b"not a key"[..]).unwrap();
    let frame = Frame {
        context: 1,
        response_context: UNKNOWN_CONTEXT,
        type_code: HANDSHAKE_PUBLIC_KEY_TYPE,
        attrs: wrong,
    }
    .encode()
    .unwrap();
    raw.write_all(&frame).await.unwrap();

    match timeout(Duration::from_secs(60), b_hs_events.recv())
        .await
        .expect("timed out waiting for handshake error")
        .expect("handshake event stream closed")
    {
        HandshakeEvent::Errored { reason } => {
            assert!(matches!(reason, HandshakeFailure::Format(_)));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    b_hs.dispose().await;
}

#[tokio::test]
async fn test_handshake_errors_on_disconnect() {
    let ((a, _a_events), (b, b_events)) = channel_pair();
    let (b_hs, mut b_hs_events) = Handshaker::with_config(b, b_events, test_config());

    a.dispose().await;

    match timeout(Duration::from_secs(60), b_hs_events.recv())
        .await
        .expect("timed out waiting for handshake error")
        .expect("handshake event stream closed")
    {
        HandshakeEvent::Errored { reason } => {
            assert_eq!(reason, HandshakeFailure::ChannelDisconnected);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    b_hs.dispose().await;
}
