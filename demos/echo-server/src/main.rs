//! Secure echo server demo: accept, handshake, echo every bundle back.

use graywire_transport::{
    ChannelListener, HandshakeEvent, Handshaker, ListenerConfig, ListenerEvent, SecureEvent,
};
use tracing::{info, warn};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let bind_addr =
        std::env::var("GRAYWIRE_BIND").unwrap_or_else(|_| "127.0.0.1:4747".to_string());

    let mut listener = ChannelListener::new(ListenerConfig { bind_addr });
    let mut connections = listener.start().await?;
    info!(addr = ?listener.local_addr(), "echo server listening");

    while let Some(ListenerEvent::Connected {
        channel,
        events,
        remote_addr,
    }) = connections.recv().await
    {
        tokio::spawn(async move {
            let (handshaker, mut handshake_events) = Handshaker::new(channel, events);
            if let Err(err) = handshaker.initiate() {
                warn!(%remote_addr, error = %err, "could not initiate handshake");
                return;
            }

            let (secure, mut secure_events) = match handshake_events.recv().await {
                Some(HandshakeEvent::Completed { channel, events }) => (channel, events),
                Some(HandshakeEvent::Errored { reason }) => {
                    warn!(%remote_addr, %reason, "handshake failed");
                    return;
                }
                None => return,
            };
            handshaker.dispose().await;
            info!(%remote_addr, "secure channel established");

            while let Some(event) = secure_events.recv().await {
                match event {
                    SecureEvent::MessageReceived { context, attrs } => {
                        info!(%remote_addr, context, attrs = attrs.len(), "echoing bundle");
                        if let Err(err) = secure.send(&attrs) {
                            warn!(%remote_addr, error = %err, "echo failed");
                            break;
                        }
                    }
                    SecureEvent::Errored { kind, detail, .. } => {
                        warn!(%remote_addr, ?kind, %detail, "secure channel error");
                    }
                    SecureEvent::Disconnected => {
                        info!(%remote_addr, "peer disconnected");
                        break;
                    }
                }
            }
            secure.dispose().await;
        });
    }

    Ok(())
}
