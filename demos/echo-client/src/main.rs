//! Secure echo client demo: dial, handshake, send stdin lines, print echoes.

use graywire_protocol::Attributes;
use graywire_transport::{HandshakeEvent, Handshaker, MessageChannel, SecureEvent};
use std::io::{self, BufRead, Write};
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
    let server =
        std::env::var("GRAYWIRE_SERVER").unwrap_or_else(|_| "127.0.0.1:4747".to_string());

    info!(%server, "dialing");
    let (channel, events) = MessageChannel::connect(&server).await?;
    let (handshaker, mut handshake_events) = Handshaker::new(channel, events);
    handshaker.initiate()?;

    let (secure, mut secure_events) = match handshake_events.recv().await {
        Some(HandshakeEvent::Completed { channel, events }) => (channel, events),
        Some(HandshakeEvent::Errored { reason }) => anyhow::bail!("handshake failed: {reason}"),
        None => anyhow::bail!("handshaker went away"),
    };
    handshaker.dispose().await;
    info!("secure channel established");

    // Printer task for echoed bundles.
    tokio::spawn(async move {
        while let Some(event) = secure_events.recv().await {
            match event {
                SecureEvent::MessageReceived { attrs, .. } => {
                    if let Some(body) = attrs.get("body") {
                        println!("\n[echo] {}", String::from_utf8_lossy(body));
                        print!(" > ");
                        let _ = io::stdout().flush();
                    }
                }
                SecureEvent::Errored { kind, detail, .. } => {
                    warn!(?kind, %detail, "secure channel error");
                }
                SecureEvent::Disconnected => {
                    info!("server disconnected");
                    break;
                }
            }
        }
    });

    info!("enter lines to echo (Ctrl+C to quit)");
    let stdin = io::stdin();
    loop {
        print!(" > ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line).is_err() || line.is_empty() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut attrs = Attributes::new();
        attrs.insert("body", line.as_bytes().to_vec())?;
        secure.send(&attrs)?;
    }

    secure.dispose().await;
    Ok(())
}
