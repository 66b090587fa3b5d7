//! Receiver Application
//!
//! Listens for a streaming sender on the well-known UDP port, advertises
//! itself over mDNS so senders can auto-discover this host, and reports
//! stream statistics. Received PCM is handed to stdout-side consumers via
//! the audio channel; wiring it into a playback or virtual-microphone
//! device is host-specific and left to the integration.

use anyhow::Result;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netmic::{
    config::AppConfig,
    discovery::MdnsAdvertiser,
    network::AudioReceiver,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting netmic receiver");

    let config = AppConfig::load_or_default()?;

    let instance = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "netmic host".to_string());

    let (receiver, mut audio_rx) = AudioReceiver::new(config.protocol.clone());
    let addr = receiver.start().await?;
    tracing::info!("listening on {}", addr);

    let advertiser = MdnsAdvertiser::start(&config.protocol, &instance)?;
    tracing::info!("advertising as {:?}", instance);

    // Drain the audio channel; byte count stands in for playback
    let drain = tokio::spawn(async move {
        let mut bytes_received: u64 = 0;
        while let Some(payload) = audio_rx.recv().await {
            bytes_received += payload.len() as u64;
            tracing::trace!(bytes = bytes_received, "audio");
        }
    });

    let mut client_rx = receiver.client_rx();
    let mut status_tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, shutting down");
                break;
            }
            changed = client_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                match *client_rx.borrow() {
                    Some(client) => tracing::info!("sender connected: {}", client),
                    None => tracing::info!("sender disconnected"),
                }
            }
            _ = status_tick.tick() => {
                let stats = receiver.stats();
                if stats.connected {
                    tracing::info!(
                        "{} packets, {} lost ({:.2}%)",
                        stats.packets_received,
                        stats.packets_lost,
                        stats.loss_rate() * 100.0
                    );
                }
            }
        }
    }

    advertiser.stop();
    receiver.stop().await;
    drain.abort();
    Ok(())
}
