//! Sender Application
//!
//! Captures microphone audio and streams it to a receiving host over UDP.
//! With no argument, discovers hosts on the LAN via mDNS and connects to
//! the first one found.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use netmic::{
    audio::{buffer::create_shared_buffer, device::list_input_devices, AudioCapturePipeline, CpalSource},
    config::AppConfig,
    constants::RING_BUFFER_CAPACITY,
    discovery::{MdnsBrowser, PeerDiscovery},
    network::{ConnectionState, StreamOrchestrator},
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting netmic sender");

    let config = AppConfig::load_or_default()?;

    println!("\n=== Available Input Devices ===");
    for device in list_input_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}", device.name, default_marker);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let frames = create_shared_buffer(RING_BUFFER_CAPACITY);
    let pipeline = Arc::new(AudioCapturePipeline::new(
        config.audio.clone(),
        frames.clone(),
    ));

    let browser = Arc::new(MdnsBrowser::new(&config.protocol)?);
    let discovery = Arc::new(PeerDiscovery::new(
        browser,
        config.protocol.service_type.clone(),
    ));

    let audio_cfg = config.audio.clone();
    let orchestrator = StreamOrchestrator::new(
        config.protocol.clone(),
        pipeline.clone(),
        frames,
        discovery.clone(),
        Box::new(move || Box::new(CpalSource::new(audio_cfg.clone()))),
    );

    // Explicit target wins; otherwise take the first discovered host
    let target: SocketAddr = match std::env::args().nth(1) {
        Some(arg) => arg.parse().context("invalid target address")?,
        None => {
            tracing::info!("no target given, browsing for hosts...");
            orchestrator.start_discovery().await?;
            let mut peers_rx = orchestrator.peers_rx();
            let peer = tokio::time::timeout(Duration::from_secs(10), async {
                loop {
                    if let Some(peer) = peers_rx.borrow_and_update().first().cloned() {
                        return peer;
                    }
                    if peers_rx.changed().await.is_err() {
                        // Discovery ended without results; wait out the timeout
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                }
            })
            .await
            .context("no hosts discovered within 10s")?;
            tracing::info!(
                "discovered {} at {}:{}",
                peer.display_name,
                peer.host_addr,
                peer.port
            );
            SocketAddr::new(peer.host_addr, peer.port)
        }
    };

    orchestrator.start_streaming(target.ip(), target.port()).await?;
    tracing::info!("streaming to {}", target);

    let mut state_rx = orchestrator.state_rx();
    let mut latency_rx = orchestrator.latency_rx();
    let mut loudness_rx = orchestrator.loudness_rx();
    let mut status_tick = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, stopping");
                break;
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *state_rx.borrow();
                tracing::info!("connection state: {:?}", state);
                if state == ConnectionState::Disconnected {
                    break;
                }
            }
            _ = status_tick.tick() => {
                let latency = *latency_rx.borrow_and_update();
                let loudness = *loudness_rx.borrow_and_update();
                match latency {
                    Some(rtt) => tracing::info!(
                        "level {:>5.1}%  rtt {:>4} ms",
                        loudness * 100.0,
                        rtt.as_millis()
                    ),
                    None => tracing::info!("level {:>5.1}%", loudness * 100.0),
                }
            }
        }
    }

    orchestrator.stop_streaming().await;
    orchestrator.stop_discovery();
    Ok(())
}
