//! Receiving endpoint for the desktop host
//!
//! Listens on the well-known port, tracks the single active client, answers
//! keepalives with acks (which is what completes the sender's handshake),
//! throttles acks during audio, and accounts for sequence gaps as loss.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::ProtocolConfig;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::{NetworkError, Result};
use crate::network::udp;
use crate::protocol::{PacketCodec, PacketType};

/// How often the receive loop wakes to check its running flag and the
/// client timeout.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Counters mirrored to the host UI.
#[derive(Debug, Clone, Default)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub packets_lost: u64,
    pub connected: bool,
    pub client_addr: Option<SocketAddr>,
}

impl ReceiverStats {
    pub fn loss_rate(&self) -> f64 {
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            0.0
        } else {
            self.packets_lost as f64 / total as f64
        }
    }
}

pub struct AudioReceiver {
    cfg: ProtocolConfig,
    codec: PacketCodec,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<ReceiverStats>>,
    client_tx: Arc<watch::Sender<Option<SocketAddr>>>,
    client_rx: watch::Receiver<Option<SocketAddr>>,
    audio_tx: mpsc::Sender<Bytes>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AudioReceiver {
    /// Build a receiver plus the channel on which decoded audio payloads
    /// arrive, in capture order as far as the network preserved it.
    pub fn new(cfg: ProtocolConfig) -> (Self, mpsc::Receiver<Bytes>) {
        let codec = PacketCodec::new(&cfg);
        let (client_tx, client_rx) = watch::channel(None);
        let (audio_tx, audio_rx) = mpsc::channel(256);
        (
            Self {
                cfg,
                codec,
                running: Arc::new(AtomicBool::new(false)),
                stats: Arc::new(Mutex::new(ReceiverStats::default())),
                client_tx: Arc::new(client_tx),
                client_rx,
                audio_tx,
                task: Mutex::new(None),
            },
            audio_rx,
        )
    }

    /// Bind the configured port and start the receive loop. Returns the
    /// bound address. No-op (returning the configured port) when already
    /// running.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(SocketAddr::from(([0, 0, 0, 0], self.cfg.port)));
        }

        let bind = SocketAddr::from(([0, 0, 0, 0], self.cfg.port));
        let socket = match udp::bind_async(bind) {
            Ok(socket) => socket,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        let local = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        tracing::info!(%local, "receiver listening");

        let loop_state = ReceiveLoop {
            cfg: self.cfg.clone(),
            codec: self.codec.clone(),
            running: self.running.clone(),
            stats: self.stats.clone(),
            client_tx: self.client_tx.clone(),
            audio_tx: self.audio_tx.clone(),
        };
        let handle = tokio::spawn(async move { loop_state.run(socket).await });
        *self.task.lock() = Some(handle);
        Ok(local)
    }

    /// Stop the receive loop and close the socket.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats.lock().clone()
    }

    /// Active-client signal: `Some(addr)` while a sender is streaming.
    pub fn client_rx(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.client_rx.clone()
    }
}

struct ReceiveLoop {
    cfg: ProtocolConfig,
    codec: PacketCodec,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<ReceiverStats>>,
    client_tx: Arc<watch::Sender<Option<SocketAddr>>>,
    audio_tx: mpsc::Sender<Bytes>,
}

impl ReceiveLoop {
    async fn run(self, socket: UdpSocket) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut client: Option<SocketAddr> = None;
        let mut last_packet = Instant::now();
        let mut last_ack = Instant::now() - self.cfg.ack_throttle();
        let mut last_seq: Option<u32> = None;
        let mut ack_seq = 0u32;

        while self.running.load(Ordering::SeqCst) {
            match timeout(POLL_INTERVAL, socket.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    let packet = match self.codec.decode(&buf[..n]) {
                        Ok(packet) => packet,
                        // Not ours; dropped silently
                        Err(_) => continue,
                    };

                    if client != Some(from) {
                        tracing::info!(%from, "client connected");
                        client = Some(from);
                        last_seq = None;
                        let mut stats = self.stats.lock();
                        stats.packets_received = 0;
                        stats.packets_lost = 0;
                        stats.connected = true;
                        stats.client_addr = Some(from);
                        drop(stats);
                        let _ = self.client_tx.send(Some(from));
                    }
                    last_packet = Instant::now();

                    {
                        let mut stats = self.stats.lock();
                        stats.packets_received += 1;
                        if let Some(last) = last_seq {
                            let expected = last.wrapping_add(1);
                            if packet.sequence != expected {
                                let gap = packet.sequence.wrapping_sub(expected);
                                // Sanity bound: huge gaps mean a restarted
                                // sender, not loss
                                if gap < 1000 {
                                    stats.packets_lost += gap as u64;
                                }
                            }
                        }
                    }
                    last_seq = Some(packet.sequence);

                    match packet.packet_type {
                        PacketType::Audio => {
                            if !packet.payload.is_empty() {
                                let _ = self.audio_tx.try_send(packet.payload);
                            }
                            if last_ack.elapsed() >= self.cfg.ack_throttle() {
                                self.send_ack(&socket, from, &mut ack_seq).await;
                                last_ack = Instant::now();
                            }
                        }
                        PacketType::Keepalive => {
                            self.send_ack(&socket, from, &mut ack_seq).await;
                            last_ack = Instant::now();
                        }
                        PacketType::Disconnect => {
                            tracing::info!(%from, "client disconnected");
                            client = None;
                            last_seq = None;
                            let mut stats = self.stats.lock();
                            stats.connected = false;
                            stats.client_addr = None;
                            drop(stats);
                            let _ = self.client_tx.send(None);
                        }
                        PacketType::Ack => {}
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!("receive failed: {}", e);
                    break;
                }
                Err(_) => {
                    // Idle poll: expire a silent client
                    if client.is_some() && last_packet.elapsed() > self.cfg.heartbeat_timeout() {
                        tracing::info!("client timed out");
                        client = None;
                        last_seq = None;
                        let mut stats = self.stats.lock();
                        stats.connected = false;
                        stats.client_addr = None;
                        drop(stats);
                        let _ = self.client_tx.send(None);
                    }
                }
            }
        }
    }

    async fn send_ack(&self, socket: &UdpSocket, to: SocketAddr, ack_seq: &mut u32) {
        let ack = self.codec.encode(PacketType::Ack, *ack_seq, &[]);
        *ack_seq = ack_seq.wrapping_add(1);
        if let Err(e) = socket.send_to(&ack, to).await {
            tracing::debug!("ack send failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProtocolConfig {
        ProtocolConfig {
            port: 0,
            heartbeat_timeout_ms: 5000,
            ack_throttle_ms: 500,
            ..ProtocolConfig::default()
        }
    }

    async fn recv_packet(socket: &UdpSocket, codec: &PacketCodec) -> crate::protocol::Packet {
        let mut buf = vec![0u8; 1024];
        let (n, _) = timeout(Duration::from_secs(1), socket.recv_from(&mut buf))
            .await
            .expect("no datagram")
            .unwrap();
        codec.decode(&buf[..n]).unwrap()
    }

    #[tokio::test]
    async fn keepalive_is_answered_with_ack() {
        let cfg = test_config();
        let codec = PacketCodec::new(&cfg);
        let (receiver, _audio_rx) = AudioReceiver::new(cfg);
        let addr = receiver.start().await.unwrap();

        let client = udp::bind_async("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        client
            .send_to(&codec.encode(PacketType::Keepalive, 0, &[]), target)
            .await
            .unwrap();

        let ack = recv_packet(&client, &codec).await;
        assert_eq!(ack.packet_type, PacketType::Ack);

        let stats = receiver.stats();
        assert!(stats.connected);
        assert_eq!(stats.packets_received, 1);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn audio_is_forwarded_and_acks_throttled() {
        let cfg = test_config();
        let codec = PacketCodec::new(&cfg);
        let (receiver, mut audio_rx) = AudioReceiver::new(cfg);
        let addr = receiver.start().await.unwrap();

        let client = udp::bind_async("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));

        // Handshake ack resets the throttle window
        client
            .send_to(&codec.encode(PacketType::Keepalive, 0, &[]), target)
            .await
            .unwrap();
        let _ = recv_packet(&client, &codec).await;

        for seq in 1..=3u32 {
            let payload = vec![seq as u8; 960];
            client
                .send_to(&codec.encode(PacketType::Audio, seq, &payload), target)
                .await
                .unwrap();
        }

        for expected in 1..=3u8 {
            let payload = timeout(Duration::from_secs(1), audio_rx.recv())
                .await
                .expect("audio not forwarded")
                .unwrap();
            assert_eq!(payload.len(), 960);
            assert_eq!(payload[0], expected);
        }

        // All three audio packets landed inside the throttle window right
        // after the keepalive ack, so none of them drew another ack
        let mut buf = vec![0u8; 64];
        let extra = timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await;
        assert!(extra.is_err(), "ack was not throttled");
        receiver.stop().await;
    }

    #[tokio::test]
    async fn sequence_gaps_count_as_loss() {
        let cfg = test_config();
        let codec = PacketCodec::new(&cfg);
        let (receiver, _audio_rx) = AudioReceiver::new(cfg);
        let addr = receiver.start().await.unwrap();

        let client = udp::bind_async("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        for seq in [0u32, 1, 5] {
            client
                .send_to(&codec.encode(PacketType::Audio, seq, &[0; 4]), target)
                .await
                .unwrap();
            // Keep ordering deterministic on loopback
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = receiver.stats();
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_lost, 3);
        assert!((stats.loss_rate() - 0.5).abs() < 1e-9);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn disconnect_clears_client() {
        let cfg = test_config();
        let codec = PacketCodec::new(&cfg);
        let (receiver, _audio_rx) = AudioReceiver::new(cfg);
        let addr = receiver.start().await.unwrap();
        let mut client_rx = receiver.client_rx();

        let client = udp::bind_async("127.0.0.1:0".parse().unwrap()).unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));
        client
            .send_to(&codec.encode(PacketType::Keepalive, 0, &[]), target)
            .await
            .unwrap();

        timeout(Duration::from_secs(1), async {
            loop {
                client_rx.changed().await.unwrap();
                if client_rx.borrow().is_some() {
                    break;
                }
            }
        })
        .await
        .expect("client never registered");

        client
            .send_to(&codec.encode(PacketType::Disconnect, 1, &[]), target)
            .await
            .unwrap();

        timeout(Duration::from_secs(1), async {
            loop {
                client_rx.changed().await.unwrap();
                if client_rx.borrow().is_none() {
                    break;
                }
            }
        })
        .await
        .expect("client never cleared");
        assert!(!receiver.stats().connected);
        receiver.stop().await;
    }

    #[tokio::test]
    async fn new_source_address_replaces_client() {
        let cfg = test_config();
        let codec = PacketCodec::new(&cfg);
        let (receiver, _audio_rx) = AudioReceiver::new(cfg);
        let addr = receiver.start().await.unwrap();
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));

        let first = udp::bind_async("127.0.0.1:0".parse().unwrap()).unwrap();
        let second = udp::bind_async("127.0.0.1:0".parse().unwrap()).unwrap();

        for seq in 0..4u32 {
            first
                .send_to(&codec.encode(PacketType::Audio, seq, &[0; 4]), target)
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(receiver.stats().packets_received, 4);

        second
            .send_to(&codec.encode(PacketType::Keepalive, 0, &[]), target)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = receiver.stats();
        assert_eq!(stats.client_addr, Some(second.local_addr().unwrap()));
        // Counters restart with the new client
        assert_eq!(stats.packets_received, 1);
        receiver.stop().await;
    }
}
