//! Streaming session: the connect/heartbeat/disconnect state machine
//!
//! One session owns one UDP socket and one peer. The receive loop is the
//! only writer of the connected/latency fields in steady state; the send
//! path only reads `connected` before transmitting. All timing bounds come
//! from the [`ProtocolConfig`] handed in at construction.

use bytes::Bytes;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{watch, Notify};
use tokio::time::timeout;

use crate::config::ProtocolConfig;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::NetworkError;
use crate::network::udp;
use crate::protocol::{PacketCodec, PacketType};

/// Connection state as observed by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Link {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

pub struct StreamSession {
    cfg: ProtocolConfig,
    codec: PacketCodec,
    link: Mutex<Option<Link>>,
    connected: AtomicBool,
    sequence: AtomicU32,
    last_send: Mutex<Option<Instant>>,
    last_response: Mutex<Option<Instant>>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    latency_tx: watch::Sender<Option<Duration>>,
    latency_rx: watch::Receiver<Option<Duration>>,
    /// Wakes the listen loop so disconnect never waits out a receive bound.
    shutdown: Notify,
}

impl StreamSession {
    pub fn new(cfg: ProtocolConfig) -> Self {
        let codec = PacketCodec::new(&cfg);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (latency_tx, latency_rx) = watch::channel(None);
        Self {
            cfg,
            codec,
            link: Mutex::new(None),
            connected: AtomicBool::new(false),
            sequence: AtomicU32::new(0),
            last_send: Mutex::new(None),
            last_response: Mutex::new(None),
            state_tx,
            state_rx,
            latency_tx,
            latency_rx,
            shutdown: Notify::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Connection-state signal for the host application.
    pub fn state_rx(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Best-effort round-trip estimate. Informational only; never gates
    /// audio delivery.
    pub fn latency_rx(&self) -> watch::Receiver<Option<Duration>> {
        self.latency_rx.clone()
    }

    pub fn latency(&self) -> Option<Duration> {
        *self.latency_rx.borrow()
    }

    /// Peer of the current link, if connected.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.link.lock().as_ref().map(|l| l.peer)
    }

    /// Open a transport to `addr:port` and perform the handshake: one
    /// keepalive out, one magic-matching datagram back within the handshake
    /// bound. Any prior session state is torn down first.
    pub async fn connect(&self, addr: IpAddr, port: u16) -> Result<(), NetworkError> {
        self.disconnect().await;

        let _ = self.state_tx.send(ConnectionState::Connecting);
        let peer = SocketAddr::new(addr, port);

        let result = self.handshake(peer).await;
        match result {
            Ok(socket) => {
                *self.last_response.lock() = Some(Instant::now());
                *self.link.lock() = Some(Link {
                    socket: Arc::new(socket),
                    peer,
                });
                self.connected.store(true, Ordering::SeqCst);
                let _ = self.state_tx.send(ConnectionState::Connected);
                tracing::info!(%peer, "connected");
                Ok(())
            }
            Err(e) => {
                self.reset_to_idle();
                tracing::warn!(%peer, "connect failed: {}", e);
                Err(e)
            }
        }
    }

    async fn handshake(&self, peer: SocketAddr) -> Result<UdpSocket, NetworkError> {
        let bind = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = udp::bind_async(bind)?;
        socket
            .connect(peer)
            .await
            .map_err(|e| NetworkError::PeerUnreachable(e.to_string()))?;

        self.sequence.store(0, Ordering::SeqCst);
        let seq = self.next_sequence();
        let packet = self.codec.encode(PacketType::Keepalive, seq, &[]);
        *self.last_send.lock() = Some(Instant::now());
        socket
            .send(&packet)
            .await
            .map_err(|e| NetworkError::PeerUnreachable(e.to_string()))?;

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        match timeout(self.cfg.handshake_timeout(), socket.recv(&mut buf)).await {
            Ok(Ok(n)) if self.codec.matches_magic(&buf[..n]) => Ok(socket),
            Ok(Ok(_)) => Err(NetworkError::PeerUnreachable(
                "malformed handshake response".into(),
            )),
            Ok(Err(e)) => Err(NetworkError::PeerUnreachable(e.to_string())),
            Err(_) => Err(NetworkError::PeerUnreachable("handshake timed out".into())),
        }
    }

    /// Transmit one audio frame. No-op when not connected. A transport-level
    /// failure flips the session to disconnected silently; the caller
    /// observes it through the connection-state signal, never as an error.
    pub async fn send_audio(&self, payload: Bytes) {
        self.send_packet(PacketType::Audio, payload).await;
    }

    /// Transmit an empty keepalive, driven by the orchestrator's timer.
    pub async fn send_keepalive(&self) {
        self.send_packet(PacketType::Keepalive, Bytes::new()).await;
    }

    async fn send_packet(&self, packet_type: PacketType, payload: Bytes) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        let socket = match self.link.lock().as_ref() {
            Some(link) => link.socket.clone(),
            None => return,
        };
        let seq = self.next_sequence();
        let packet = self.codec.encode(packet_type, seq, &payload);
        *self.last_send.lock() = Some(Instant::now());
        if let Err(e) = socket.send(&packet).await {
            tracing::warn!("send failed: {}", e);
            self.mark_disconnected();
        }
    }

    /// Receive loop; valid only while connected. Sole authority for the
    /// heartbeat timeout: nothing else flips `connected` for that reason.
    pub async fn listen_for_responses(&self) {
        let socket = match self.link.lock().as_ref() {
            Some(link) => link.socket.clone(),
            None => return,
        };
        let heartbeat = self.cfg.heartbeat_timeout();
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        while self.connected.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                received = timeout(heartbeat, socket.recv(&mut buf)) => match received {
                    Ok(Ok(n)) => {
                        if self.codec.matches_magic(&buf[..n]) {
                            *self.last_response.lock() = Some(Instant::now());
                            if let Some(sent) = *self.last_send.lock() {
                                let _ = self.latency_tx.send(Some(sent.elapsed()));
                            }
                        }
                        // Anything else is a stray datagram; dropped silently
                    }
                    Ok(Err(e)) => {
                        tracing::warn!("receive failed: {}", e);
                        self.mark_disconnected();
                        break;
                    }
                    Err(_) => {
                        let silent = self
                            .last_response
                            .lock()
                            .map(|t| t.elapsed())
                            .unwrap_or(heartbeat);
                        if silent >= heartbeat {
                            tracing::info!("heartbeat timeout after {:?} of silence", silent);
                            self.mark_disconnected();
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Leave the session. Best-effort disconnect packet when connected;
    /// always succeeds locally and always returns the session to idle.
    pub async fn disconnect(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            if self.connected.load(Ordering::SeqCst) {
                let seq = self.next_sequence();
                let packet = self.codec.encode(PacketType::Disconnect, seq, &[]);
                let _ = link.socket.send(&packet).await;
                tracing::info!(peer = %link.peer, "disconnected");
            }
            // Socket closes when the link drops
        }
        self.reset_to_idle();
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// One-shot transition out of `Connected`, used by the steady-state
    /// failure paths. Leaves the transport to `disconnect` so in-flight
    /// loops wind down at their next flag check.
    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.state_tx.send(ConnectionState::Disconnected);
            let _ = self.latency_tx.send(None);
            self.shutdown.notify_waiters();
        }
    }

    fn reset_to_idle(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.sequence.store(0, Ordering::SeqCst);
        *self.last_send.lock() = None;
        *self.last_response.lock() = None;
        *self.link.lock() = None;
        let _ = self.state_tx.send(ConnectionState::Disconnected);
        let _ = self.latency_tx.send(None);
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Packet;
    use parking_lot::Mutex as PlMutex;

    fn test_config() -> ProtocolConfig {
        ProtocolConfig {
            handshake_timeout_ms: 200,
            heartbeat_timeout_ms: 300,
            ..ProtocolConfig::default()
        }
    }

    /// A scripted peer endpoint: records every packet it sees and answers
    /// with an ack while `responsive` holds.
    struct Responder {
        addr: SocketAddr,
        seen: Arc<PlMutex<Vec<Packet>>>,
        responsive: Arc<AtomicBool>,
    }

    async fn spawn_responder(cfg: &ProtocolConfig) -> Responder {
        let socket = udp::bind_async("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let responsive = Arc::new(AtomicBool::new(true));
        let codec = PacketCodec::new(cfg);

        let seen_task = seen.clone();
        let responsive_task = responsive.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let mut ack_seq = 0u32;
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                if let Ok(packet) = codec.decode(&buf[..n]) {
                    seen_task.lock().push(packet);
                    if responsive_task.load(Ordering::SeqCst) {
                        let ack = codec.encode(PacketType::Ack, ack_seq, &[]);
                        ack_seq = ack_seq.wrapping_add(1);
                        let _ = socket.send_to(&ack, from).await;
                    }
                }
            }
        });

        Responder {
            addr,
            seen,
            responsive,
        }
    }

    #[tokio::test]
    async fn connect_succeeds_against_live_peer() {
        let cfg = test_config();
        let responder = spawn_responder(&cfg).await;
        let session = StreamSession::new(cfg);

        session
            .connect(responder.addr.ip(), responder.addr.port())
            .await
            .unwrap();
        assert!(session.is_connected());
        assert_eq!(session.state(), ConnectionState::Connected);
        assert_eq!(session.peer(), Some(responder.addr));

        // The handshake consumed sequence 0
        let seen = responder.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].packet_type, PacketType::Keepalive);
        assert_eq!(seen[0].sequence, 0);
    }

    #[tokio::test]
    async fn connect_times_out_against_silent_peer() {
        let cfg = test_config();
        // Bound but never reads or replies
        let silent = udp::bind_async("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = silent.local_addr().unwrap();

        let session = StreamSession::new(cfg);
        let err = session.connect(addr.ip(), addr.port()).await.unwrap_err();
        assert!(matches!(err, NetworkError::PeerUnreachable(_)));
        assert!(!session.is_connected());
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(session.peer(), None);
        assert_eq!(session.sequence.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn connect_rejects_malformed_response() {
        let cfg = test_config();
        let socket = udp::bind_async("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64];
            if let Ok((_, from)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(b"XY-not-our-protocol", from).await;
            }
        });

        let session = StreamSession::new(cfg);
        let err = session.connect(addr.ip(), addr.port()).await.unwrap_err();
        assert!(matches!(err, NetworkError::PeerUnreachable(_)));
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn wire_scenario_sequences_and_disconnect() {
        let cfg = test_config();
        let responder = spawn_responder(&cfg).await;
        let session = StreamSession::new(cfg);
        session
            .connect(responder.addr.ip(), responder.addr.port())
            .await
            .unwrap();

        for _ in 0..10 {
            session.send_audio(Bytes::from(vec![0u8; 960])).await;
        }
        session.disconnect().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);

        // No-op after disconnect: nothing further reaches the wire
        session.send_audio(Bytes::from(vec![0u8; 960])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = responder.seen.lock();
        assert_eq!(seen.len(), 12);
        assert_eq!(seen[0].packet_type, PacketType::Keepalive);
        for (i, packet) in seen[1..11].iter().enumerate() {
            assert_eq!(packet.packet_type, PacketType::Audio);
            assert_eq!(packet.sequence, i as u32 + 1);
            assert_eq!(packet.payload.len(), 960);
        }
        assert_eq!(seen[11].packet_type, PacketType::Disconnect);
        assert_eq!(seen[11].sequence, 11);
    }

    #[tokio::test]
    async fn keepalives_share_the_sequence_space() {
        let cfg = test_config();
        let responder = spawn_responder(&cfg).await;
        let session = StreamSession::new(cfg);
        session
            .connect(responder.addr.ip(), responder.addr.port())
            .await
            .unwrap();

        session.send_audio(Bytes::from(vec![0u8; 4])).await;
        session.send_keepalive().await;
        session.send_audio(Bytes::from(vec![0u8; 4])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = responder.seen.lock();
        let sequences: Vec<u32> = seen.iter().map(|p| p.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert_eq!(seen[2].packet_type, PacketType::Keepalive);
    }

    #[tokio::test]
    async fn listen_turns_acks_into_latency_samples() {
        let cfg = test_config();
        let responder = spawn_responder(&cfg).await;
        let session = Arc::new(StreamSession::new(cfg));
        session
            .connect(responder.addr.ip(), responder.addr.port())
            .await
            .unwrap();

        let listener = {
            let session = session.clone();
            tokio::spawn(async move { session.listen_for_responses().await })
        };

        // Keepalive draws an ack back; the loop turns it into a latency sample
        session.send_keepalive().await;
        let mut latency_rx = session.latency_rx();
        tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                latency_rx.changed().await.unwrap();
                if latency_rx.borrow().is_some() {
                    break;
                }
            }
        })
        .await
        .expect("no latency sample");

        session.disconnect().await;
        let _ = tokio::time::timeout(Duration::from_secs(1), listener).await;
    }

    #[tokio::test]
    async fn heartbeat_silence_disconnects_exactly_once() {
        let cfg = test_config();
        let responder = spawn_responder(&cfg).await;
        let session = Arc::new(StreamSession::new(cfg));
        session
            .connect(responder.addr.ip(), responder.addr.port())
            .await
            .unwrap();

        // Peer goes dark after the handshake
        responder.responsive.store(false, Ordering::SeqCst);

        let mut state_rx = session.state_rx();
        let listener = {
            let session = session.clone();
            tokio::spawn(async move { session.listen_for_responses().await })
        };

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                state_rx.changed().await.unwrap();
                if *state_rx.borrow() == ConnectionState::Disconnected {
                    break;
                }
            }
        })
        .await
        .expect("never transitioned to disconnected");

        // The loop is the sole timeout authority and must have exited
        tokio::time::timeout(Duration::from_secs(1), listener)
            .await
            .expect("listen loop did not terminate")
            .unwrap();
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn sequence_wraps_without_error() {
        let cfg = test_config();
        let responder = spawn_responder(&cfg).await;
        let session = StreamSession::new(cfg);
        session
            .connect(responder.addr.ip(), responder.addr.port())
            .await
            .unwrap();

        session.sequence.store(u32::MAX, Ordering::SeqCst);
        session.send_audio(Bytes::from(vec![0u8; 4])).await;
        session.send_audio(Bytes::from(vec![0u8; 4])).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = responder.seen.lock();
        let tail: Vec<u32> = seen[seen.len() - 2..].iter().map(|p| p.sequence).collect();
        assert_eq!(tail, vec![u32::MAX, 0]);
        assert!(session.is_connected());
    }

    #[tokio::test]
    async fn connect_is_reentrant() {
        let cfg = test_config();
        let first = spawn_responder(&cfg).await;
        let second = spawn_responder(&cfg).await;
        let session = StreamSession::new(cfg);

        session
            .connect(first.addr.ip(), first.addr.port())
            .await
            .unwrap();
        session
            .connect(second.addr.ip(), second.addr.port())
            .await
            .unwrap();

        assert_eq!(session.peer(), Some(second.addr));
        // Sequence space restarted with the new handshake
        assert_eq!(second.seen.lock()[0].sequence, 0);
    }
}
