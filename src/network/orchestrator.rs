//! Stream orchestration
//!
//! Wires capture → session → discovery together and runs the concurrent
//! loops: the session's receive loop, the keepalive timer, the
//! connection-state watchdog and the capture-to-send pump. The host
//! application sees a two-operation surface, `start_streaming` /
//! `stop_streaming`, both idempotent and safe from lifecycle callbacks.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use parking_lot::Mutex;

use crate::audio::buffer::SharedRingBuffer;
use crate::audio::pipeline::AudioCapturePipeline;
use crate::audio::source::SampleSource;
use crate::config::ProtocolConfig;
use crate::discovery::{PeerDiscovery, PeerList};
use crate::error::Result;
use crate::network::session::{ConnectionState, StreamSession};

/// Builds a fresh sample source for each streaming run.
pub type SourceFactory = Box<dyn Fn() -> Box<dyn SampleSource> + Send + Sync>;

/// How long the send pump idles when the capture buffer is empty.
const PUMP_IDLE: Duration = Duration::from_micros(500);

pub struct StreamOrchestrator {
    cfg: ProtocolConfig,
    session: Arc<StreamSession>,
    pipeline: Arc<AudioCapturePipeline>,
    frames: SharedRingBuffer,
    discovery: Arc<PeerDiscovery>,
    make_source: SourceFactory,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamOrchestrator {
    pub fn new(
        cfg: ProtocolConfig,
        pipeline: Arc<AudioCapturePipeline>,
        frames: SharedRingBuffer,
        discovery: Arc<PeerDiscovery>,
        make_source: SourceFactory,
    ) -> Self {
        let session = Arc::new(StreamSession::new(cfg.clone()));
        Self {
            cfg,
            session,
            pipeline,
            frames,
            discovery,
            make_source,
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connect to `addr:port`, start capture and spawn the streaming loops.
    /// No-op when already streaming.
    pub async fn start_streaming(&self, addr: IpAddr, port: u16) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.frames.drain();

        if let Err(e) = self.session.connect(addr, port).await {
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        if let Err(e) = self.pipeline.start((self.make_source)()) {
            self.session.disconnect().await;
            self.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let mut tasks = self.tasks.lock();

        // Receive loop: heartbeat-timeout authority and latency sampling
        let listen = {
            let session = self.session.clone();
            tokio::spawn(async move { session.listen_for_responses().await })
        };
        tasks.push(listen);

        // Keepalive timer: keeps the link warm and produces latency samples
        let keepalive = {
            let session = self.session.clone();
            let running = self.running.clone();
            let period = self.cfg.keepalive_interval();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await; // first tick fires immediately
                loop {
                    ticker.tick().await;
                    if !running.load(Ordering::SeqCst) || !session.is_connected() {
                        break;
                    }
                    session.send_keepalive().await;
                }
            })
        };
        tasks.push(keepalive);

        // Capture-to-send pump
        let pump = {
            let session = self.session.clone();
            let running = self.running.clone();
            let frames = self.frames.clone();
            tokio::spawn(async move {
                while running.load(Ordering::SeqCst) && session.is_connected() {
                    match frames.try_pop() {
                        Some(frame) => session.send_audio(frame.into_payload()).await,
                        None => tokio::time::sleep(PUMP_IDLE).await,
                    }
                }
            })
        };
        tasks.push(pump);

        // Watchdog: a self-detected disconnect tears everything down once
        let watchdog = {
            let session = self.session.clone();
            let pipeline = self.pipeline.clone();
            let running = self.running.clone();
            let mut state_rx = self.session.state_rx();
            tokio::spawn(async move {
                loop {
                    if state_rx.changed().await.is_err() {
                        break;
                    }
                    if *state_rx.borrow() != ConnectionState::Disconnected {
                        continue;
                    }
                    if running.swap(false, Ordering::SeqCst) {
                        tracing::info!("connection lost, stopping stream");
                        pipeline.stop();
                        session.disconnect().await;
                    }
                    break;
                }
            })
        };
        tasks.push(watchdog);

        tracing::info!(%addr, port, "streaming started");
        Ok(())
    }

    /// Stop streaming: stop capture, leave the session, wind down every
    /// loop. Idempotent; also reaps loops after a watchdog-driven teardown.
    pub async fn stop_streaming(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.pipeline.stop();
            self.session.disconnect().await;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ---- host-facing observables -------------------------------------

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn state_rx(&self) -> watch::Receiver<ConnectionState> {
        self.session.state_rx()
    }

    pub fn latency_rx(&self) -> watch::Receiver<Option<Duration>> {
        self.session.latency_rx()
    }

    pub fn loudness_rx(&self) -> watch::Receiver<f32> {
        self.pipeline.loudness_rx()
    }

    pub fn set_volume(&self, volume: f32) {
        self.pipeline.set_volume(volume);
    }

    pub fn set_muted(&self, muted: bool) {
        self.pipeline.set_muted(muted);
    }

    pub fn peers_rx(&self) -> watch::Receiver<PeerList> {
        self.discovery.peers_rx()
    }

    pub async fn start_discovery(&self) -> Result<()> {
        self.discovery.start().await
    }

    pub fn stop_discovery(&self) {
        self.discovery.stop();
    }
}
