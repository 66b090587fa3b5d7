//! # netmic
//!
//! Low-latency network microphone streaming over LAN: a capture device on
//! one machine becomes a live microphone on another, over plain UDP on a
//! trusted local network.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────── SENDER ────────────────────────┐
//! │  ┌────────────┐    ┌───────────────────────────┐       │
//! │  │ Microphone │───▶│   AudioCapturePipeline    │       │
//! │  └────────────┘    │  volume / mute / loudness │       │
//! │                    └─────────────┬─────────────┘       │
//! │                                  ▼ ring buffer         │
//! │  ┌──────────────┐    ┌───────────────────────────┐     │
//! │  │PeerDiscovery │───▶│    StreamOrchestrator     │     │
//! │  │ (mDNS browse)│    │ pump · keepalive · listen │     │
//! │  └──────────────┘    └─────────────┬─────────────┘     │
//! │                                    ▼                   │
//! │                     ┌───────────────────────────┐      │
//! │                     │       StreamSession       │      │
//! │                     │ handshake · heartbeat ·   │      │
//! │                     │ sequence numbers · RTT    │      │
//! │                     └─────────────┬─────────────┘      │
//! └───────────────────────────────────┼────────────────────┘
//!                        UDP [WM|ver|type|seq|PCM]
//! ┌───────────────────────────────────┼────────────────────┐
//! │  ┌──────────────┐   ┌─────────────▼─────────────┐      │
//! │  │MdnsAdvertiser│   │       AudioReceiver       │      │
//! │  │ (register)   │   │ acks · loss stats · audio │      │
//! │  └──────────────┘   └───────────────────────────┘      │
//! └──────────────────────── RECEIVER ──────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod discovery;
pub mod error;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (the wire format carries mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default capture chunk length in milliseconds
    pub const DEFAULT_CHUNK_MS: u32 = 10;

    /// Lock-free ring buffer capacity (in frames)
    pub const RING_BUFFER_CAPACITY: usize = 256;

    /// Largest datagram either endpoint will read
    pub const MAX_DATAGRAM_SIZE: usize = 65536;

    /// Kernel send/receive buffer size requested for UDP sockets
    pub const SOCKET_BUFFER_SIZE: usize = 65536;
}
