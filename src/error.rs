//! Error types for the network microphone engine

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio capture errors
#[derive(Error, Debug)]
pub enum AudioError {
    /// Microphone access denied by the host platform. Checked before the
    /// device is acquired; fatal to starting a stream, never retried.
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Capture hardware missing or busy. Fatal to starting a stream.
    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Capture stream failed: {0}")]
    StreamFailed(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    /// Handshake timed out or the response was malformed. Surfaced as a
    /// connect failure; not retried automatically.
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Send/receive failure mid-session. Handled locally by transitioning
    /// to disconnected; never propagated to the audio-send caller.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed datagram. Dropped silently at runtime, never fatal.
    #[error("Invalid packet format")]
    InvalidPacket,
}

/// Service discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("mDNS daemon error: {0}")]
    Daemon(String),

    #[error("Resolve failed for {0}")]
    ResolveFailed(String),

    #[error("Resolve timed out for {0}")]
    ResolveTimeout(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
