//! Network subsystem: UDP transport, streaming session, orchestration

pub mod orchestrator;
pub mod receiver;
pub mod session;
pub mod udp;

pub use orchestrator::StreamOrchestrator;
pub use receiver::{AudioReceiver, ReceiverStats};
pub use session::{ConnectionState, StreamSession};
pub use udp::{bind_async, create_socket};
