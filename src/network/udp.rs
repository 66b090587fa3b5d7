//! UDP socket construction
//!
//! Sockets are built through socket2 so the buffer sizes can be tuned
//! before handing them to tokio.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;

use crate::constants::SOCKET_BUFFER_SIZE;
use crate::error::NetworkError;

/// Build a UDP socket bound to `bind`, with enlarged kernel buffers and
/// non-blocking mode set for the async runtime.
pub fn create_socket(bind: SocketAddr) -> Result<std::net::UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(bind), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE);

    socket
        .bind(&bind.into())
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    Ok(socket.into())
}

/// Bind and wrap into a tokio socket.
pub fn bind_async(bind: SocketAddr) -> Result<tokio::net::UdpSocket, NetworkError> {
    tokio::net::UdpSocket::from_std(create_socket(bind)?)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))
}
