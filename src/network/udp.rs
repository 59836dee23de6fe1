//! UDP socket construction
//!
//! Sockets are built with socket2 so buffer sizes and address reuse can be
//! set before binding, then handed to tokio.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;

use crate::config::NetworkConfig;
use crate::error::NetworkError;

pub use tokio::net::UdpSocket;

/// Resolve the configured bind address
pub fn bind_addr(config: &NetworkConfig) -> Result<SocketAddr, NetworkError> {
    let addr = config.bind_addr();
    addr.parse()
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))
}

/// Create a non-blocking UDP socket bound to `addr`. Must be called from
/// within a tokio runtime.
pub fn create_socket(addr: SocketAddr, config: &NetworkConfig) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    // The OS may cap these; a smaller buffer is not fatal
    if let Err(e) = socket.set_recv_buffer_size(config.recv_buffer_size) {
        tracing::warn!("Could not set receive buffer to {}: {}", config.recv_buffer_size, e);
    }
    if let Err(e) = socket.set_send_buffer_size(config.send_buffer_size) {
        tracing::warn!("Could not set send buffer to {}: {}", config.send_buffer_size, e);
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket =
        UdpSocket::from_std(std_socket).map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    tracing::debug!(
        "UDP socket bound to {}",
        socket
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.to_string())
    );
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_binds_ephemeral_port() {
        let config = NetworkConfig {
            bind_address: "127.0.0.1".into(),
            udp_port: 0,
            ..Default::default()
        };
        let addr = bind_addr(&config).unwrap();
        let socket = create_socket(addr, &config).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_bad_bind_address() {
        let config = NetworkConfig {
            bind_address: "not-an-ip".into(),
            ..Default::default()
        };
        assert!(matches!(bind_addr(&config), Err(NetworkError::BindFailed(_))));
    }
}
