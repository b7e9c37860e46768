//! Tunnel error taxonomy.
//!
//! The supervisor only needs one bit of information from a failed session:
//! whether trying again can possibly help. Everything else is logging.

use std::time::Duration;

use thiserror::Error;

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Errors produced while establishing or running a tunnel session.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration rejected before any connection attempt.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Enrolled key material could not be decoded or used.
    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    /// The endpoint presented a certificate whose public key does not match
    /// the pinned one. Retrying cannot succeed.
    #[error("endpoint certificate does not match the pinned public key")]
    PinMismatch,

    /// The endpoint refused the tunnel request with an authentication or
    /// authorization status.
    #[error("endpoint denied authentication (status {0})")]
    AuthDenied(http::StatusCode),

    /// The endpoint refused the tunnel request with a non-2xx status that
    /// does not indicate an authentication problem.
    #[error("endpoint rejected tunnel request (status {0})")]
    Rejected(http::StatusCode),

    /// The QUIC connection attempt could not even be started.
    #[error("connect failed: {0}")]
    Connect(#[from] quinn::ConnectError),

    /// The QUIC connection failed or was closed by the peer.
    #[error("transport failure: {0}")]
    Transport(#[from] quinn::ConnectionError),

    /// HTTP/3 layer failure on the request stream.
    #[error("http/3 failure: {0}")]
    Http(#[from] h3::Error),

    /// The QUIC datagram channel is unavailable on this connection.
    #[error("datagram channel unavailable: {0}")]
    Datagram(String),

    /// Establishment did not complete within the configured window.
    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// No datagrams were observed in either direction for the configured
    /// idle period.
    #[error("session idle for {0:?}")]
    IdleTimeout(Duration),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Whether the supervisor should give up instead of reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::Config(_)
                | TunnelError::KeyMaterial(_)
                | TunnelError::PinMismatch
                | TunnelError::AuthDenied(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_errors_do_not_retry() {
        assert!(TunnelError::PinMismatch.is_fatal());
        assert!(TunnelError::Config("bad".into()).is_fatal());
        assert!(TunnelError::KeyMaterial("bad".into()).is_fatal());
        assert!(TunnelError::AuthDenied(http::StatusCode::FORBIDDEN).is_fatal());
    }

    #[test]
    fn transient_errors_retry() {
        assert!(!TunnelError::IdleTimeout(Duration::from_secs(5)).is_fatal());
        assert!(!TunnelError::Rejected(http::StatusCode::SERVICE_UNAVAILABLE).is_fatal());
        assert!(!TunnelError::HandshakeTimeout(Duration::from_secs(10)).is_fatal());
        assert!(!TunnelError::Datagram("disabled by peer".into()).is_fatal());
        assert!(
            !TunnelError::Io(std::io::Error::new(std::io::ErrorKind::Other, "net down"))
                .is_fatal()
        );
    }
}
