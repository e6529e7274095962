//! Server errors.

use std::net::SocketAddr;

/// Errors raised while bringing the server up.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The configured host/port could not be resolved to an address.
    #[error("invalid bind address {host}:{port}")]
    InvalidAddress {
        /// Configured host.
        host: String,
        /// Configured port.
        port: u16,
    },

    /// Binding the listener failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Address we tried to bind.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Any other listener I/O failure.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
}
