//! Error types shared by the framer, the header model and the proxy loop.

use std::net::SocketAddr;

/// Failure at one of the proxy's I/O or parsing boundaries.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Listening port taken by another process (usually a running instance).
    #[error("address {0} is already in use")]
    AddrInUse(SocketAddr),
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

impl ProxyError {
    /// Map a bind error, singling out `AddrInUse`.
    pub fn from_bind(addr: SocketAddr, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            ProxyError::AddrInUse(addr)
        } else {
            ProxyError::Io(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
