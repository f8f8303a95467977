//! Error types used across the tiaccoon agent.

use thiserror::Error;

/// Result type for tiaccoon operations.
pub type TiaccoonResult<T> = Result<T, TiaccoonError>;

#[derive(Debug, Error)]
pub enum TiaccoonError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("syscall failed: {0}")]
    Syscall(String),

    #[error("remote memory access failed: {0}")]
    Memory(String),

    #[error("socket registration failed: {0}")]
    Registration(String),

    #[error("access denied by policy")]
    PolicyDenied,

    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// Marker raised by the RDMA transport adapter: the destination should be
    /// reached through the in-container RDMA library instead of a host
    /// socket. `addrlen` is the length of the sockaddr written back into the
    /// container, surfaced to it as `TRY_RDMA_SENTINEL + addrlen`.
    #[error("destination prefers the RDMA control channel")]
    TryRdma { addrlen: u64 },

    #[error("internal error: {0}")]
    Internal(String),
}

/// Numeric marker combined with an address length in the notification
/// response value when a destination is to be reached over RDMA.
pub const TRY_RDMA_SENTINEL: u64 = 999;

impl TiaccoonError {
    /// Whether this error is the RDMA redirection marker.
    pub fn is_try_rdma(&self) -> bool {
        matches!(self, TiaccoonError::TryRdma { .. })
    }
}

impl From<std::io::Error> for TiaccoonError {
    fn from(err: std::io::Error) -> Self {
        TiaccoonError::Syscall(format!("I/O error: {}", err))
    }
}

impl From<nix::errno::Errno> for TiaccoonError {
    fn from(err: nix::errno::Errno) -> Self {
        TiaccoonError::Syscall(err.to_string())
    }
}

impl From<serde_json::Error> for TiaccoonError {
    fn from(err: serde_json::Error) -> Self {
        TiaccoonError::Parse(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_rdma_marker() {
        let err = TiaccoonError::TryRdma { addrlen: 16 };
        assert!(err.is_try_rdma());
        assert!(!TiaccoonError::PolicyDenied.is_try_rdma());
    }

    #[test]
    fn test_error_display() {
        let err = TiaccoonError::Parse("bad sockaddr".into());
        assert_eq!(err.to_string(), "parse error: bad sockaddr");
    }
}
