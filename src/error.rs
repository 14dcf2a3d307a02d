//! Error types for the cache node.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type alias for cache node operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the cache node.
#[derive(Error, Debug)]
pub enum Error {
    /// The backing source has no value for the key. This is authoritative
    /// and is never masked by fallback paths.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A remote peer could not be reached or returned a transport-level
    /// failure. Absorbed one layer up by falling back to a local load.
    #[error("peer unavailable: {0}")]
    PeerUnavailable(#[from] NetworkError),

    /// Coordination service (registration/discovery) errors.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// An outcome shared between concurrent callers collapsed into one
    /// in-flight call. Every waiter observes the identical underlying error.
    #[error("{0}")]
    Shared(Arc<Error>),
}

impl Error {
    /// Whether this error (or the shared error it wraps) is an authoritative
    /// "key not found" from the backing source.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::KeyNotFound(_) => true,
            Error::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// Whether this error originated at the peer transport.
    pub fn is_peer_unavailable(&self) -> bool {
        match self {
            Error::PeerUnavailable(_) => true,
            Error::Shared(inner) => inner.is_peer_unavailable(),
            _ => false,
        }
    }
}

/// Peer transport errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed mid-exchange.
    #[error("connection closed")]
    ConnectionClosed,

    /// The request did not complete within the RPC timeout.
    #[error("request to {0} timed out")]
    Timeout(String),

    /// Incoming frame exceeded the message size cap.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The remote peer answered with an application-level error.
    #[error("remote error: {0}")]
    Remote(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Coordination service errors.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// A registration or discovery call to the coordination service failed.
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),

    /// The lease was lost and the single re-registration attempt failed.
    /// The node's advertisement has lapsed; the owning process must decide
    /// whether to recover or shut down.
    #[error("lease lost and re-registration failed: {0}")]
    ReregistrationFailed(String),

    /// A bounded coordination service call timed out.
    #[error("coordination service call timed out")]
    Timeout,
}

impl From<etcd_client::Error> for Error {
    fn from(e: etcd_client::Error) -> Self {
        Error::Registry(RegistryError::Unavailable(e.to_string()))
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::PeerUnavailable(NetworkError::Serialization(e.to_string()))
    }
}
