//! Peer transport contract.
//!
//! Two small interfaces decouple the coordinator from the concrete
//! transport: a picker that resolves key ownership, and a getter that
//! fetches a key from one remote peer.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Locates the remote peer that owns a key.
pub trait PeerPicker: Send + Sync + 'static {
    /// Resolve the owner of `key`.
    ///
    /// Returns `None` when this node owns the key itself or when no peers
    /// are known, in which case the coordinator takes the local path.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}

/// Fetches a key's value from one specific remote peer.
#[async_trait]
pub trait PeerGetter: Send + Sync + 'static {
    /// Fetch `key` from the peer within the named group.
    async fn get(&self, group: &str, key: &str) -> Result<Bytes>;

    /// The peer's advertised address, for logging and metrics labels.
    fn addr(&self) -> &str;
}
