//! Peer-to-peer distributed cache with consistent hashing and etcd-based
//! membership.
//!
//! Each node holds a shard of the cached key/value data, routes requests
//! for keys it does not own to the owning peer, and coordinates dynamic
//! membership through etcd:
//!
//! - **Hash ring** maps keys to owning peers with virtual nodes, so
//!   membership changes only remap a small fraction of keys.
//! - **Singleflight** collapses concurrent identical-key requests into one
//!   in-flight operation, preventing cache stampedes.
//! - **Registry** registers this node under a renewable lease and watches
//!   the service prefix so every node converges on the same peer set.
//! - **Groups** orchestrate a get: local store, then owning peer, then the
//!   backing source.
//!
//! # Example
//!
//! ```rust,no_run
//! use shoal::{CacheNode, FnLoader, Groups, MokaStore, NodeConfig};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> shoal::Result<()> {
//!     let config = NodeConfig::new("127.0.0.1:8001".parse().unwrap())
//!         .with_etcd_endpoints(vec!["http://127.0.0.1:2379".into()]);
//!
//!     let groups = Groups::new();
//!     groups.create(
//!         "scores",
//!         Arc::new(MokaStore::new(64 * 1024 * 1024)),
//!         Arc::new(FnLoader(|key: &str| -> shoal::Result<Bytes> {
//!             Err(shoal::Error::KeyNotFound(key.to_owned()))
//!         })),
//!     );
//!
//!     let (node, mut fatal_rx) = CacheNode::start(config, groups.clone()).await?;
//!
//!     // Serve until the registration lapses irrecoverably.
//!     if let Some(err) = fatal_rx.recv().await {
//!         eprintln!("registration lost: {err}");
//!     }
//!     node.shutdown().await
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  CacheNode                     │
//! │  ┌─────────┐  ┌───────────┐  ┌─────────────┐  │
//! │  │ Groups  │  │ RingPicker│  │  RpcServer  │  │
//! │  │ (get)   │──│ HashRing  │  │ (peer gets) │  │
//! │  └─────────┘  └───────────┘  └─────────────┘  │
//! │       │              ▲                         │
//! │  singleflight        │ peer-set snapshots      │
//! │       │        ┌───────────┐  ┌────────────┐  │
//! │       ▼        │ Discoverer│  │ Registrar  │  │
//! │  local store / │ (watch)   │  │ (lease)    │  │
//! │  source loader └───────────┘  └────────────┘  │
//! └───────────────────────│──────────────│────────┘
//!                         ▼              ▼
//!                        etcd (/service/addr -> addr)
//! ```

pub mod config;
pub mod error;
pub mod group;
pub mod metrics;
pub mod net;
pub mod node;
pub mod peers;
pub mod registry;
pub mod ring;
pub mod singleflight;
pub mod store;

pub use config::NodeConfig;
pub use error::{Error, NetworkError, RegistryError, Result};
pub use group::{FnLoader, Group, Groups, SourceLoader};
pub use metrics::{CacheMetrics, CacheStats, Counter, LabeledCounter};
pub use net::{PeerClient, RpcServer};
pub use node::{CacheNode, RingPicker};
pub use peers::{PeerGetter, PeerPicker};
pub use registry::{Discoverer, PeerRoster, Registrar};
pub use ring::{crc32_hash, HashFn, HashRing};
pub use singleflight::FlightGroup;
pub use store::{LocalStore, MokaStore};
