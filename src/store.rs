//! Local store boundary.
//!
//! The cache node only calls get/put on its local store; sizing and
//! eviction are owned by the store implementation. The default store wraps
//! Moka with a key+value byte weigher so the configured capacity is a byte
//! budget rather than an entry count.

use async_trait::async_trait;
use bytes::Bytes;
use moka::future::Cache;

/// Bounded local key-value store with byte-size accounting.
#[async_trait]
pub trait LocalStore: Send + Sync + 'static {
    /// Look up a key.
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Insert or update a key. Eviction is the store's concern.
    async fn put(&self, key: &str, value: Bytes);

    /// Number of entries currently held.
    fn entry_count(&self) -> u64;

    /// Total weighted size (bytes) currently held.
    fn weighted_size(&self) -> u64;
}

/// Default local store backed by Moka.
pub struct MokaStore {
    cache: Cache<String, Bytes>,
}

impl MokaStore {
    /// Create a store with a byte budget. Entries are weighed by key plus
    /// value length.
    pub fn new(max_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &String, value: &Bytes| {
                (key.len() + value.len()).min(u32::MAX as usize) as u32
            })
            .build();

        Self { cache }
    }
}

#[async_trait]
impl LocalStore for MokaStore {
    async fn get(&self, key: &str) -> Option<Bytes> {
        self.cache.get(key).await
    }

    async fn put(&self, key: &str, value: Bytes) {
        self.cache.insert(key.to_owned(), value).await;
    }

    fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    fn weighted_size(&self) -> u64 {
        self.cache.weighted_size()
    }
}
