//! Cache coordinator: named groups tying together the local store, the
//! hash ring (via the peer picker), the call deduplicator, and the backing
//! source loader.
//!
//! A `Get` consults the local store first. On a miss, the whole
//! route-and-load decision runs as one deduplicated flight keyed by the
//! key: concurrent identical requests collapse into at most one outbound
//! RPC or one source load, even across a membership transition.

use crate::error::{Error, Result};
use crate::metrics::{CacheMetrics, CacheStats};
use crate::peers::{PeerGetter, PeerPicker};
use crate::singleflight::FlightGroup;
use crate::store::LocalStore;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

/// Supplies the authoritative value when a key is absent from every cache
/// tier.
#[async_trait]
pub trait SourceLoader: Send + Sync + 'static {
    async fn load(&self, key: &str) -> Result<Bytes>;
}

/// Adapter turning a plain function into a `SourceLoader`.
pub struct FnLoader<F>(pub F);

#[async_trait]
impl<F> SourceLoader for FnLoader<F>
where
    F: Fn(&str) -> Result<Bytes> + Send + Sync + 'static,
{
    async fn load(&self, key: &str) -> Result<Bytes> {
        (self.0)(key)
    }
}

/// A named cache group.
pub struct Group {
    name: String,
    store: Arc<dyn LocalStore>,
    loader: Arc<dyn SourceLoader>,
    picker: RwLock<Option<Arc<dyn PeerPicker>>>,
    flights: FlightGroup<Bytes>,
    metrics: CacheMetrics,
}

impl Group {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn LocalStore>,
        loader: Arc<dyn SourceLoader>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            loader,
            picker: RwLock::new(None),
            flights: FlightGroup::new(),
            metrics: CacheMetrics::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Attach the peer picker. Until one is attached every key takes the
    /// local path.
    pub fn register_picker(&self, picker: Arc<dyn PeerPicker>) {
        *self.picker.write() = Some(picker);
    }

    /// Get the value for `key`.
    ///
    /// Local store hit; otherwise remote fetch from the owning peer
    /// (falling back to a local load if the peer is unreachable); otherwise
    /// load from the backing source and populate the local store.
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        self.metrics.requests.inc();

        if let Some(value) = self.store.get(key).await {
            self.metrics.hits.inc();
            debug!(group = %self.name, key, "cache hit");
            return Ok(value);
        }
        self.metrics.misses.inc();

        self.load(key).await
    }

    /// Point-in-time statistics for this group.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            requests: self.metrics.requests.get(),
            hits: self.metrics.hits.get(),
            misses: self.metrics.misses.get(),
            loads: self.metrics.loads.get(),
            load_failures: self.metrics.load_failures.get(),
            dedup_suppressed: self.flights.suppressed(),
            entries: self.store.entry_count(),
            bytes: self.store.weighted_size(),
        }
    }

    /// Resolve a miss. Runs as a single flight per key so a thundering herd
    /// produces one execution regardless of where the value comes from.
    async fn load(&self, key: &str) -> Result<Bytes> {
        self.flights
            .run(key, || async {
                let picker = self.picker.read().clone();
                if let Some(picker) = picker {
                    if let Some(peer) = picker.pick_peer(key) {
                        match self.fetch_from_peer(peer.as_ref(), key).await {
                            Ok(value) => return Ok(value),
                            // The owner consulted the backing source: the
                            // key truly does not exist. Never masked.
                            Err(e) if e.is_not_found() => return Err(e),
                            Err(e) => {
                                warn!(
                                    group = %self.name,
                                    key,
                                    error = %e,
                                    "remote fetch failed, falling back to local load"
                                );
                            }
                        }
                    }
                }

                self.load_locally(key).await
            })
            .await
    }

    /// Fetch from the owning peer. The value is not written to the local
    /// store: this node is not authoritative for the key.
    async fn fetch_from_peer(&self, peer: &dyn PeerGetter, key: &str) -> Result<Bytes> {
        match peer.get(&self.name, key).await {
            Ok(value) => {
                self.metrics.peer_fetches.inc([peer.addr(), "ok"]);
                Ok(value)
            }
            Err(e) => {
                let status = if e.is_not_found() { "not_found" } else { "error" };
                self.metrics.peer_fetches.inc([peer.addr(), status]);
                Err(e)
            }
        }
    }

    /// Load from the backing source and populate the local store.
    async fn load_locally(&self, key: &str) -> Result<Bytes> {
        self.metrics.loads.inc();
        match self.loader.load(key).await {
            Ok(value) => {
                self.store.put(key, value.clone()).await;
                Ok(value)
            }
            Err(e) => {
                if !e.is_not_found() {
                    self.metrics.load_failures.inc();
                }
                Err(e)
            }
        }
    }
}

/// Registry of named groups hosted by this node.
///
/// The RPC request carries `{group, key}`, so one node can serve several
/// independent caches with distinct loaders and stores.
pub struct Groups {
    groups: DashMap<String, Arc<Group>>,
    picker: RwLock<Option<Arc<dyn PeerPicker>>>,
}

impl Groups {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            groups: DashMap::new(),
            picker: RwLock::new(None),
        })
    }

    /// Create and register a group. Groups created after a picker is
    /// attached inherit it.
    pub fn create(
        &self,
        name: impl Into<String>,
        store: Arc<dyn LocalStore>,
        loader: Arc<dyn SourceLoader>,
    ) -> Arc<Group> {
        let group = Arc::new(Group::new(name, store, loader));
        if let Some(picker) = self.picker.read().clone() {
            group.register_picker(picker);
        }
        self.groups.insert(group.name().to_owned(), group.clone());
        group
    }

    /// Look up a group by name.
    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.get(name).map(|entry| entry.value().clone())
    }

    /// Attach a picker to every current and future group.
    pub fn attach_picker(&self, picker: Arc<dyn PeerPicker>) {
        *self.picker.write() = Some(picker.clone());
        for entry in self.groups.iter() {
            entry.value().register_picker(picker.clone());
        }
    }

    /// Names of all registered groups, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use crate::store::MokaStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingLoader {
        calls: AtomicUsize,
        value: Option<&'static [u8]>,
        delay: Duration,
    }

    impl CountingLoader {
        fn some(value: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                value: Some(value),
                delay: Duration::ZERO,
            })
        }

        fn missing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                value: None,
                delay: Duration::ZERO,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceLoader for CountingLoader {
        async fn load(&self, key: &str) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.value {
                Some(value) => Ok(Bytes::from_static(value)),
                None => Err(Error::KeyNotFound(key.to_owned())),
            }
        }
    }

    enum PeerBehavior {
        Value(&'static [u8]),
        NotFound,
        Unreachable,
    }

    struct FakePeer {
        behavior: PeerBehavior,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PeerGetter for FakePeer {
        async fn get(&self, _group: &str, key: &str) -> Result<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                PeerBehavior::Value(value) => Ok(Bytes::from_static(value)),
                PeerBehavior::NotFound => Err(Error::KeyNotFound(key.to_owned())),
                PeerBehavior::Unreachable => Err(NetworkError::ConnectionClosed.into()),
            }
        }

        fn addr(&self) -> &str {
            "127.0.0.1:9"
        }
    }

    struct FakePicker {
        peer: Option<Arc<FakePeer>>,
    }

    impl FakePicker {
        fn remote(behavior: PeerBehavior) -> (Arc<Self>, Arc<FakePeer>) {
            let peer = Arc::new(FakePeer {
                behavior,
                calls: AtomicUsize::new(0),
            });
            (
                Arc::new(Self {
                    peer: Some(peer.clone()),
                }),
                peer,
            )
        }

        fn local() -> Arc<Self> {
            Arc::new(Self { peer: None })
        }
    }

    impl PeerPicker for FakePicker {
        fn pick_peer(&self, _key: &str) -> Option<Arc<dyn PeerGetter>> {
            self.peer
                .clone()
                .map(|peer| peer as Arc<dyn PeerGetter>)
        }
    }

    fn group_with(loader: Arc<CountingLoader>) -> Group {
        Group::new("scores", Arc::new(MokaStore::new(1 << 20)), loader)
    }

    #[tokio::test]
    async fn hit_skips_loader_and_ring() {
        let loader = CountingLoader::some(b"630");
        let group = group_with(loader.clone());

        group.store.put("tom", Bytes::from_static(b"630")).await;
        assert_eq!(&group.get("tom").await.unwrap()[..], b"630");
        assert_eq!(loader.calls(), 0);

        let stats = group.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[tokio::test]
    async fn miss_loads_locally_and_populates_store() {
        let loader = CountingLoader::some(b"630");
        let group = group_with(loader.clone());

        assert_eq!(&group.get("tom").await.unwrap()[..], b"630");
        assert_eq!(loader.calls(), 1);

        // Second get is a hit; the loader is not consulted again.
        assert_eq!(&group.get("tom").await.unwrap()[..], b"630");
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn missing_key_propagates_not_found() {
        let loader = CountingLoader::missing();
        let group = group_with(loader.clone());

        let err = group.get("nobody").await.unwrap_err();
        assert!(err.is_not_found());
        // Absence is not a load failure.
        assert_eq!(group.stats().load_failures, 0);
    }

    #[tokio::test]
    async fn remote_owner_serves_without_populating_store() {
        let loader = CountingLoader::some(b"local");
        let group = group_with(loader.clone());
        let (picker, peer) = FakePicker::remote(PeerBehavior::Value(b"remote"));
        group.register_picker(picker);

        assert_eq!(&group.get("tom").await.unwrap()[..], b"remote");
        assert_eq!(peer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.calls(), 0);
        // Not authoritative for the key: the local store stays empty.
        assert_eq!(group.store.get("tom").await, None);
    }

    #[tokio::test]
    async fn unreachable_peer_falls_back_to_local_load_once() {
        let loader = CountingLoader::some(b"630");
        let group = group_with(loader.clone());
        let (picker, peer) = FakePicker::remote(PeerBehavior::Unreachable);
        group.register_picker(picker);

        assert_eq!(&group.get("tom").await.unwrap()[..], b"630");
        assert_eq!(peer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(loader.calls(), 1);
        // The fallback load is authoritative here, so it populates.
        assert_eq!(group.store.get("tom").await, Some(Bytes::from_static(b"630")));
    }

    #[tokio::test]
    async fn remote_not_found_is_not_masked_by_fallback() {
        let loader = CountingLoader::some(b"stale");
        let group = group_with(loader.clone());
        let (picker, _peer) = FakePicker::remote(PeerBehavior::NotFound);
        group.register_picker(picker);

        let err = group.get("nobody").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(loader.calls(), 0);
    }

    #[tokio::test]
    async fn self_owned_keys_take_the_local_path() {
        let loader = CountingLoader::some(b"630");
        let group = group_with(loader.clone());
        group.register_picker(FakePicker::local());

        assert_eq!(&group.get("tom").await.unwrap()[..], b"630");
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn thundering_herd_loads_once() {
        let loader = Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
            value: Some(b"630"),
            delay: Duration::from_millis(100),
        });
        let group = Arc::new(group_with(loader.clone()));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let group = group.clone();
            tasks.push(tokio::spawn(async move { group.get("tom").await }));
        }

        for task in tasks {
            assert_eq!(&task.await.unwrap().unwrap()[..], b"630");
        }
        assert_eq!(loader.calls(), 1);
    }

    #[tokio::test]
    async fn registry_routes_by_name() {
        let groups = Groups::new();
        let loader = CountingLoader::some(b"630");
        groups.create("scores", Arc::new(MokaStore::new(1 << 20)), loader);

        assert!(groups.get("scores").is_some());
        assert!(groups.get("unknown").is_none());
        assert_eq!(groups.names(), vec!["scores".to_string()]);
    }
}
