//! Configuration types for the cache node.

use std::net::SocketAddr;
use std::time::Duration;

/// Default lease TTL for the node's registration.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(10);

/// Default number of virtual nodes per peer on the hash ring.
pub const DEFAULT_REPLICAS: usize = 150;

/// Main configuration for a cache node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Service name under which peers register and discover each other.
    /// Registration keys take the form `/<service_name>/<advertise_addr>`.
    pub service_name: String,

    /// Address to bind the peer RPC server to.
    pub bind_addr: SocketAddr,

    /// Address advertised to peers via the coordination service.
    /// This is the identity of the node on the hash ring.
    pub advertise_addr: String,

    /// Coordination service (etcd) endpoints.
    pub etcd_endpoints: Vec<String>,

    /// TTL of the registration lease. Re-registration after lease loss
    /// reuses this value.
    pub lease_ttl: Duration,

    /// Virtual nodes per peer on the hash ring.
    pub replicas: usize,

    /// Byte budget for each group's local store.
    pub max_cache_bytes: u64,

    /// Timeout for a single peer RPC (connect + exchange).
    pub rpc_timeout: Duration,

    /// Timeout for bounded coordination service calls (dial, grant, put,
    /// prefix scan). The watch and keep-alive streams are unbounded and are
    /// torn down only by explicit stop signals.
    pub registry_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            service_name: "shoal".to_string(),
            bind_addr: "127.0.0.1:8001".parse().unwrap(),
            advertise_addr: "127.0.0.1:8001".to_string(),
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],
            lease_ttl: DEFAULT_LEASE_TTL,
            replicas: DEFAULT_REPLICAS,
            max_cache_bytes: 64 * 1024 * 1024,
            rpc_timeout: Duration::from_secs(3),
            registry_timeout: Duration::from_secs(5),
        }
    }
}

impl NodeConfig {
    /// Create a configuration for a node bound and advertised at `addr`.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            advertise_addr: bind_addr.to_string(),
            ..Default::default()
        }
    }

    /// Set the service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the advertised address (when it differs from the bind address,
    /// e.g. behind NAT).
    pub fn with_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.advertise_addr = addr.into();
        self
    }

    /// Set the coordination service endpoints.
    pub fn with_etcd_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.etcd_endpoints = endpoints;
        self
    }

    /// Set the registration lease TTL.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the number of virtual nodes per peer.
    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas.max(1);
        self
    }

    /// Set the byte budget for each group's local store.
    pub fn with_max_cache_bytes(mut self, bytes: u64) -> Self {
        self.max_cache_bytes = bytes;
        self
    }

    /// Set the peer RPC timeout.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the timeout for bounded coordination service calls.
    pub fn with_registry_timeout(mut self, timeout: Duration) -> Self {
        self.registry_timeout = timeout;
        self
    }

    /// The etcd key this node registers under.
    pub fn registry_key(&self) -> String {
        format!("/{}/{}", self.service_name, self.advertise_addr)
    }

    /// The etcd prefix the discoverer watches.
    pub fn registry_prefix(&self) -> String {
        format!("/{}/", self.service_name)
    }
}
