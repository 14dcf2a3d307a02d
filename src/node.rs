//! Process assembly: wires the ring, registry, RPC server, and groups into
//! one running cache node.

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::group::Groups;
use crate::net::{GetResponse, PeerClient, RequestHandler, RpcServer};
use crate::peers::{PeerGetter, PeerPicker};
use crate::registry::{Discoverer, Registrar};
use crate::ring::HashRing;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Peer picker backed by the consistent hash ring.
///
/// Membership changes rebuild a fresh ring from the snapshot and swap it
/// in under the lock, so lookups never observe a half-built ring.
pub struct RingPicker {
    self_addr: String,
    replicas: usize,
    rpc_timeout: Duration,
    ring: RwLock<HashRing>,
    clients: DashMap<String, Arc<PeerClient>>,
}

impl RingPicker {
    pub fn new(self_addr: impl Into<String>, replicas: usize, rpc_timeout: Duration) -> Self {
        Self {
            self_addr: self_addr.into(),
            replicas,
            rpc_timeout,
            ring: RwLock::new(HashRing::new(replicas)),
            clients: DashMap::new(),
        }
    }

    /// Replace the ring with one built from the new peer snapshot. Clients
    /// for departed peers are dropped.
    pub fn update_peers(&self, peers: &[String]) {
        let ring = HashRing::from_peers(self.replicas, peers);
        *self.ring.write() = ring;

        self.clients
            .retain(|addr, _| peers.iter().any(|p| p == addr));

        info!(peers = ?peers, "ring rebuilt");
    }

    /// Number of peers currently holding clients (excludes this node).
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    fn client_for(&self, addr: &str) -> Arc<PeerClient> {
        self.clients
            .entry(addr.to_owned())
            .or_insert_with(|| Arc::new(PeerClient::new(addr, self.rpc_timeout)))
            .clone()
    }
}

impl PeerPicker for RingPicker {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        let owner = {
            let ring = self.ring.read();
            // An empty ring means local ownership by default.
            ring.get(key)?.to_owned()
        };

        if owner == self.self_addr {
            return None;
        }

        Some(self.client_for(&owner) as Arc<dyn PeerGetter>)
    }
}

/// Serves peer get requests against the local group registry.
struct GroupHandler {
    groups: Arc<Groups>,
}

#[async_trait]
impl RequestHandler for GroupHandler {
    async fn handle(&self, group: &str, key: &str) -> GetResponse {
        let Some(group) = self.groups.get(group) else {
            return GetResponse::Error(format!("no such group: {}", group));
        };

        match group.get(key).await {
            Ok(value) => GetResponse::Value(value.to_vec()),
            Err(e) if e.is_not_found() => GetResponse::NotFound(e.to_string()),
            Err(e) => GetResponse::Error(e.to_string()),
        }
    }
}

/// A running cache node.
pub struct CacheNode {
    config: NodeConfig,
    groups: Arc<Groups>,
    picker: Arc<RingPicker>,
    registrar: Option<Registrar>,
    discoverer: Option<Discoverer>,
    server_shutdown: mpsc::Sender<()>,
    membership_task: JoinHandle<()>,
}

impl CacheNode {
    /// Start the node: bind the RPC server, register with the coordination
    /// service, discover peers, and keep the ring in sync with membership.
    ///
    /// Returns the node and a channel carrying fatal registration errors
    /// (the node's advertisement lapsed and could not be restored).
    pub async fn start(
        config: NodeConfig,
        groups: Arc<Groups>,
    ) -> Result<(Self, mpsc::Receiver<Error>)> {
        info!(addr = %config.advertise_addr, service = %config.service_name, "starting cache node");

        let picker = Arc::new(RingPicker::new(
            config.advertise_addr.clone(),
            config.replicas,
            config.rpc_timeout,
        ));
        groups.attach_picker(picker.clone());

        // Peer RPC server.
        let handler = Arc::new(GroupHandler {
            groups: groups.clone(),
        });
        let (server, server_shutdown) = RpcServer::bind(config.bind_addr, handler).await?;
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "rpc server error");
            }
        });

        // Register first so this node appears in its own initial scan.
        let (registrar, fatal_rx) = Registrar::register(&config).await?;

        let discoverer = Discoverer::start(
            &config.etcd_endpoints,
            &config.service_name,
            config.registry_timeout,
        )
        .await?;

        let mut peers_rx = discoverer.peers();
        picker.update_peers(&peers_rx.borrow_and_update().clone());

        let membership_picker = picker.clone();
        let membership_task = tokio::spawn(async move {
            while peers_rx.changed().await.is_ok() {
                let peers = peers_rx.borrow_and_update().clone();
                membership_picker.update_peers(&peers);
            }
        });

        let node = Self {
            config,
            groups,
            picker,
            registrar: Some(registrar),
            discoverer: Some(discoverer),
            server_shutdown,
            membership_task,
        };

        Ok((node, fatal_rx))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn groups(&self) -> &Arc<Groups> {
        &self.groups
    }

    pub fn picker(&self) -> &Arc<RingPicker> {
        &self.picker
    }

    /// Graceful shutdown: deregister, stop discovery, stop the server.
    pub async fn shutdown(mut self) -> Result<()> {
        info!(addr = %self.config.advertise_addr, "shutting down cache node");

        if let Some(registrar) = self.registrar.take() {
            if let Err(e) = registrar.unregister().await {
                error!(error = %e, "deregistration failed");
            }
        }

        if let Some(discoverer) = self.discoverer.take() {
            discoverer.stop().await;
        }

        self.membership_task.abort();
        let _ = self.server_shutdown.send(()).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_ring_means_local_ownership() {
        let picker = RingPicker::new("127.0.0.1:8001", 150, Duration::from_secs(1));
        assert!(picker.pick_peer("tom").is_none());
    }

    #[test]
    fn self_owned_keys_return_none() {
        let picker = RingPicker::new("127.0.0.1:8001", 150, Duration::from_secs(1));
        picker.update_peers(&snapshot(&["127.0.0.1:8001"]));
        // With this node as the only peer, every key is local.
        assert!(picker.pick_peer("tom").is_none());
        assert!(picker.pick_peer("jack").is_none());
    }

    #[test]
    fn remote_keys_resolve_to_the_owner() {
        let picker = RingPicker::new("127.0.0.1:8001", 150, Duration::from_secs(1));
        picker.update_peers(&snapshot(&["127.0.0.1:8001", "127.0.0.1:8002"]));

        // Across many keys, some must be remote; each remote getter must
        // name the other peer.
        let mut remote = 0;
        for i in 0..100 {
            let key = format!("key-{}", i);
            if let Some(peer) = picker.pick_peer(&key) {
                assert_eq!(peer.addr(), "127.0.0.1:8002");
                remote += 1;
            }
        }
        assert!(remote > 0);
    }

    #[test]
    fn departed_peers_lose_their_clients() {
        let picker = RingPicker::new("127.0.0.1:8001", 150, Duration::from_secs(1));
        picker.update_peers(&snapshot(&[
            "127.0.0.1:8001",
            "127.0.0.1:8002",
            "127.0.0.1:8003",
        ]));

        for i in 0..100 {
            picker.pick_peer(&format!("key-{}", i));
        }
        assert!(picker.client_count() > 0);

        picker.update_peers(&snapshot(&["127.0.0.1:8001"]));
        assert_eq!(picker.client_count(), 0);
        assert!(picker.pick_peer("tom").is_none());
    }

    #[test]
    fn pick_is_stable_across_calls() {
        let picker = RingPicker::new("127.0.0.1:8001", 150, Duration::from_secs(1));
        picker.update_peers(&snapshot(&["127.0.0.1:8001", "127.0.0.1:8002"]));

        for i in 0..20 {
            let key = format!("key-{}", i);
            let first = picker.pick_peer(&key).map(|p| p.addr().to_owned());
            let second = picker.pick_peer(&key).map(|p| p.addr().to_owned());
            assert_eq!(first, second);
        }
    }
}
