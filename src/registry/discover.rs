//! Peer discovery via a coordination service watch.
//!
//! On startup the discoverer scans the service prefix, then applies watch
//! events to a local roster. After every batch it publishes the complete
//! current peer list on a single-slot watch channel: an unconsumed
//! snapshot is replaced, never queued, because only the latest membership
//! matters to a consumer.

use crate::error::Result;
use etcd_client::{EventType, GetOptions, WatchOptions, WatchStream, Watcher};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Local mirror of the registered peers: coordination key to address.
#[derive(Debug, Default, Clone)]
pub struct PeerRoster {
    records: HashMap<String, String>,
}

impl PeerRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a Put event: insert or update a peer record.
    pub fn apply_put(&mut self, key: impl Into<String>, addr: impl Into<String>) {
        self.records.insert(key.into(), addr.into());
    }

    /// Apply a Delete event: remove a peer record.
    pub fn apply_delete(&mut self, key: &str) {
        self.records.remove(key);
    }

    /// The complete current peer-address list, sorted for stable output.
    pub fn snapshot(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.records.values().cloned().collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Watches the service prefix and publishes peer-set snapshots.
pub struct Discoverer {
    peers_rx: watch::Receiver<Vec<String>>,
    stop_tx: mpsc::Sender<()>,
    event_task: JoinHandle<()>,
}

impl Discoverer {
    /// Scan the prefix, open the watch, and start the event loop.
    pub async fn start(
        endpoints: &[String],
        service_name: &str,
        call_timeout: Duration,
    ) -> Result<Self> {
        let mut client = super::connect(endpoints, call_timeout).await?;
        let prefix = format!("/{}/", service_name);

        // Full read of the current membership before watching for deltas.
        let options = GetOptions::new().with_prefix();
        let initial = tokio::time::timeout(
            call_timeout,
            client.get(prefix.clone(), Some(options)),
        )
        .await
        .map_err(|_| crate::error::RegistryError::Timeout)??;

        let mut roster = PeerRoster::new();
        for kv in initial.kvs() {
            roster.apply_put(kv.key_str()?.to_owned(), kv.value_str()?.to_owned());
        }
        info!(prefix = %prefix, peers = roster.len(), "discovered initial peer set");

        let (watcher, stream) = client
            .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await?;

        let (peers_tx, peers_rx) = watch::channel(roster.snapshot());
        let (stop_tx, stop_rx) = mpsc::channel(1);

        let event_task = tokio::spawn(event_loop(roster, watcher, stream, peers_tx, stop_rx));

        Ok(Self {
            peers_rx,
            stop_tx,
            event_task,
        })
    }

    /// Subscribe to peer-set snapshots. The receiver always holds the most
    /// recent snapshot; intermediate states are dropped, not queued.
    pub fn peers(&self) -> watch::Receiver<Vec<String>> {
        self.peers_rx.clone()
    }

    /// Stop the event loop and release the watch.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(()).await;
        let _ = (&mut self.event_task).await;
    }
}

async fn event_loop(
    mut roster: PeerRoster,
    mut watcher: Watcher,
    mut stream: WatchStream,
    peers_tx: watch::Sender<Vec<String>>,
    mut stop_rx: mpsc::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                let _ = watcher.cancel().await;
                debug!("discovery event loop stopped");
                return;
            }
            msg = stream.message() => {
                match msg {
                    Ok(Some(response)) => {
                        for event in response.events() {
                            apply_event(&mut roster, event);
                        }
                        // Publish the complete current list after the batch.
                        let snapshot = roster.snapshot();
                        debug!(peers = ?snapshot, "peer set changed");
                        let _ = peers_tx.send(snapshot);
                    }
                    Ok(None) => {
                        warn!("watch stream closed");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "watch stream error");
                        return;
                    }
                }
            }
        }
    }
}

fn apply_event(roster: &mut PeerRoster, event: &etcd_client::Event) {
    let Some(kv) = event.kv() else {
        return;
    };
    let Ok(key) = kv.key_str() else {
        warn!("ignoring event with non-utf8 key");
        return;
    };

    match event.event_type() {
        EventType::Put => match kv.value_str() {
            Ok(addr) => roster.apply_put(key, addr),
            Err(_) => warn!(key, "ignoring put with non-utf8 value"),
        },
        EventType::Delete => roster.apply_delete(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_mirrors_put_and_delete() {
        let mut roster = PeerRoster::new();
        roster.apply_put("/shoal/127.0.0.1:8001", "127.0.0.1:8001");
        roster.apply_put("/shoal/127.0.0.1:8002", "127.0.0.1:8002");
        assert_eq!(
            roster.snapshot(),
            vec!["127.0.0.1:8001".to_string(), "127.0.0.1:8002".to_string()]
        );

        roster.apply_delete("/shoal/127.0.0.1:8001");
        assert_eq!(roster.snapshot(), vec!["127.0.0.1:8002".to_string()]);

        // Deleting an unknown key is a no-op.
        roster.apply_delete("/shoal/127.0.0.1:9999");
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn reregistration_updates_in_place() {
        let mut roster = PeerRoster::new();
        roster.apply_put("/shoal/node-a", "127.0.0.1:8001");
        roster.apply_put("/shoal/node-a", "127.0.0.1:8001");
        assert_eq!(roster.len(), 1);
    }

    #[tokio::test]
    async fn watch_channel_keeps_only_the_latest_snapshot() {
        let (tx, mut rx) = watch::channel(vec!["a".to_string()]);

        // Two publishes without an intervening read: the first is replaced.
        tx.send(vec!["a".to_string(), "b".to_string()]).unwrap();
        tx.send(vec!["b".to_string()]).unwrap();

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), vec!["b".to_string()]);
        assert!(!rx.has_changed().unwrap());
    }
}
