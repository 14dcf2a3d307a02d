//! Node registration with a renewable lease.
//!
//! State machine: `Unregistered -> Registered(lease)`, with a background
//! renewal loop keeping the lease alive. Losing the keep-alive stream is
//! fatal for the current lease: the loop makes exactly one re-registration
//! attempt (fresh lease, fresh put); if that fails, the error is pushed on
//! the fatal channel for the owning process to act on.

use crate::config::NodeConfig;
use crate::error::{Error, RegistryError, Result};
use etcd_client::{Client, PutOptions};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Handle to this node's registration in the coordination service.
pub struct Registrar {
    client: Client,
    key: String,
    lease_id: Arc<AtomicI64>,
    call_timeout: Duration,
    stop_tx: mpsc::Sender<()>,
    renewal_task: JoinHandle<()>,
}

impl Registrar {
    /// Register this node and start the renewal loop.
    ///
    /// Returns the registrar and a channel carrying fatal registration
    /// errors (lease lost and re-registration failed). Registration
    /// failure here is fatal to node startup and is returned directly.
    pub async fn register(config: &NodeConfig) -> Result<(Self, mpsc::Receiver<Error>)> {
        let mut client =
            super::connect(&config.etcd_endpoints, config.registry_timeout).await?;

        let key = config.registry_key();
        let addr = config.advertise_addr.clone();
        let ttl = config.lease_ttl.as_secs().max(1) as i64;
        let call_timeout = config.registry_timeout;

        let id = grant_and_put(&mut client, &key, &addr, ttl, call_timeout).await?;
        let lease_id = Arc::new(AtomicI64::new(id));

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (fatal_tx, fatal_rx) = mpsc::channel(1);

        let renewal_task = tokio::spawn(renewal_loop(
            client.clone(),
            key.clone(),
            addr,
            ttl,
            call_timeout,
            lease_id.clone(),
            stop_rx,
            fatal_tx,
        ));

        let registrar = Self {
            client,
            key,
            lease_id,
            call_timeout,
            stop_tx,
            renewal_task,
        };

        Ok((registrar, fatal_rx))
    }

    /// The etcd key this node is registered under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Gracefully deregister: stop the renewal loop and revoke the lease.
    pub async fn unregister(mut self) -> Result<()> {
        let _ = self.stop_tx.send(()).await;
        let _ = (&mut self.renewal_task).await;

        let lease_id = self.lease_id.load(Ordering::Acquire);
        tokio::time::timeout(self.call_timeout, self.client.lease_revoke(lease_id))
            .await
            .map_err(|_| RegistryError::Timeout)??;

        info!(key = %self.key, lease_id, "deregistered");
        Ok(())
    }
}

/// Grant a lease and write the registration key under it.
///
/// Re-running this for the same node overwrites the single keyed entry; it
/// never creates duplicates.
async fn grant_and_put(
    client: &mut Client,
    key: &str,
    addr: &str,
    ttl: i64,
    call_timeout: Duration,
) -> Result<i64> {
    let lease = tokio::time::timeout(call_timeout, client.lease_grant(ttl, None))
        .await
        .map_err(|_| RegistryError::Timeout)??;
    let lease_id = lease.id();

    let options = PutOptions::new().with_lease(lease_id);
    tokio::time::timeout(call_timeout, client.put(key, addr, Some(options)))
        .await
        .map_err(|_| RegistryError::Timeout)??;

    info!(key, lease_id, ttl, "registered");
    Ok(lease_id)
}

/// Keep the lease alive until stopped; on stream loss, re-register once.
#[allow(clippy::too_many_arguments)]
async fn renewal_loop(
    mut client: Client,
    key: String,
    addr: String,
    ttl: i64,
    call_timeout: Duration,
    lease_id: Arc<AtomicI64>,
    mut stop_rx: mpsc::Receiver<()>,
    fatal_tx: mpsc::Sender<Error>,
) {
    'register: loop {
        let current = lease_id.load(Ordering::Acquire);
        let stream = client.lease_keep_alive(current).await;

        let (mut keeper, mut responses) = match stream {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, lease_id = current, "keep-alive setup failed");
                if !reregister(
                    &mut client,
                    &key,
                    &addr,
                    ttl,
                    call_timeout,
                    &lease_id,
                    &fatal_tx,
                )
                .await
                {
                    return;
                }
                continue 'register;
            }
        };

        // Renew at a third of the TTL so a couple of missed rounds still
        // land inside the lease window.
        let period = Duration::from_secs((ttl as u64 / 3).max(1));
        let mut tick = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    debug!(lease_id = current, "renewal loop stopped");
                    return;
                }
                _ = tick.tick() => {
                    if let Err(e) = keeper.keep_alive().await {
                        warn!(error = %e, lease_id = current, "keep-alive send failed");
                        break;
                    }
                }
                msg = responses.message() => {
                    match msg {
                        Ok(Some(resp)) if resp.ttl() > 0 => {
                            debug!(lease_id = current, ttl = resp.ttl(), "lease renewed");
                        }
                        Ok(Some(_)) => {
                            warn!(lease_id = current, "lease expired");
                            break;
                        }
                        Ok(None) => {
                            warn!(lease_id = current, "keep-alive stream closed");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, lease_id = current, "keep-alive stream error");
                            break;
                        }
                    }
                }
            }
        }

        // The coordination service considers the lease lost.
        if !reregister(
            &mut client,
            &key,
            &addr,
            ttl,
            call_timeout,
            &lease_id,
            &fatal_tx,
        )
        .await
        {
            return;
        }
    }
}

/// One re-registration attempt after lease loss. Returns whether the loop
/// should continue with the new lease.
async fn reregister(
    client: &mut Client,
    key: &str,
    addr: &str,
    ttl: i64,
    call_timeout: Duration,
    lease_id: &AtomicI64,
    fatal_tx: &mpsc::Sender<Error>,
) -> bool {
    // The re-registration reuses the originally configured TTL.
    match grant_and_put(client, key, addr, ttl, call_timeout).await {
        Ok(id) => {
            lease_id.store(id, Ordering::Release);
            true
        }
        Err(e) => {
            warn!(error = %e, key, "re-registration failed");
            let _ = fatal_tx
                .send(Error::Registry(RegistryError::ReregistrationFailed(
                    e.to_string(),
                )))
                .await;
            false
        }
    }
}
