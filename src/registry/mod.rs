//! Membership: registration and discovery through the coordination service.
//!
//! Each node writes `/<service>/<advertise_addr> -> advertise_addr` under a
//! renewable lease; every node watches the service prefix and publishes the
//! complete current peer set whenever it changes. Lease expiry without
//! renewal removes the key, so a crashed node disappears from every peer's
//! view within one TTL.

pub mod discover;
pub mod register;

pub use discover::{Discoverer, PeerRoster};
pub use register::Registrar;

use crate::error::{RegistryError, Result};
use etcd_client::{Client, ConnectOptions};
use std::time::Duration;

/// Connect to the coordination service with a bounded dial timeout.
pub(crate) async fn connect(endpoints: &[String], timeout: Duration) -> Result<Client> {
    let options = ConnectOptions::new()
        .with_connect_timeout(timeout)
        .with_timeout(timeout);

    tokio::time::timeout(timeout, Client::connect(endpoints, Some(options)))
        .await
        .map_err(|_| RegistryError::Timeout)?
        .map_err(Into::into)
}
