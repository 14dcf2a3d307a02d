//! Client side of the peer RPC: implements `PeerGetter` over TCP.

use crate::error::{Error, NetworkError, Result};
use crate::net::rpc::{read_message, write_message, GetResponse, Message};
use crate::peers::PeerGetter;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// A remote peer reachable at one address.
///
/// Connections are opened per request; the whole exchange is bounded by
/// the RPC timeout.
#[derive(Debug, Clone)]
pub struct PeerClient {
    addr: String,
    rpc_timeout: Duration,
}

impl PeerClient {
    pub fn new(addr: impl Into<String>, rpc_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            rpc_timeout,
        }
    }

    async fn exchange(&self, request: Message) -> Result<GetResponse> {
        let mut stream = timeout(self.rpc_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| NetworkError::Timeout(self.addr.clone()))?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: self.addr.clone(),
                reason: e.to_string(),
            })?;

        write_message(&mut stream, &request).await?;

        let reply = timeout(self.rpc_timeout, read_message(&mut stream))
            .await
            .map_err(|_| NetworkError::Timeout(self.addr.clone()))??;

        match reply {
            Some(Message::GetResponse(response)) => Ok(response),
            Some(other) => {
                Err(NetworkError::Remote(format!("unexpected reply: {:?}", other)).into())
            }
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }
}

#[async_trait]
impl PeerGetter for PeerClient {
    async fn get(&self, group: &str, key: &str) -> Result<Bytes> {
        let request = Message::GetRequest {
            group: group.to_owned(),
            key: key.to_owned(),
        };

        match self.exchange(request).await? {
            GetResponse::Value(value) => Ok(Bytes::from(value)),
            GetResponse::NotFound(_) => Err(Error::KeyNotFound(key.to_owned())),
            GetResponse::Error(reason) => Err(NetworkError::Remote(reason).into()),
        }
    }

    fn addr(&self) -> &str {
        &self.addr
    }
}
