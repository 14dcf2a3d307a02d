//! TCP server answering peer get requests.

use crate::error::{NetworkError, Result};
use crate::net::rpc::{read_message, write_message, GetResponse, Message};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Handler for incoming get requests.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Resolve a get for `key` within `group`.
    async fn handle(&self, group: &str, key: &str) -> GetResponse;
}

/// TCP server for peer communication.
pub struct RpcServer {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl RpcServer {
    /// Bind the server. Returns the server and its shutdown handle.
    pub async fn bind(
        bind_addr: SocketAddr,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            handler,
            shutdown_rx,
        };

        Ok((server, shutdown_tx))
    }

    /// The address the server actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Accept connections until the shutdown signal fires.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr()?, "rpc server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "accepted connection");
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    debug!(error = %e, "connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("rpc server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<()> {
        while let Some(msg) = read_message(&mut stream).await? {
            let response = match msg {
                Message::GetRequest { group, key } => handler.handle(&group, &key).await,
                other => {
                    debug!(message = ?other, "unexpected message");
                    GetResponse::Error("unexpected message".to_string())
                }
            };

            write_message(&mut stream, &Message::GetResponse(response)).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::client::PeerClient;
    use crate::peers::PeerGetter;
    use std::time::Duration;

    struct StaticHandler;

    #[async_trait]
    impl RequestHandler for StaticHandler {
        async fn handle(&self, group: &str, key: &str) -> GetResponse {
            if group != "scores" {
                return GetResponse::Error(format!("no such group: {}", group));
            }
            match key {
                "tom" => GetResponse::Value(b"630".to_vec()),
                _ => GetResponse::NotFound(format!("key not found: {}", key)),
            }
        }
    }

    async fn start_server() -> (SocketAddr, mpsc::Sender<()>) {
        let (server, shutdown_tx) = RpcServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(StaticHandler),
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, shutdown_tx)
    }

    #[tokio::test]
    async fn serves_values_over_the_wire() {
        let (addr, _shutdown) = start_server().await;
        let client = PeerClient::new(addr.to_string(), Duration::from_secs(2));

        let value = client.get("scores", "tom").await.unwrap();
        assert_eq!(&value[..], b"630");
    }

    #[tokio::test]
    async fn remote_not_found_maps_to_key_not_found() {
        let (addr, _shutdown) = start_server().await;
        let client = PeerClient::new(addr.to_string(), Duration::from_secs(2));

        let err = client.get("scores", "nobody").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn remote_errors_map_to_peer_unavailable() {
        let (addr, _shutdown) = start_server().await;
        let client = PeerClient::new(addr.to_string(), Duration::from_secs(2));

        let err = client.get("unknown", "tom").await.unwrap_err();
        assert!(err.is_peer_unavailable());
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_transport_error() {
        // Bind then drop to find a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = PeerClient::new(addr.to_string(), Duration::from_millis(500));
        let err = client.get("scores", "tom").await.unwrap_err();
        assert!(err.is_peer_unavailable());
    }
}
