//! Cache node binary.
//!
//! Runs one peer of the distributed cache, serving a demo "scores" group
//! backed by a slow in-process source. Optionally runs a front-end HTTP
//! API (`GET /api?key=...`) and a `/metrics` exposition.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use clap::Parser;
use shoal::metrics::render_group;
use shoal::{CacheNode, Error, FnLoader, Groups, MokaStore, NodeConfig};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "shoal-node", about = "Distributed cache node")]
struct Args {
    /// Port for the peer RPC server.
    #[arg(long, default_value_t = 8001)]
    port: u16,

    /// Host to bind and advertise.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Also run the front-end API server.
    #[arg(long)]
    api: bool,

    /// Address for the front-end API server.
    #[arg(long, default_value = "127.0.0.1:9999")]
    api_addr: SocketAddr,

    /// Coordination service endpoints.
    #[arg(long = "etcd", default_value = "http://127.0.0.1:2379")]
    etcd_endpoints: Vec<String>,

    /// Service name peers register under.
    #[arg(long, default_value = "shoal")]
    service: String,

    /// Byte budget for the local store.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    cache_bytes: u64,
}

/// Demo backing source: a static table standing in for a slow database.
fn slow_db() -> Arc<FnLoader<impl Fn(&str) -> shoal::Result<Bytes> + Send + Sync>> {
    let db: HashMap<&'static str, &'static str> =
        [("Tom", "630"), ("Jack", "589"), ("Sam", "567")]
            .into_iter()
            .collect();

    Arc::new(FnLoader(move |key: &str| {
        info!(key, "slow db lookup");
        match db.get(key) {
            Some(value) => Ok(Bytes::copy_from_slice(value.as_bytes())),
            None => Err(Error::KeyNotFound(key.to_owned())),
        }
    }))
}

#[derive(Clone)]
struct ApiState {
    groups: Arc<Groups>,
}

async fn api_get(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Vec<u8>, (StatusCode, String)> {
    let Some(key) = params.get("key") else {
        return Err((StatusCode::BAD_REQUEST, "missing key parameter".into()));
    };
    let Some(group) = state.groups.get("scores") else {
        return Err((StatusCode::INTERNAL_SERVER_ERROR, "group missing".into()));
    };

    match group.get(key).await {
        Ok(value) => Ok(value.to_vec()),
        Err(e) if e.is_not_found() => Err((StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn api_metrics(State(state): State<ApiState>) -> String {
    let mut out = String::new();
    for name in state.groups.names() {
        if let Some(group) = state.groups.get(&name) {
            render_group(&mut out, &name, group.metrics(), &group.stats());
        }
    }
    out
}

#[tokio::main]
async fn main() -> shoal::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let bind_addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|e| Error::Config(format!("invalid bind address: {}", e)))?;

    let config = NodeConfig::new(bind_addr)
        .with_service_name(args.service)
        .with_etcd_endpoints(args.etcd_endpoints)
        .with_max_cache_bytes(args.cache_bytes);

    let groups = Groups::new();
    groups.create(
        "scores",
        Arc::new(MokaStore::new(config.max_cache_bytes)),
        slow_db(),
    );

    let (node, mut fatal_rx) = CacheNode::start(config, groups.clone()).await?;

    if args.api {
        let state = ApiState { groups };
        let app = Router::new()
            .route("/api", get(api_get))
            .route("/metrics", get(api_metrics))
            .with_state(state);

        let api_addr = args.api_addr;
        tokio::spawn(async move {
            info!(addr = %api_addr, "api server listening");
            match tokio::net::TcpListener::bind(api_addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "api server error");
                    }
                }
                Err(e) => error!(error = %e, "api server bind failed"),
            }
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
        Some(err) = fatal_rx.recv() => {
            error!(error = %err, "registration lost irrecoverably");
        }
    }

    node.shutdown().await
}
