//! Demo mirror server.
//!
//! Watches a directory, runs one mirror session, and serves observers on
//! ws://localhost:3100/ws/{session_id}.
//!
//! Run with: cargo run -p mirror-server-demo -- [root]

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mirror_core::{FileChangeRecord, MirrorConfig};
use mirror_engine::{MirrorEngine, Transfer, TransferError};
use mirror_transport::{ConnectionHub, WsState};

/// Stand-in transfer: counts bytes and logs. A real deployment plugs in
/// rsync/HTTP here.
struct LoggingTransfer;

#[async_trait]
impl Transfer for LoggingTransfer {
    async fn transfer(&self, batch: &[FileChangeRecord]) -> Result<u64, TransferError> {
        let bytes: u64 = batch.iter().map(|r| r.size_bytes).sum();
        for record in batch {
            tracing::info!(path = %record.path.display(), kind = ?record.change_kind, "Transferring");
        }
        Ok(bytes)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let root = std::env::args()
        .nth(1)
        .map_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")), PathBuf::from);

    let config = MirrorConfig::new(root);
    let heartbeat = config.heartbeat_interval();
    let retry = config.retry;

    let (hub, inbound_rx, count_rx) = ConnectionHub::new();
    let hub = Arc::new(hub);
    tokio::spawn(Arc::clone(&hub).run_heartbeats(heartbeat));

    let engine = MirrorEngine::new(
        Arc::clone(&hub),
        inbound_rx,
        count_rx,
        Arc::new(LoggingTransfer),
        None,
    );

    let session = engine
        .start(config)
        .await
        .context("failed to start mirror session")?;
    tracing::info!(
        session_id = %session.session_id,
        root = %session.local_root_path.display(),
        "Mirror session running"
    );

    let app = mirror_transport::router(WsState::new(Arc::clone(&hub), retry))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([127, 0, 0, 1], 3100));
    tracing::info!("Observers: ws://{addr}/ws/{}", session.session_id);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
