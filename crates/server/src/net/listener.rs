use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use tokio::net::TcpListener;

use crate::host::WorldHost;

/// Bind `addr` and serve clients until the listener fails.
pub async fn run(host: Arc<WorldHost>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    serve(host, listener).await
}

/// Accept clients on an already bound listener.
pub async fn serve(host: Arc<WorldHost>, listener: TcpListener) -> anyhow::Result<()> {
    tracing::info!("Listening on {}", listener.local_addr()?);
    let next_id = AtomicU64::new(1);

    loop {
        let (stream, addr) = listener.accept().await?;
        // A peer that already hung up can fail this; it only hurts that peer.
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }
        let client_id = next_id.fetch_add(1, Ordering::Relaxed);
        tracing::info!("Connection from {} (client {})", addr, client_id);

        let host = Arc::clone(&host);
        tokio::spawn(async move {
            if let Err(e) = super::connection::handle(stream, host, client_id).await {
                tracing::warn!("Connection from {} closed: {:#}", addr, e);
            }
        });
    }
}
