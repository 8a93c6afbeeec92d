use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use sandbox_engine::world::view::ViewerKind;
use sandbox_server::config::{Cli, Mode, ServerConfig};
use sandbox_server::host::WorldHost;
use sandbox_server::net::client::RemoteClient;
use sandbox_server::net::listener;

/// How often the thin client re-checks its view.
const CLIENT_SYNC_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.mode {
        Mode::Serve { world, bind } => {
            let host = open_host(ServerConfig::from_args(&world, Some(bind)))?;
            tracing::info!("Sandbox server starting on {}", bind);

            tokio::select! {
                result = listener::run(Arc::clone(&host), bind) => {
                    if let Err(e) = result {
                        tracing::error!("Server error: {:#}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Ctrl+C received, shutting down...");
                }
            }
            shutdown(host).await
        }
        Mode::Local { world, duration_secs } => {
            let host = open_host(ServerConfig::from_args(&world, None))?;
            let spawn = host.world().config().spawn;
            let viewer = host.world().add_viewer(ViewerKind::Player("local".into()), spawn);
            tracing::info!("Local world running");

            let run_for = async {
                match duration_secs {
                    Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = run_for => tracing::info!("Run time elapsed, shutting down..."),
                _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl+C received, shutting down..."),
            }
            host.world().remove_viewer(viewer);
            shutdown(host).await
        }
        Mode::Connect {
            server,
            name,
            view_distance,
        } => run_client(server, &name, view_distance).await,
    }
}

fn open_host(config: ServerConfig) -> anyhow::Result<Arc<WorldHost>> {
    let host = Arc::new(WorldHost::open(config)?);
    host.start()?;
    host.spawn_autosave();
    host.spawn_metrics_log();
    Ok(host)
}

async fn shutdown(host: Arc<WorldHost>) -> anyhow::Result<()> {
    tracing::info!("Saving world before exit...");
    tokio::task::spawn_blocking(move || host.shutdown())
        .await
        .context("shutdown task panicked")??;
    Ok(())
}

async fn run_client(server: std::net::SocketAddr, name: &str, view_distance: u32) -> anyhow::Result<()> {
    let client = RemoteClient::connect(server, name, view_distance).await?;
    let mut interval = tokio::time::interval(CLIENT_SYNC_INTERVAL);
    let mut last_reported = usize::MAX;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if !client.is_connected() {
                    anyhow::bail!("disconnected from {}", server);
                }
                client.sync_view();
                let mirrored = client.chunks().len();
                if mirrored != last_reported {
                    tracing::info!("Mirroring {} chunks around {:?}", mirrored, client.position());
                    last_reported = mirrored;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Disconnecting");
                return Ok(());
            }
        }
    }
}
