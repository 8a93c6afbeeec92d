//! A running world: lock, storage, clocks and the shared state connections
//! need.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sandbox_engine::error::TickerError;
use sandbox_engine::ticker::WorldTicker;
use sandbox_engine::world::World;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::containers::ContainerRegistry;
use crate::event_bus::{self, WorldChangeBatch};
use crate::metrics::Metrics;
use crate::persistence::NbtChunkStorage;
use crate::physics::GravityStepper;
use crate::simulation::{MAX_LOADS_IN_FLIGHT, MetricsListener, Simulation};
use crate::workers::{ChunkStreamer, WorkerPool};
use crate::world_lock::WorldLockService;
use crate::worldgen::LayeredGenerator;

/// How often metrics are logged while running.
const METRICS_INTERVAL: Duration = Duration::from_secs(60);

pub struct WorldHost {
    config: ServerConfig,
    world: Arc<World>,
    ticker: WorldTicker,
    lock: WorldLockService,
    pool: WorkerPool,
    gravity: Arc<GravityStepper>,
    bus: broadcast::Sender<WorldChangeBatch>,
    metrics: Arc<Metrics>,
    containers: Arc<ContainerRegistry>,
}

impl WorldHost {
    /// Lock the world directory and build the world on top of it. Must be
    /// called from inside a tokio runtime. Fails when another live process
    /// holds the world.
    pub fn open(config: ServerConfig) -> Result<Self> {
        let dir = config.world_dir.clone();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating world directory {}", dir.display()))?;

        let lock = WorldLockService::new(config.ignore_lock);
        if !lock.acquire(&dir)? {
            bail!(
                "world {} is in use by another process (pass --ignore-lock to open it anyway)",
                dir.display()
            );
        }

        let metrics = Arc::new(Metrics::new());
        let world = Arc::new(World::new(
            config.world.clone(),
            Arc::new(LayeredGenerator::new()),
            Arc::new(NbtChunkStorage::new(&dir)),
            Arc::new(MetricsListener::new(Arc::clone(&metrics))),
        ));
        world.set_persistence(true);

        tracing::info!(
            "Opened world {} (seed {}, view distance {})",
            dir.display(),
            config.world.seed,
            config.world.view_distance
        );

        Ok(Self {
            ticker: WorldTicker::new(config.clocks.clone()),
            pool: WorkerPool::current()?,
            gravity: Arc::new(GravityStepper::new()),
            bus: event_bus::channel(),
            containers: Arc::new(ContainerRegistry::new()),
            config,
            world,
            lock,
            metrics,
        })
    }

    /// Start the world clocks.
    pub fn start(&self) -> Result<()> {
        let streamer = ChunkStreamer::new(Arc::clone(&self.world), self.pool.clone(), MAX_LOADS_IN_FLIGHT);
        let simulation = Simulation::new(
            Arc::clone(&self.world),
            streamer,
            Arc::clone(&self.gravity),
            self.bus.clone(),
            Arc::clone(&self.metrics),
        );
        self.ticker
            .start(Arc::new(simulation))
            .context("starting world clocks")
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn world_dir(&self) -> &Path {
        &self.config.world_dir
    }

    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    pub fn ticker(&self) -> &WorldTicker {
        &self.ticker
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn gravity(&self) -> &Arc<GravityStepper> {
        &self.gravity
    }

    pub fn bus(&self) -> &broadcast::Sender<WorldChangeBatch> {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn containers(&self) -> &Arc<ContainerRegistry> {
        &self.containers
    }

    /// Flush dirty chunks. If the lock was lost meanwhile, persistence is
    /// switched off instead and nothing is written.
    pub fn save(&self) -> Result<usize> {
        if !self.lock.can_write(self.world_dir()) {
            tracing::error!(
                "Lost the lock on {}; disabling saves",
                self.world_dir().display()
            );
            self.world.set_persistence(false);
            return Ok(0);
        }
        self.world.save_all().context("saving world")
    }

    /// Periodic save task, if autosave is configured.
    pub fn spawn_autosave(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let every = self.config.autosave?;
        let host = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await; // first tick is immediate, skip it
            loop {
                interval.tick().await;
                let task_host = Arc::clone(&host);
                match tokio::task::spawn_blocking(move || task_host.save()).await {
                    Ok(Ok(n)) => tracing::info!("Autosave complete: {} chunks", n),
                    Ok(Err(e)) => tracing::error!("Autosave failed: {:#}", e),
                    Err(e) => tracing::error!("Autosave task failed: {}", e),
                }
            }
        }))
    }

    /// Log a metrics snapshot as JSON once a minute.
    pub fn spawn_metrics_log(self: &Arc<Self>) -> JoinHandle<()> {
        let host = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let snapshot = host.metrics.snapshot(host.world.chunk_count() as u64);
                match serde_json::to_string(&snapshot) {
                    Ok(json) => tracing::info!(
                        "Metrics (mean tick {:?}): {}",
                        snapshot.mean_tick(),
                        json
                    ),
                    Err(e) => tracing::warn!("Could not encode metrics: {}", e),
                }
            }
        })
    }

    /// Stop the clocks, save and drop every chunk, release the lock.
    /// Blocks; call from a blocking context.
    pub fn shutdown(&self) -> Result<usize> {
        match self.ticker.stop() {
            Ok(()) | Err(TickerError::NotStarted | TickerError::Stopped) => {}
            Err(e) => tracing::warn!("Stopping world clocks: {}", e),
        }
        let saved = self.world.shutdown().context("saving world on shutdown");
        self.lock.release(self.world_dir())?;
        let saved = saved?;
        tracing::info!("Shutdown save complete: {} chunks written", saved);
        Ok(saved)
    }
}

impl Drop for WorldHost {
    fn drop(&mut self) {
        // Clock threads hold the world; do not leave them running.
        let _ = self.ticker.stop();
    }
}
