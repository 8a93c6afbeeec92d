//! The world's clock callbacks.
//!
//! [`Simulation`] is what the [`WorldTicker`](sandbox_engine::ticker::WorldTicker)
//! drives. The main tick runs eviction and per-chunk updates, then queues
//! loads for whatever viewers are missing; the physics step settles falling
//! blocks and publishes the result to the event bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use sandbox_engine::ticker::TickHandler;
use sandbox_engine::world::World;
use sandbox_engine::world::chunk::SharedChunk;
use sandbox_engine::world::position::ChunkPos;
use sandbox_engine::world::storage::{ChunkListener, LoadOrigin};
use tokio::sync::broadcast;

use crate::event_bus::{self, ChangeSource, WorldChangeBatch};
use crate::metrics::Metrics;
use crate::physics::GravityStepper;
use crate::workers::ChunkStreamer;

/// Chunk loads queued per main tick at most.
pub const MAX_LOADS_IN_FLIGHT: usize = 16;

pub struct Simulation {
    world: Arc<World>,
    streamer: ChunkStreamer,
    gravity: Arc<GravityStepper>,
    bus: broadcast::Sender<WorldChangeBatch>,
    metrics: Arc<Metrics>,
    budget: Duration,
}

impl Simulation {
    pub fn new(
        world: Arc<World>,
        streamer: ChunkStreamer,
        gravity: Arc<GravityStepper>,
        bus: broadcast::Sender<WorldChangeBatch>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let budget = Duration::from_secs(1) / world.config().ticks_per_second.max(1);
        Self {
            world,
            streamer,
            gravity,
            bus,
            metrics,
            budget,
        }
    }
}

impl TickHandler for Simulation {
    fn tick_main(&self, tick: u64) {
        let started = Instant::now();

        let report = self.world.tick_main(tick);
        if report.evicted > 0 {
            self.metrics.chunks_evicted(report.evicted as u64);
            tracing::debug!("Tick {}: evicted {} chunks", tick, report.evicted);
        }
        if report.save_failures > 0 {
            tracing::warn!(
                "Tick {}: {} chunks kept resident after failed saves",
                tick,
                report.save_failures
            );
        }
        self.streamer.stream_missing();

        self.metrics.record_tick(started.elapsed(), self.budget);
    }

    fn tick_rare(&self, tick: u64, elapsed: Duration) {
        self.world.tick_rare(elapsed.as_secs_f64());
        tracing::trace!(
            "Rare tick {}: time of day {:.0}s",
            tick,
            self.world.time_of_day()
        );
    }

    fn step_physics(&self, _dt: Duration) {
        let changes = self.gravity.step(&self.world);
        if changes.is_empty() {
            return;
        }
        tracing::trace!("Gravity moved {} cells", changes.len());
        event_bus::publish(
            &self.bus,
            WorldChangeBatch::new(ChangeSource::Simulation("gravity"), changes),
        );
    }

    fn pump_render(&self, tick: u64) {
        tracing::debug!(
            "Tick {}: {} chunks resident, {} loads queued, time of day {:.0}s",
            tick,
            self.world.chunk_count(),
            self.streamer.in_flight(),
            self.world.time_of_day()
        );
    }
}

/// Feeds chunk lifecycle events into [`Metrics`].
pub struct MetricsListener {
    metrics: Arc<Metrics>,
}

impl MetricsListener {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl ChunkListener for MetricsListener {
    fn chunk_loaded(&self, chunk: &SharedChunk, origin: LoadOrigin) {
        self.metrics.chunk_loaded(origin == LoadOrigin::Generated);
        tracing::trace!("Chunk {} loaded ({:?})", chunk.pos(), origin);
    }

    fn chunk_unloaded(&self, pos: ChunkPos) {
        tracing::trace!("Chunk {} unloaded", pos);
    }
}
