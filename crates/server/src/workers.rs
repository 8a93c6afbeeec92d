//! Blocking work off the simulation thread.
//!
//! Chunk loads touch the disk and run the generator, so they go through
//! tokio's blocking pool. [`WorkerPool::submit`] is the one way to hand work
//! over; callers that care about the result await the returned receiver,
//! callers that do not just drop it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashSet;
use sandbox_engine::world::World;
use sandbox_engine::world::position::ChunkPos;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

#[derive(Clone)]
pub struct WorkerPool {
    handle: Handle,
    queued: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pool on the runtime the caller is running in.
    pub fn current() -> anyhow::Result<Self> {
        Ok(Self::new(Handle::try_current()?))
    }

    /// Run `job` on the blocking pool. Callable from any thread.
    pub fn submit<T, F>(&self, job: F) -> oneshot::Receiver<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let queued = Arc::clone(&self.queued);
        queued.fetch_add(1, Ordering::Relaxed);
        self.handle.spawn_blocking(move || {
            let out = job();
            queued.fetch_sub(1, Ordering::Relaxed);
            // Receiver may have been dropped; that is fine.
            let _ = tx.send(out);
        });
        rx
    }

    /// Jobs submitted and not yet finished.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }
}

/// Keeps viewed chunks resident by queueing loads for missing coordinates.
///
/// A coordinate is submitted at most once while its job is queued. Corrupt
/// coordinates are remembered and never retried; I/O failures are retried
/// the next time the coordinate is streamed.
pub struct ChunkStreamer {
    world: Arc<World>,
    pool: WorkerPool,
    queued: Arc<DashSet<ChunkPos>>,
    corrupt: Arc<DashSet<ChunkPos>>,
    max_in_flight: usize,
}

impl ChunkStreamer {
    pub fn new(world: Arc<World>, pool: WorkerPool, max_in_flight: usize) -> Self {
        Self {
            world,
            pool,
            queued: Arc::new(DashSet::new()),
            corrupt: Arc::new(DashSet::new()),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Submit loads for `positions` (nearest first) up to the in-flight cap.
    /// Returns how many new jobs went out.
    pub fn stream(&self, positions: impl IntoIterator<Item = ChunkPos>) -> usize {
        let mut submitted = 0;
        for pos in positions {
            if self.queued.len() >= self.max_in_flight {
                break;
            }
            if self.corrupt.contains(&pos) || !self.queued.insert(pos) {
                continue;
            }
            let world = Arc::clone(&self.world);
            let queued = Arc::clone(&self.queued);
            let corrupt = Arc::clone(&self.corrupt);
            drop(self.pool.submit(move || {
                if let Err(e) = world.ensure_loaded(pos) {
                    if e.is_corrupt() {
                        tracing::error!("{}; leaving chunk unloaded", e);
                        corrupt.insert(pos);
                    } else {
                        tracing::warn!("Chunk {} failed to load: {}", pos, e);
                    }
                }
                queued.remove(&pos);
            }));
            submitted += 1;
        }
        submitted
    }

    /// Stream whatever the world's viewers are missing.
    pub fn stream_missing(&self) -> usize {
        self.stream(self.world.missing_chunks())
    }

    pub fn in_flight(&self) -> usize {
        self.queued.len()
    }

    pub fn is_corrupt(&self, pos: ChunkPos) -> bool {
        self.corrupt.contains(&pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use sandbox_engine::world::WorldConfig;
    use sandbox_engine::world::chunk::ChunkContent;
    use sandbox_engine::world::storage::{BiomeId, ChunkGenerator, MemoryStorage, NoopListener};

    struct SlowGenerator;

    impl ChunkGenerator for SlowGenerator {
        fn generate(&self, _seed: u64, _pos: ChunkPos) -> ChunkContent {
            std::thread::sleep(Duration::from_millis(100));
            ChunkContent::new_empty()
        }

        fn height(&self, _seed: u64, _world_x: i64) -> i64 {
            0
        }

        fn biome(&self, _seed: u64, _world_x: i64) -> BiomeId {
            BiomeId::default()
        }
    }

    fn world() -> Arc<World> {
        Arc::new(World::new(
            WorldConfig {
                view_distance: 1,
                ..WorldConfig::default()
            },
            Arc::new(SlowGenerator),
            Arc::new(MemoryStorage::new()),
            Arc::new(NoopListener),
        ))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn submit_returns_the_result() {
        let pool = WorkerPool::current().unwrap();
        let rx = pool.submit(|| 6 * 7);
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_coordinates_are_not_resubmitted() {
        let world = world();
        let streamer = ChunkStreamer::new(Arc::clone(&world), WorkerPool::current().unwrap(), 64);

        // No viewers: the spawn region (3×3 at distance 1) is what is missing.
        assert_eq!(streamer.stream_missing(), 9);
        assert_eq!(streamer.stream_missing(), 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while world.chunk_count() < 9 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(world.chunk_count(), 9);
        assert!(world.missing_chunks().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_flight_cap_is_respected() {
        let world = world();
        let streamer = ChunkStreamer::new(world, WorkerPool::current().unwrap(), 2);
        let positions = (0..10).map(|x| ChunkPos::new(x, 40));
        assert_eq!(streamer.stream(positions), 2);
        assert!(streamer.in_flight() <= 2);
    }
}
