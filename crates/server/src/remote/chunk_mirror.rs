use std::sync::Arc;

use sandbox_engine::world::block::Block;
use sandbox_engine::world::chunk::{Chunk, ChunkContent, SharedChunk};
use sandbox_engine::world::position::{BlockPos, ChunkPos};
use sandbox_engine::world::store::ChunkStore;
use sandbox_engine::world::view::ViewRegion;
use tokio::sync::mpsc;

use super::request_cache::{DEFAULT_TIMEOUT, Fetch, RequestCache, WaitOutcome};
use crate::net::protocol::ClientMessage;

/// Client-side chunk loader backed by the server.
///
/// Mirrored chunks live in a local [`ChunkStore`]; misses go out as
/// `RequestChunk` messages, de-duplicated per coordinate.
pub struct RemoteChunkLoader {
    store: ChunkStore,
    requests: RequestCache<ChunkPos, SharedChunk>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
}

impl RemoteChunkLoader {
    pub fn new(outbound: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self::with_timeout(outbound, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(outbound: mpsc::UnboundedSender<ClientMessage>, timeout: std::time::Duration) -> Self {
        Self {
            store: ChunkStore::new(),
            requests: RequestCache::new(timeout),
            outbound,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn get(&self, pos: ChunkPos) -> Option<SharedChunk> {
        self.store.get(pos)
    }

    /// Mirrored chunk if present, otherwise the (possibly already
    /// outstanding) request for it.
    pub fn fetch(&self, pos: ChunkPos) -> Fetch<SharedChunk> {
        if let Some(chunk) = self.store.get(pos) {
            return Fetch::Ready(Some(chunk));
        }
        self.requests.fetch_with(&pos, |pos| {
            let request = ClientMessage::RequestChunk { x: pos.x, y: pos.y };
            if self.outbound.send(request).is_err() {
                tracing::warn!("Connection closed, chunk {} request dropped", pos);
            }
        })
    }

    /// Fetch and wait for the reply within the request window.
    pub async fn load(&self, pos: ChunkPos) -> WaitOutcome<SharedChunk> {
        match self.fetch(pos) {
            Fetch::Ready(value) => WaitOutcome::Resolved(value),
            Fetch::Pending(pending) => pending.wait().await,
        }
    }

    /// Apply a `ChunkSnapshot` reply. Returns `false` for a reply nobody is
    /// waiting on; its content is discarded.
    pub fn handle_snapshot(&self, pos: ChunkPos, content: Option<ChunkContent>) -> bool {
        let matched = self.requests.complete_with(&pos, || {
            content.map(|content| {
                let chunk = Chunk::shared(pos, content);
                chunk.mark_decorated();
                self.store.insert(Arc::clone(&chunk));
                chunk
            })
        });
        if !matched {
            tracing::debug!("Ignoring unrequested snapshot for chunk {}", pos);
        }
        matched
    }

    /// Apply a pushed block change. Changes to chunks we do not mirror are
    /// dropped.
    pub fn apply_block_change(&self, pos: BlockPos, block: Block) -> bool {
        match self.store.get(pos.chunk()) {
            Some(chunk) => {
                chunk.set_block(pos.local(), block);
                true
            }
            None => false,
        }
    }

    /// Drop mirrored chunks outside `region`. Returns how many went.
    pub fn retain(&self, region: &ViewRegion) -> usize {
        let outside: Vec<ChunkPos> = self
            .store
            .positions()
            .into_iter()
            .filter(|pos| !region.contains(*pos))
            .collect();
        for pos in &outside {
            self.store.remove(*pos);
            self.requests.invalidate(pos);
        }
        self.requests.purge_expired();
        outside.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn pending(&self, pos: ChunkPos) -> bool {
        self.requests.is_pending(&pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_engine::world::block::BlockId;
    use sandbox_engine::world::position::LocalBlockPos;
    use std::time::Duration;

    fn loader(timeout: Duration) -> (RemoteChunkLoader, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RemoteChunkLoader::with_timeout(tx, timeout), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn one_request_per_coordinate_until_expiry() {
        let (remote, mut rx) = loader(Duration::from_millis(30));
        let pos = ChunkPos::new(2, -1);
        for _ in 0..5 {
            assert!(remote.fetch(pos).is_pending());
        }
        assert_eq!(drain(&mut rx), vec![ClientMessage::RequestChunk { x: 2, y: -1 }]);

        std::thread::sleep(Duration::from_millis(40));
        assert!(remote.fetch(pos).is_pending());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn snapshot_lands_in_the_mirror() {
        let (remote, mut rx) = loader(Duration::from_secs(1));
        let pos = ChunkPos::new(0, 0);
        remote.fetch(pos);
        let mut content = ChunkContent::new_empty();
        content.set(LocalBlockPos::new(3, 3), Block::new(BlockId(1)));

        assert!(remote.handle_snapshot(pos, Some(content.clone())));
        assert!(!remote.handle_snapshot(pos, Some(ChunkContent::new_empty())));
        let Fetch::Ready(Some(chunk)) = remote.fetch(pos) else {
            panic!("chunk should be mirrored");
        };
        assert_eq!(chunk.snapshot(), content);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn unrequested_snapshots_are_ignored() {
        let (remote, _rx) = loader(Duration::from_secs(1));
        assert!(!remote.handle_snapshot(ChunkPos::new(9, 9), Some(ChunkContent::new_empty())));
        assert!(remote.is_empty());
    }

    #[test]
    fn empty_reply_is_not_a_timeout() {
        let (remote, mut rx) = loader(Duration::from_secs(1));
        let pos = ChunkPos::new(1, 1);
        remote.fetch(pos);
        assert!(remote.handle_snapshot(pos, None));
        assert!(matches!(remote.fetch(pos), Fetch::Ready(None)));
        assert_eq!(drain(&mut rx).len(), 1);
        assert!(remote.get(pos).is_none());
    }

    #[test]
    fn retain_drops_chunks_outside_the_view() {
        let (remote, mut rx) = loader(Duration::from_secs(1));
        for x in 0..4 {
            let pos = ChunkPos::new(x, 0);
            remote.fetch(pos);
            remote.handle_snapshot(pos, Some(ChunkContent::new_empty()));
        }
        drain(&mut rx);
        let far = remote.get(ChunkPos::new(3, 0)).unwrap();

        let dropped = remote.retain(&ViewRegion::around(ChunkPos::new(0, 0), 1));
        assert_eq!(dropped, 2);
        assert_eq!(remote.len(), 2);
        assert!(!far.is_valid());

        // The dropped coordinate is requested afresh.
        assert!(remote.fetch(ChunkPos::new(3, 0)).is_pending());
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn block_changes_apply_to_mirrored_chunks_only() {
        let (remote, _rx) = loader(Duration::from_secs(1));
        let pos = ChunkPos::new(0, 0);
        remote.fetch(pos);
        remote.handle_snapshot(pos, Some(ChunkContent::new_empty()));

        let stone = Block::new(BlockId(1));
        assert!(remote.apply_block_change(BlockPos::new(5, 6), stone));
        assert!(!remote.apply_block_change(BlockPos::new(500, 6), stone));
        assert_eq!(remote.get(pos).unwrap().get_block(LocalBlockPos::new(5, 6)), stone);
    }

    #[tokio::test]
    async fn load_waits_for_the_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let remote = Arc::new(RemoteChunkLoader::new(tx));
        let server = {
            let remote = Arc::clone(&remote);
            tokio::spawn(async move {
                let Some(ClientMessage::RequestChunk { x, y }) = rx.recv().await else {
                    panic!("expected a chunk request");
                };
                remote.handle_snapshot(ChunkPos::new(x, y), Some(ChunkContent::new_empty()))
            })
        };
        let outcome = remote.load(ChunkPos::new(4, 4)).await;
        assert!(matches!(outcome, WaitOutcome::Resolved(Some(_))));
        assert!(server.await.unwrap());
    }
}
