//! Thin client: mirrors the chunks and containers around one viewer.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use sandbox_engine::world::block::Block;
use sandbox_engine::world::position::{BlockPos, ChunkPos};
use sandbox_engine::world::view::ViewRegion;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{ClientMessage, ServerMessage, read_frame, write_frame};
use crate::remote::{ContainerSyncCache, Fetch, RemoteChunkLoader};

pub struct RemoteClient {
    client_id: u64,
    spawn: BlockPos,
    view_distance: u32,
    position: Mutex<BlockPos>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    chunks: Arc<RemoteChunkLoader>,
    containers: Arc<ContainerSyncCache>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RemoteClient {
    /// Connect, greet, and wait for the server's welcome.
    pub async fn connect(addr: SocketAddr, name: &str, view_distance: u32) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {}", addr))?;
        stream.set_nodelay(true)?;
        let (mut read, mut write) = stream.into_split();

        write_frame(&mut write, &ClientMessage::Hello { name: name.to_string() }).await?;
        let (client_id, spawn, server_distance) = match read_frame(&mut read).await? {
            Some(ServerMessage::Welcome {
                client_id,
                spawn,
                view_distance,
            }) => (client_id, spawn, view_distance),
            Some(ServerMessage::Error { message }) => bail!("server refused us: {}", message),
            Some(other) => bail!("expected welcome, got {:?}", other),
            None => bail!("server closed the connection during the handshake"),
        };
        // Never mirror more than the server keeps loaded for us.
        let view_distance = view_distance.min(server_distance);
        tracing::info!(
            "Connected to {} as client {} (spawn {:?}, view distance {})",
            addr,
            client_id,
            spawn,
            view_distance
        );

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write_frame(&mut write, &message).await {
                    tracing::warn!("Lost connection while sending: {:#}", e);
                    break;
                }
            }
        });

        let chunks = Arc::new(RemoteChunkLoader::new(tx.clone()));
        let containers = Arc::new(ContainerSyncCache::new(tx.clone()));
        let reader = {
            let chunks = Arc::clone(&chunks);
            let containers = Arc::clone(&containers);
            tokio::spawn(async move {
                loop {
                    match read_frame::<_, ServerMessage>(&mut read).await {
                        Ok(Some(message)) => dispatch(message, &chunks, &containers),
                        Ok(None) => {
                            tracing::info!("Server closed the connection");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Lost connection: {:#}", e);
                            break;
                        }
                    }
                }
            })
        };

        Ok(Self {
            client_id,
            spawn,
            view_distance,
            position: Mutex::new(spawn),
            outbound: tx,
            chunks,
            containers,
            reader,
            writer,
        })
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn spawn(&self) -> BlockPos {
        self.spawn
    }

    pub fn view_distance(&self) -> u32 {
        self.view_distance
    }

    pub fn chunks(&self) -> &Arc<RemoteChunkLoader> {
        &self.chunks
    }

    pub fn containers(&self) -> &Arc<ContainerSyncCache> {
        &self.containers
    }

    pub fn is_connected(&self) -> bool {
        !self.reader.is_finished() && !self.writer.is_finished()
    }

    pub fn position(&self) -> BlockPos {
        *self.position.lock().expect("client position poisoned")
    }

    /// The chunks this client mirrors.
    pub fn view(&self) -> ViewRegion {
        ViewRegion::around(self.position().chunk(), self.view_distance)
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| anyhow::anyhow!("connection closed"))
    }

    /// Move the viewer and drop mirrored chunks that fell out of view.
    pub fn move_to(&self, pos: BlockPos) -> Result<()> {
        *self.position.lock().expect("client position poisoned") = pos;
        self.send(ClientMessage::MoveViewer { x: pos.x, y: pos.y })?;
        let dropped = self.chunks.retain(&self.view());
        if dropped > 0 {
            tracing::debug!("Dropped {} chunks out of view", dropped);
        }
        Ok(())
    }

    /// Request every chunk in view that is not mirrored or already asked
    /// for. Returns how many are still missing.
    pub fn sync_view(&self) -> usize {
        self.view()
            .positions_nearest_first()
            .into_iter()
            .filter(|&pos| !matches!(self.chunks.fetch(pos), Fetch::Ready(_)))
            .count()
    }

    pub fn set_block(&self, pos: BlockPos, block: Block) -> Result<()> {
        // Optimistic local write; the server does not echo our own edits.
        self.chunks.apply_block_change(pos, block);
        self.send(ClientMessage::SetBlock {
            x: pos.x,
            y: pos.y,
            block,
        })
    }

    pub fn get_block(&self, pos: BlockPos) -> Option<Block> {
        self.chunks.get(pos.chunk()).map(|c| c.get_block(pos.local()))
    }

    pub fn mirrored(&self, pos: ChunkPos) -> bool {
        self.chunks.get(pos).is_some()
    }
}

impl Drop for RemoteClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn dispatch(message: ServerMessage, chunks: &RemoteChunkLoader, containers: &ContainerSyncCache) {
    match message {
        ServerMessage::ChunkSnapshot { x, y, content } => {
            let pos = ChunkPos::new(x, y);
            match content {
                None => {
                    chunks.handle_snapshot(pos, None);
                }
                Some(wire) => match wire.into_content() {
                    Some(content) => {
                        chunks.handle_snapshot(pos, Some(content));
                    }
                    // Left pending; the request expires and is retried.
                    None => tracing::warn!("Server sent a malformed chunk {}", pos),
                },
            }
        }
        ServerMessage::ContainerSnapshot { owner, content } => {
            containers.handle_snapshot(&owner, content);
        }
        ServerMessage::BlockChanged { x, y, block } => {
            chunks.apply_block_change(BlockPos::new(x, y), block);
        }
        ServerMessage::Error { message } => tracing::warn!("Server error: {}", message),
        ServerMessage::Welcome { .. } => tracing::warn!("Unexpected second welcome"),
    }
}
