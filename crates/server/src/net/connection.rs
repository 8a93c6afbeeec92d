//! Per-client session.
//!
//! Hello -> Welcome, then requests until the client hangs up. Frames are
//! read on their own task and handed over a channel so the session loop can
//! `select!` between client requests and world changes without cancelling a
//! half-read frame. Replies go through an unbounded channel to a writer task.

use std::sync::Arc;

use anyhow::{Result, bail};
use sandbox_engine::world::block::Block;
use sandbox_engine::world::position::{BlockPos, ChunkPos};
use sandbox_engine::world::view::{ViewerId, ViewerKind};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};

use super::protocol::{ClientMessage, ServerMessage, read_frame, write_frame};
use crate::block;
use crate::containers::ContainerKey;
use crate::event_bus::{self, ChangeSource, WorldChangeBatch};
use crate::host::WorldHost;

/// Serve one client over `stream` until it disconnects.
pub async fn handle<S>(stream: S, host: Arc<WorldHost>, client_id: u64) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut read, mut write) = tokio::io::split(stream);

    let name = match read_frame::<_, ClientMessage>(&mut read).await? {
        Some(ClientMessage::Hello { name }) => name,
        Some(other) => {
            write_frame(
                &mut write,
                &ServerMessage::Error {
                    message: "expected hello".into(),
                },
            )
            .await?;
            bail!("client {} opened with {:?}", client_id, other);
        }
        None => return Ok(()),
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            write_frame(&mut write, &message).await?;
        }
        anyhow::Ok(())
    });

    let (in_tx, in_rx) = mpsc::channel::<ClientMessage>(64);
    let reader = tokio::spawn(async move {
        loop {
            match read_frame::<_, ClientMessage>(&mut read).await {
                Ok(Some(message)) => {
                    if in_tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Client {} sent a bad frame: {:#}", client_id, e);
                    break;
                }
            }
        }
    });

    let world = Arc::clone(host.world());
    let spawn = world.config().spawn;
    let viewer = world.add_viewer(ViewerKind::Player(name.clone()), spawn);
    host.containers().ensure_player(&name);
    host.metrics().client_joined();
    tracing::info!("{} joined as client {}", name, client_id);

    let _ = out_tx.send(ServerMessage::Welcome {
        client_id,
        spawn,
        view_distance: world.view_distance(),
    });

    let session = Session {
        host: Arc::clone(&host),
        client_id,
        viewer,
        out: out_tx,
    };
    let result = session.run(in_rx, host.bus().subscribe()).await;

    world.remove_viewer(viewer);
    host.metrics().client_left();
    tracing::info!("{} (client {}) left", name, client_id);

    reader.abort();
    // The session owned the last sender; the writer drains and exits.
    match writer.await {
        Ok(Err(e)) => tracing::debug!("Client {} writer: {}", client_id, e),
        Err(e) if !e.is_cancelled() => tracing::warn!("Client {} writer task failed: {}", client_id, e),
        _ => {}
    }
    result
}

struct Session {
    host: Arc<WorldHost>,
    client_id: u64,
    viewer: ViewerId,
    out: mpsc::UnboundedSender<ServerMessage>,
}

impl Session {
    async fn run(
        self,
        mut requests: mpsc::Receiver<ClientMessage>,
        mut changes: broadcast::Receiver<WorldChangeBatch>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else {
                        return Ok(());
                    };
                    self.handle_request(request);
                }
                batch = changes.recv() => {
                    match batch {
                        Ok(batch) => self.forward_changes(&batch),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Client {} missed {} change batches", self.client_id, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
            if self.out.is_closed() {
                return Ok(());
            }
        }
    }

    fn send(&self, message: ServerMessage) {
        let _ = self.out.send(message);
    }

    fn error(&self, message: impl Into<String>) {
        self.send(ServerMessage::Error {
            message: message.into(),
        });
    }

    fn handle_request(&self, request: ClientMessage) {
        match request {
            ClientMessage::Hello { .. } => self.error("already greeted"),
            ClientMessage::MoveViewer { x, y } => {
                if self.host.world().move_viewer(self.viewer, BlockPos::new(x, y)) {
                    tracing::debug!("Client {} entered chunk {}", self.client_id, BlockPos::new(x, y).chunk());
                }
            }
            ClientMessage::RequestChunk { x, y } => self.request_chunk(ChunkPos::new(x, y)),
            ClientMessage::RequestContainer { owner } => self.request_container(owner),
            ClientMessage::SetBlock { x, y, block } => self.set_block(BlockPos::new(x, y), block),
        }
    }

    /// Resident chunks are answered inline; the rest load on the worker
    /// pool and answer when done.
    fn request_chunk(&self, pos: ChunkPos) {
        let world = Arc::clone(self.host.world());
        self.host.metrics().request_served();
        if let Some(chunk) = world.get_chunk(pos) {
            self.send(ServerMessage::chunk(pos, Some(&*chunk.content())));
            return;
        }

        let out = self.out.clone();
        let client_id = self.client_id;
        let job = self.host.pool().submit(move || world.ensure_loaded(pos));
        tokio::spawn(async move {
            let reply = match job.await {
                Ok(Ok(chunk)) => ServerMessage::chunk(pos, Some(&*chunk.content())),
                Ok(Err(e)) if e.is_corrupt() => {
                    tracing::warn!("Client {} asked for {}", client_id, e);
                    ServerMessage::chunk(pos, None)
                }
                Ok(Err(e)) => ServerMessage::Error {
                    message: e.to_string(),
                },
                Err(_) => return,
            };
            let _ = out.send(reply);
        });
    }

    fn request_container(&self, owner: ContainerKey) {
        self.host.metrics().request_served();
        let content = self.host.containers().get(&owner);
        self.send(ServerMessage::ContainerSnapshot { owner, content });
    }

    fn set_block(&self, pos: BlockPos, new: Block) {
        if !block::is_known(new.id) {
            return self.error(format!("unknown block id {}", new.id.0));
        }
        let outcome = {
            let blocks = self.host.world().blocks();
            match blocks.get(pos) {
                None => Err(format!("chunk {} is not loaded", pos.chunk())),
                Some(old) if block::is_unbreakable(old.id) => {
                    Err(format!("{} cannot be replaced", block::name(old.id)))
                }
                Some(old) if old == new => Ok(false),
                Some(_) => Ok(blocks.set(pos, new).is_some()),
            }
        };
        match outcome {
            Err(message) => return self.error(message),
            Ok(false) => return,
            Ok(true) => {}
        }
        self.host.gravity().notify(pos);
        event_bus::publish(
            self.host.bus(),
            WorldChangeBatch::new(ChangeSource::Client(self.client_id), vec![(pos, new)]),
        );
    }

    /// Forward changes from other sources that land inside our view.
    fn forward_changes(&self, batch: &WorldChangeBatch) {
        if batch.source == ChangeSource::Client(self.client_id) {
            return;
        }
        let Some(region) = self.host.world().viewer_region(self.viewer) else {
            return;
        };
        for &(pos, block) in batch.changes.iter() {
            if region.contains(pos.chunk()) {
                self.send(ServerMessage::BlockChanged {
                    x: pos.x,
                    y: pos.y,
                    block,
                });
            }
        }
    }
}
