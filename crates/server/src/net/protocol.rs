//! Wire protocol: length-prefixed JSON frames.
//!
//! Each frame is a big-endian `u32` byte length followed by one JSON-encoded
//! message. Replies are correlated to requests by key (chunk coordinate or
//! container owner), never by a request id, so a duplicate or late reply is
//! harmless.

use anyhow::{Context, Result, bail};
use sandbox_engine::world::block::{Block, BlockId};
use sandbox_engine::world::chunk::{CHUNK_AREA, ChunkContent};
use sandbox_engine::world::position::{BlockPos, ChunkPos};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::containers::{ContainerContent, ContainerKey};

/// Frames larger than this are refused.
pub const MAX_FRAME_LEN: usize = 4 << 20;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello { name: String },
    MoveViewer { x: i64, y: i64 },
    RequestChunk { x: i32, y: i32 },
    RequestContainer { owner: ContainerKey },
    SetBlock { x: i64, y: i64, block: Block },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        client_id: u64,
        spawn: BlockPos,
        view_distance: u32,
    },
    /// `content: None` means the server has nothing for this chunk.
    ChunkSnapshot {
        x: i32,
        y: i32,
        content: Option<WireChunk>,
    },
    ContainerSnapshot {
        owner: ContainerKey,
        content: Option<ContainerContent>,
    },
    BlockChanged { x: i64, y: i64, block: Block },
    Error { message: String },
}

impl ServerMessage {
    pub fn chunk(pos: ChunkPos, content: Option<&ChunkContent>) -> Self {
        Self::ChunkSnapshot {
            x: pos.x,
            y: pos.y,
            content: content.map(WireChunk::from_content),
        }
    }
}

/// Chunk content on the wire: material ids row-major, plus sparse metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireChunk {
    pub ids: Vec<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<(u16, u16)>,
}

impl WireChunk {
    pub fn from_content(content: &ChunkContent) -> Self {
        let mut meta = Vec::new();
        let ids = content
            .blocks()
            .iter()
            .enumerate()
            .map(|(i, b)| {
                if let Some(m) = b.meta {
                    meta.push((i as u16, m));
                }
                b.id.0
            })
            .collect();
        Self { ids, meta }
    }

    /// `None` when the cell count or a metadata index is off.
    pub fn into_content(self) -> Option<ChunkContent> {
        if self.ids.len() != CHUNK_AREA {
            return None;
        }
        let mut cells: Vec<Block> = self.ids.into_iter().map(|id| Block::new(BlockId(id))).collect();
        for (index, value) in self.meta {
            cells.get_mut(index as usize)?.meta = Some(value);
        }
        ChunkContent::from_blocks(cells)
    }
}

/// Write one message as a frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).context("encoding frame")?;
    if body.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit", body.len());
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        bail!("peer announced a {len} byte frame");
    }
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await.context("truncated frame")?;
    let message = serde_json::from_slice(&body).context("decoding frame")?;
    Ok(Some(message))
}
