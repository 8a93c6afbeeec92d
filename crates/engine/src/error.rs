//! Engine error types.
//!
//! The engine reports typed errors so callers can tell a corrupt snapshot
//! apart from an I/O hiccup; the server wraps them in `anyhow` at its edges.

use std::fmt;

use crate::ticker::TickerState;
use crate::world::position::ChunkPos;

/// Failure to load or persist a chunk.
#[derive(Debug)]
pub enum ChunkError {
    /// A persisted snapshot exists but violates the format. Never treated as
    /// an empty chunk: an all-air chunk is legitimate content.
    Corrupt { pos: ChunkPos, reason: String },
    /// The storage backend failed.
    Io { pos: ChunkPos, source: std::io::Error },
}

impl ChunkError {
    pub fn corrupt(pos: ChunkPos, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            pos,
            reason: reason.into(),
        }
    }

    pub fn pos(&self) -> ChunkPos {
        match self {
            Self::Corrupt { pos, .. } | Self::Io { pos, .. } => *pos,
        }
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, Self::Corrupt { .. })
    }
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupt { pos, reason } => write!(f, "corrupt chunk at {pos}: {reason}"),
            Self::Io { pos, source } => write!(f, "storage error for chunk {pos}: {source}"),
        }
    }
}

impl std::error::Error for ChunkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Corrupt { .. } => None,
        }
    }
}

/// A ticker was driven through an illegal transition. These are contract
/// violations by the owner, not runtime conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickerError {
    AlreadyStarted,
    NotStarted,
    Stopped,
    InvalidState(TickerState),
}

impl fmt::Display for TickerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyStarted => f.write_str("ticker already started"),
            Self::NotStarted => f.write_str("ticker was never started"),
            Self::Stopped => f.write_str("ticker is stopped"),
            Self::InvalidState(state) => write!(f, "operation not valid while {state:?}"),
        }
    }
}

impl std::error::Error for TickerError {}
