//! Game-agnostic tile world core.
//!
//! - [`world`]: chunks, the chunk store and loader, viewer regions and the
//!   [`world::World`] aggregate that ties them together.
//! - [`ticker`]: the multi-rate world clocks.
//! - [`error`]: typed failures surfaced to the embedding server.

pub mod error;
pub mod ticker;
pub mod world;
