//! Client-side mirrors of server-owned state.

pub mod chunk_mirror;
pub mod container_cache;
pub mod request_cache;

pub use chunk_mirror::RemoteChunkLoader;
pub use container_cache::ContainerSyncCache;
pub use request_cache::{Fetch, Pending, RequestCache, WaitOutcome};
