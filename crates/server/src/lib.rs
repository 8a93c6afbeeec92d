//! Runtime around the sandbox engine: on-disk persistence, the world lock,
//! the simulation clocks' callbacks, the wire protocol with its server and
//! thin client, and the client-side request caches.

pub mod block;
pub mod config;
pub mod containers;
pub mod event_bus;
pub mod host;
pub mod metrics;
pub mod net;
pub mod persistence;
pub mod physics;
pub mod remote;
pub mod simulation;
pub mod workers;
pub mod world_lock;
pub mod worldgen;
