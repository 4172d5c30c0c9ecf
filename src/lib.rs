pub mod app;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod connector;
pub mod lifecycle;
pub mod logger;
pub mod persistence;
pub mod state;
pub mod tenant;
pub mod version;

/// Version of these binaries, compared against the persisted schema and the peers.
pub const BINARY_VERSION: &str = env!("CARGO_PKG_VERSION");
