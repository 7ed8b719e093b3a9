//! Core sidecar engine - wire codec, registries, maintenance, URL cache
//!
//! Independent of the socket: the server module drives these per command.

pub mod maintenance;
pub mod registry;
pub mod url_cache;
pub mod wire;

// Re-exports for convenience
pub use maintenance::Maintenance;
pub use registry::{CheckResult, FrameResult, MediaRegistry, PlayerInfo, SharedRegistry};
pub use url_cache::UrlCache;
pub use wire::{WireReader, WireWriter};
