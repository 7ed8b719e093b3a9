//! Skyalt media sidecar library
//!
//! Re-exports all modules for use by the binary target.

// Core engine (wire codec, registries, maintenance, URL cache)
pub mod core;

pub mod cli;
pub mod config;
pub mod entities;
pub mod server;
pub mod utils;

// Re-export commonly used types
pub use core::maintenance::Maintenance;
pub use core::registry::{MediaRegistry, SharedRegistry};
pub use core::url_cache::UrlCache;
pub use entities::{DecoderBackend, FfmpegBackend, MediaError, MediaSession};
pub use server::{Dispatcher, Session};
