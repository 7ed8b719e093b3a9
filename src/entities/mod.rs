//! Entities module - media types owned by the registries
//!
//! - `ImageEntry`: decoded still image
//! - `PlayerEntry`: opened audio/video file with its decoder session
//! - `FrameBuffer`: RGBA pixels shared with a decoder thread
//! - `DecoderBackend` / `MediaSession`: seam to the native decoder (FFmpeg)

#[cfg(feature = "audio")]
pub mod audio_out;
pub mod error;
pub mod frame;
pub mod image;
pub mod loader;
pub mod loader_video;
pub mod playback;
pub mod player;

pub use error::MediaError;
pub use frame::{FrameBuffer, FrameGuard};
pub use image::ImageEntry;
pub use loader::{DecodedImage, Loader};
pub use loader_video::{FfmpegBackend, MediaProbe};
pub use playback::FfmpegSession;
pub use player::{DecoderBackend, MediaInfo, MediaSession, PlayState, PlayerEntry};
