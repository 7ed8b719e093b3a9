//! Command-local media errors
//!
//! These never terminate the sidecar: the dispatcher renders them with
//! `Display` into the response `err` array.

use std::fmt;

#[derive(Debug)]
pub enum MediaError {
    /// Audio/video command applied to a non-playable path
    Unsupported(String),
    /// Image open/decode failure
    Image(String),
    /// Media parse failed (no streams, unreadable container, ...)
    Parse(String),
    /// Media parse did not finish before the deadline
    ParseTimeout(String),
    /// Decoder backend refused an operation
    Decoder(String),
    /// Seek issued while paused never became observable
    SeekTimeout,
    /// Remote source could not be fetched
    Download(String),
    Io(std::io::Error),
}

impl fmt::Display for MediaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaError::Unsupported(path) => write!(f, "Unsupported path: {}", path),
            MediaError::Image(e) => write!(f, "Image error: {}", e),
            MediaError::Parse(e) => write!(f, "Media parse failed: {}", e),
            MediaError::ParseTimeout(path) => write!(f, "Media parse timed out: {}", path),
            MediaError::Decoder(e) => write!(f, "Decoder error: {}", e),
            MediaError::SeekTimeout => write!(f, "Seek did not settle"),
            MediaError::Download(e) => write!(f, "Download failed: {}", e),
            MediaError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for MediaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MediaError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MediaError {
    fn from(e: std::io::Error) -> Self {
        MediaError::Io(e)
    }
}

impl From<image::ImageError> for MediaError {
    fn from(e: image::ImageError) -> Self {
        MediaError::Image(e.to_string())
    }
}
