//! Decoded image entry, keyed by path in the registry

use std::path::{Path, PathBuf};

use log::debug;

use super::error::MediaError;
use super::loader::Loader;
use crate::utils::time::{file_mtime_nanos, now_nanos};

/// Decoded still image. Pixels and size never change after creation,
/// only the two time fields do.
#[derive(Debug)]
pub struct ImageEntry {
    path: PathBuf,
    width: usize,
    height: usize,
    rgba: Vec<u8>,
    /// Last time a command touched this entry (ns)
    pub last_use_time: i64,
    /// Source mtime seen at creation (ns), 0 when built from a blob
    pub open_file_time: i64,
    /// Source mtime seen by the latest maintenance pass (ns)
    pub check_file_time: i64,
}

impl ImageEntry {
    /// Decode from `blob` when non-empty, otherwise from the file at `path`
    pub fn open(path: &Path, blob: &[u8]) -> Result<Self, MediaError> {
        let (decoded, open_file_time) = if blob.is_empty() {
            let mtime = file_mtime_nanos(path).unwrap_or(0);
            (Loader::load(path)?, mtime)
        } else {
            (Loader::load_bytes(blob, path)?, 0)
        };

        debug!(
            "Image entry created: {} ({}x{})",
            path.display(),
            decoded.width,
            decoded.height
        );

        Ok(Self {
            path: path.to_path_buf(),
            width: decoded.width,
            height: decoded.height,
            rgba: decoded.rgba,
            last_use_time: now_nanos(),
            open_file_time,
            check_file_time: open_file_time,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }

    /// Whether maintenance should restat the source file
    pub fn has_source_file(&self) -> bool {
        self.open_file_time != 0
    }

    pub fn touch(&mut self) {
        self.last_use_time = now_nanos();
    }
}
