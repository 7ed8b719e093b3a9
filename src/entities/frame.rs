//! RGBA frame buffer shared between a player entry and its decoder thread
//!
//! **Why**: The decoder writes frames asynchronously while the dispatcher
//! reads them when answering `frame`. The buffer is allocated once per
//! player and never resized, so the decoder can keep writing into the same
//! memory for the whole life of the entry.
//!
//! **Used by**: PlayerEntry (owner), FFmpeg playback thread (writer),
//! dispatcher (reader via `snapshot()`)
//!
//! # Lock / unlock
//!
//! `lock()` hands the writer a guard over the pixels. Dropping the guard is
//! the "unlock": it bumps `updated` so `check` can report a new frame.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Fixed-size RGBA8 buffer (`width * height * 4` bytes) plus a frame counter
#[derive(Debug)]
pub struct FrameBuffer {
    width: usize,
    height: usize,
    pixels: Mutex<Box<[u8]>>,
    updated: AtomicU64,
}

impl FrameBuffer {
    /// Allocate a zeroed buffer. Callers only create these for positive sizes.
    pub fn new(width: usize, height: usize) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            pixels: Mutex::new(vec![0u8; width * height * 4].into_boxed_slice()),
            updated: AtomicU64::new(0),
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Row pitch in bytes
    pub fn pitch(&self) -> usize {
        self.width * 4
    }

    pub fn len(&self) -> usize {
        self.width * self.height * 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of frames written so far
    pub fn updated(&self) -> u64 {
        self.updated.load(Ordering::Acquire)
    }

    /// Begin writing a frame; the counter advances when the guard drops
    pub fn lock(&self) -> FrameGuard<'_> {
        FrameGuard {
            pixels: self.pixels.lock().unwrap_or_else(|e| e.into_inner()),
            updated: &self.updated,
        }
    }

    /// Copy of the current pixels
    pub fn snapshot(&self) -> Vec<u8> {
        self.pixels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .to_vec()
    }
}

/// Write access to the pixels. Derefs to a slice, so the length can't change.
pub struct FrameGuard<'a> {
    pixels: MutexGuard<'a, Box<[u8]>>,
    updated: &'a AtomicU64,
}

impl Deref for FrameGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.pixels
    }
}

impl DerefMut for FrameGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        self.updated.fetch_add(1, Ordering::AcqRel);
    }
}
