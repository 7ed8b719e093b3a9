//! Audio/video player entry and the decoder backend seam
//!
//! **Why**: The registry must not care which native library decodes media.
//! `DecoderBackend` parses and opens media, `MediaSession` is the transport
//! (play/pause/stop/seek/volume) of one opened file.
//!
//! **Used by**: MediaRegistry (owns entries), FFmpeg backend (implements
//! the traits), tests (fake backend)
//!
//! # Ownership
//!
//! A `PlayerEntry` owns its session and its frame buffer. The session is
//! declared first so it drops first: the decoder thread is stopped before
//! the buffer it writes into can be released.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use super::error::MediaError;
use super::frame::FrameBuffer;
use crate::utils::time::{file_mtime_nanos, now_nanos};

/// Decoder transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Opening,
    Playing,
    Paused,
    Stopped,
    Ended,
    Error,
}

/// Result of a media parse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaInfo {
    /// First video track size; 0x0 for audio-only media
    pub width: usize,
    pub height: usize,
    pub duration_ms: u64,
    pub has_audio: bool,
}

impl MediaInfo {
    pub fn has_video(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// One opened media file
pub trait MediaSession: Send {
    fn state(&self) -> PlayState;

    fn is_playing(&self) -> bool {
        self.state() == PlayState::Playing
    }

    fn play(&mut self) -> Result<(), MediaError>;
    fn pause(&mut self);
    /// Stop and rewind to the start
    fn stop(&mut self);
    fn seek_ms(&mut self, pos_ms: u64) -> Result<(), MediaError>;
    /// True once a frame decoded after the latest seek (or stop) is in the
    /// frame buffer. Backends that present synchronously keep the default.
    fn seek_presented(&self) -> bool {
        true
    }
    /// Current decoder position; may be negative before the first frame
    fn position_ms(&self) -> i64;
    fn duration_ms(&self) -> u64;
    /// `volume` in [0, 1]
    fn set_volume(&mut self, volume: f32) -> Result<(), MediaError>;
    fn volume(&self) -> f32;
}

/// Native decoder library
pub trait DecoderBackend: Send + 'static {
    type Session: MediaSession + 'static;

    /// Synchronous parse with a bounded deadline
    fn parse(&self, path: &Path) -> Result<MediaInfo, MediaError>;

    /// Attach the media to a new decoder; it starts paused.
    /// `frame` is `Some` exactly when the media has video.
    fn open(
        &self,
        path: &Path,
        info: &MediaInfo,
        frame: Option<Arc<FrameBuffer>>,
    ) -> Result<Self::Session, MediaError>;
}

/// Player slot, keyed by the caller's player id
pub struct PlayerEntry<S: MediaSession> {
    // Field order matters: session must drop before frame.
    session: S,
    frame: Option<Arc<FrameBuffer>>,
    path: PathBuf,
    info: MediaInfo,
    /// `updated` value seen by the previous `check`
    pub last_observed_counter: u64,
    pub last_use_time: i64,
    pub open_file_time: i64,
    pub check_file_time: i64,
}

impl<S: MediaSession> PlayerEntry<S> {
    /// Parse the media, allocate the frame buffer (video only) and open a
    /// paused decoder on it
    pub fn open<B>(backend: &B, path: &Path) -> Result<Self, MediaError>
    where
        B: DecoderBackend<Session = S>,
    {
        let open_file_time = file_mtime_nanos(path).unwrap_or(0);

        let info = backend.parse(path)?;

        let frame = if info.has_video() {
            Some(FrameBuffer::new(info.width, info.height))
        } else {
            None
        };

        let session = backend.open(path, &info, frame.clone())?;

        info!(
            "Player opened: {} ({}x{}, {} ms{})",
            path.display(),
            info.width,
            info.height,
            info.duration_ms,
            if info.has_video() { "" } else { ", audio only" }
        );

        Ok(Self {
            session,
            frame,
            path: path.to_path_buf(),
            info,
            last_observed_counter: 0,
            last_use_time: now_nanos(),
            open_file_time,
            check_file_time: open_file_time,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn width(&self) -> usize {
        self.info.width
    }

    pub fn height(&self) -> usize {
        self.info.height
    }

    pub fn info(&self) -> &MediaInfo {
        &self.info
    }

    pub fn frame(&self) -> Option<&Arc<FrameBuffer>> {
        self.frame.as_ref()
    }

    /// Copy of the current frame, empty for audio-only media
    pub fn pixels(&self) -> Vec<u8> {
        self.frame.as_ref().map(|f| f.snapshot()).unwrap_or_default()
    }

    /// Frames written by the decoder so far
    pub fn updated_counter(&self) -> u64 {
        self.frame.as_ref().map(|f| f.updated()).unwrap_or(0)
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// `max(0, position)`
    pub fn seek_ms(&self) -> u64 {
        self.session.position_ms().max(0) as u64
    }

    pub fn duration_ms(&self) -> u64 {
        self.session.duration_ms()
    }

    pub fn touch(&mut self) {
        self.last_use_time = now_nanos();
    }
}

impl<S: MediaSession> Drop for PlayerEntry<S> {
    fn drop(&mut self) {
        debug!("Player torn down: {}", self.path.display());
        self.session.stop();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    //! Fake backend shared by registry, maintenance and server tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    pub(crate) struct FakeShared {
        pub opened: Mutex<Vec<PathBuf>>,
        pub dropped: Mutex<Vec<PathBuf>>,
    }

    /// Backend serving canned `MediaInfo` per path
    #[derive(Clone, Default)]
    pub(crate) struct FakeBackend {
        pub media: HashMap<PathBuf, MediaInfo>,
        pub shared: Arc<FakeShared>,
    }

    impl FakeBackend {
        pub fn with(mut self, path: &str, width: usize, height: usize, duration_ms: u64) -> Self {
            self.media.insert(
                PathBuf::from(path),
                MediaInfo { width, height, duration_ms, has_audio: true },
            );
            self
        }
    }

    pub(crate) struct FakeSession {
        pub path: PathBuf,
        pub state: PlayState,
        pub position: i64,
        pub duration: u64,
        pub volume: f32,
        pub frame: Option<Arc<FrameBuffer>>,
        shared: Arc<FakeShared>,
    }

    impl FakeSession {
        fn present(&self) {
            if let Some(frame) = &self.frame {
                let mut px = frame.lock();
                px.fill(self.position as u8);
            }
        }
    }

    impl MediaSession for FakeSession {
        fn state(&self) -> PlayState {
            self.state
        }

        fn play(&mut self) -> Result<(), MediaError> {
            self.state = PlayState::Playing;
            Ok(())
        }

        fn pause(&mut self) {
            if self.state == PlayState::Playing {
                self.state = PlayState::Paused;
            }
        }

        fn stop(&mut self) {
            self.state = PlayState::Stopped;
            self.position = 0;
        }

        fn seek_ms(&mut self, pos_ms: u64) -> Result<(), MediaError> {
            self.position = pos_ms as i64;
            if self.state == PlayState::Playing {
                self.present();
            }
            Ok(())
        }

        fn position_ms(&self) -> i64 {
            self.position
        }

        fn duration_ms(&self) -> u64 {
            self.duration
        }

        fn set_volume(&mut self, volume: f32) -> Result<(), MediaError> {
            self.volume = volume;
            Ok(())
        }

        fn volume(&self) -> f32 {
            self.volume
        }
    }

    impl Drop for FakeSession {
        fn drop(&mut self) {
            self.shared.dropped.lock().unwrap().push(self.path.clone());
        }
    }

    impl DecoderBackend for FakeBackend {
        type Session = FakeSession;

        fn parse(&self, path: &Path) -> Result<MediaInfo, MediaError> {
            self.media
                .get(path)
                .copied()
                .ok_or_else(|| MediaError::Parse(format!("no such media: {}", path.display())))
        }

        fn open(
            &self,
            path: &Path,
            info: &MediaInfo,
            frame: Option<Arc<FrameBuffer>>,
        ) -> Result<FakeSession, MediaError> {
            self.shared.opened.lock().unwrap().push(path.to_path_buf());
            Ok(FakeSession {
                path: path.to_path_buf(),
                state: PlayState::Paused,
                position: 0,
                duration: info.duration_ms,
                volume: 1.0,
                frame,
                shared: Arc::clone(&self.shared),
            })
        }
    }

    #[test]
    fn test_video_entry_allocates_frame() {
        let backend = FakeBackend::default().with("v.mkv", 32, 18, 10_000);
        let entry = PlayerEntry::open(&backend, Path::new("v.mkv")).unwrap();

        assert_eq!((entry.width(), entry.height()), (32, 18));
        assert_eq!(entry.frame().unwrap().len(), 32 * 18 * 4);
        assert_eq!(entry.pixels().len(), 32 * 18 * 4);
        assert_eq!(entry.duration_ms(), 10_000);
        assert_eq!(entry.seek_ms(), 0);
        assert!(!entry.session().is_playing());
        // Missing file on disk: mtime falls back to 0
        assert_eq!(entry.open_file_time, 0);
    }

    #[test]
    fn test_audio_entry_has_no_frame() {
        let backend = FakeBackend::default().with("s.mp3", 0, 0, 3_000);
        let entry = PlayerEntry::open(&backend, Path::new("s.mp3")).unwrap();

        assert!(entry.frame().is_none());
        assert!(entry.pixels().is_empty());
        assert_eq!(entry.updated_counter(), 0);
    }

    #[test]
    fn test_negative_position_reports_zero() {
        let backend = FakeBackend::default().with("v.mkv", 2, 2, 100);
        let mut entry = PlayerEntry::open(&backend, Path::new("v.mkv")).unwrap();
        entry.session_mut().position = -40;
        assert_eq!(entry.seek_ms(), 0);
    }

    #[test]
    fn test_drop_releases_session() {
        let backend = FakeBackend::default().with("v.mkv", 2, 2, 100);
        let entry = PlayerEntry::open(&backend, Path::new("v.mkv")).unwrap();
        drop(entry);
        assert_eq!(backend.shared.dropped.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_failure_propagates() {
        let backend = FakeBackend::default();
        assert!(matches!(
            PlayerEntry::open(&backend, Path::new("missing.mp4")),
            Err(MediaError::Parse(_))
        ));
        assert!(backend.shared.opened.lock().unwrap().is_empty());
    }
}
