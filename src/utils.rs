//! Utility functions and constants
//!
//! **Why**: Centralized helpers used across multiple modules
//!
//! **Used by**: registry, maintenance, dispatcher

/// Media file type detection
pub mod media {
    use std::path::Path;

    /// Supported image file extensions
    pub const IMAGE_EXTS: &[&str] = &["png", "webp", "jpeg", "jpg", "gif", "tiff", "bmp"];

    /// Supported video file extensions
    pub const VIDEO_EXTS: &[&str] = &["mp4", "mkv", "webm", "mov", "avi", "flv"];

    /// Supported audio file extensions
    pub const AUDIO_EXTS: &[&str] = &["wav", "mp3", "opus", "aac", "ogg", "flac", "pcm"];

    /// Media class of a path, as reported on the wire by `type`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MediaKind {
        Image = 0,
        Video = 1,
        Audio = 2,
    }

    impl MediaKind {
        /// Classify by extension. Unknown or missing extensions are images.
        pub fn from_path(path: &str) -> Self {
            let ext = Path::new(path)
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| s.to_lowercase())
                .unwrap_or_default();

            if VIDEO_EXTS.contains(&ext.as_str()) {
                MediaKind::Video
            } else if AUDIO_EXTS.contains(&ext.as_str()) {
                MediaKind::Audio
            } else {
                MediaKind::Image
            }
        }

        /// Audio and video go through the player registry
        pub fn is_playable(self) -> bool {
            matches!(self, MediaKind::Video | MediaKind::Audio)
        }

        pub fn wire_code(self) -> u64 {
            self as u64
        }
    }
}

/// Wall clock and filesystem timestamps in nanoseconds
pub mod time {
    use std::path::Path;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    /// Current wall clock time (ns since UNIX epoch)
    pub fn now_nanos() -> i64 {
        to_nanos(SystemTime::now())
    }

    /// `now - age`, saturating at 0
    pub fn nanos_ago(age: Duration) -> i64 {
        (now_nanos() - age.as_nanos() as i64).max(0)
    }

    /// Modification time of `path` (ns), or `None` if the file can't be stat'ed
    pub fn file_mtime_nanos(path: &Path) -> Option<i64> {
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(to_nanos)
    }

    fn to_nanos(t: SystemTime) -> i64 {
        t.duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::media::*;
    use super::time::*;
    use std::time::Duration;

    #[test]
    fn test_classify_extensions() {
        assert_eq!(MediaKind::from_path("a.png"), MediaKind::Image);
        assert_eq!(MediaKind::from_path("photos/b.JPG"), MediaKind::Image);
        assert_eq!(MediaKind::from_path("v.mkv"), MediaKind::Video);
        assert_eq!(MediaKind::from_path("clip.MOV"), MediaKind::Video);
        assert_eq!(MediaKind::from_path("s.mp3"), MediaKind::Audio);
        assert_eq!(MediaKind::from_path("voice.opus"), MediaKind::Audio);
        assert_eq!(MediaKind::from_path("x.webm"), MediaKind::Video);
        assert_eq!(MediaKind::from_path("x.flac"), MediaKind::Audio);
    }

    #[test]
    fn test_unknown_defaults_to_image() {
        for ext in IMAGE_EXTS {
            assert_eq!(MediaKind::from_path(&format!("x.{}", ext)), MediaKind::Image);
        }
        assert_eq!(MediaKind::from_path("notes.txt"), MediaKind::Image);
        assert_eq!(MediaKind::from_path("no_extension"), MediaKind::Image);
        assert_eq!(MediaKind::from_path(""), MediaKind::Image);
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(MediaKind::Image.wire_code(), 0);
        assert_eq!(MediaKind::Video.wire_code(), 1);
        assert_eq!(MediaKind::Audio.wire_code(), 2);
        assert!(!MediaKind::Image.is_playable());
        assert!(MediaKind::Audio.is_playable());
    }

    #[test]
    fn test_time_helpers() {
        let now = now_nanos();
        assert!(now > 0);
        let earlier = nanos_ago(Duration::from_secs(60));
        assert!(earlier < now);
        assert!(now - earlier >= 60_000_000_000);

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.bin");
        assert!(file_mtime_nanos(&file).is_none());
        std::fs::write(&file, b"x").unwrap();
        assert!(file_mtime_nanos(&file).unwrap() > 0);
    }
}
