//! FFmpeg media probe and the default decoder backend
//!
//! Probing opens the container, finds the first real video track (cover
//! art streams are skipped) and any audio track, and reads the duration.
//! `FfmpegBackend::parse` runs the probe on a helper thread and polls for
//! the result so a stuck demuxer can't hang the command loop.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, warn};
use playa_ffmpeg as ffmpeg;

use super::error::MediaError;
use super::frame::FrameBuffer;
use super::playback::FfmpegSession;
use super::player::{DecoderBackend, MediaInfo};
use crate::config::SidecarConfig;

static FFMPEG_LOG_INIT: Once = Once::new();

pub(crate) fn init_ffmpeg_logging() {
    FFMPEG_LOG_INIT.call_once(|| {
        unsafe {
            // Completely suppress all FFmpeg logging
            // AV_LOG_QUIET = -8 (silence all output including stderr)
            ffmpeg::ffi::av_log_set_level(ffmpeg::ffi::AV_LOG_QUIET);
        }
    });
}

/// Index of the first video stream that is not an attached picture
pub(crate) fn video_stream_index(ictx: &ffmpeg::format::context::Input) -> Option<usize> {
    ictx.streams()
        .find(|s| {
            s.parameters().medium() == ffmpeg::media::Type::Video
                && !s.disposition().contains(ffmpeg::format::stream::Disposition::ATTACHED_PIC)
        })
        .map(|s| s.index())
}

pub(crate) fn audio_stream_index(ictx: &ffmpeg::format::context::Input) -> Option<usize> {
    ictx.streams().best(ffmpeg::media::Type::Audio).map(|s| s.index())
}

/// Timestamp in `time_base` units to milliseconds
pub(crate) fn ts_to_ms(ts: i64, time_base: ffmpeg::Rational) -> i64 {
    if time_base.denominator() == 0 {
        return 0;
    }
    (ts as f64 * f64::from(time_base) * 1000.0).round() as i64
}

/// Milliseconds to a timestamp in `time_base` units
pub(crate) fn ms_to_ts(ms: u64, time_base: ffmpeg::Rational) -> i64 {
    let unit = f64::from(time_base);
    if unit <= 0.0 {
        return 0;
    }
    (ms as f64 / 1000.0 / unit) as i64
}

pub struct MediaProbe;

impl MediaProbe {
    pub fn from_file(path: &Path) -> Result<MediaInfo, MediaError> {
        init_ffmpeg_logging();

        let ictx = ffmpeg::format::input(path)
            .map_err(|e| MediaError::Parse(format!("Failed to open {}: {}", path.display(), e)))?;

        let video_idx = video_stream_index(&ictx);
        let audio_idx = audio_stream_index(&ictx);
        if video_idx.is_none() && audio_idx.is_none() {
            return Err(MediaError::Parse(format!("No audio or video stream in {}", path.display())));
        }

        let (width, height) = match video_idx.and_then(|idx| ictx.stream(idx)) {
            Some(stream) => {
                let decoder_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                    .map_err(|e| MediaError::Parse(format!("Failed to create decoder context: {}", e)))?;
                let decoder = decoder_ctx
                    .decoder()
                    .video()
                    .map_err(|e| MediaError::Parse(format!("Failed to create video decoder: {}", e)))?;
                (decoder.width() as usize, decoder.height() as usize)
            }
            None => (0, 0),
        };

        // Container duration is in AV_TIME_BASE (microseconds)
        let container = ictx.duration();
        let duration_ms = if container > 0 {
            (container / 1000) as u64
        } else {
            video_idx
                .or(audio_idx)
                .and_then(|idx| ictx.stream(idx))
                .map(|s| ts_to_ms(s.duration(), s.time_base()).max(0) as u64)
                .unwrap_or(0)
        };

        Ok(MediaInfo {
            width,
            height,
            duration_ms,
            has_audio: audio_idx.is_some(),
        })
    }
}

/// Decoder backend on top of FFmpeg
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    parse_poll: Duration,
    parse_attempts: u32,
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::from_config(&SidecarConfig::default())
    }
}

impl FfmpegBackend {
    pub fn from_config(config: &SidecarConfig) -> Self {
        Self {
            parse_poll: config.parse_poll,
            parse_attempts: config.parse_attempts.max(1),
        }
    }
}

impl DecoderBackend for FfmpegBackend {
    type Session = FfmpegSession;

    fn parse(&self, path: &Path) -> Result<MediaInfo, MediaError> {
        let (tx, rx) = bounded(1);
        let probe_path: PathBuf = path.to_path_buf();

        thread::Builder::new()
            .name("media-parse".to_string())
            .spawn(move || {
                let _ = tx.send(MediaProbe::from_file(&probe_path));
            })?;

        for attempt in 1..=self.parse_attempts {
            match rx.recv_timeout(self.parse_poll) {
                Ok(result) => {
                    debug!("Parsed {} after {} polls", path.display(), attempt);
                    return result;
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(MediaError::Parse(format!("Parser thread died: {}", path.display())));
                }
            }
        }

        // The helper thread is left to finish on its own
        warn!("Parse of {} gave up after {} polls", path.display(), self.parse_attempts);
        Err(MediaError::ParseTimeout(path.display().to_string()))
    }

    fn open(
        &self,
        path: &Path,
        info: &MediaInfo,
        frame: Option<Arc<FrameBuffer>>,
    ) -> Result<FfmpegSession, MediaError> {
        FfmpegSession::spawn(path, info, frame, self.parse_poll * self.parse_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_base_conversion() {
        let tb = ffmpeg::Rational::new(1, 90_000);
        assert_eq!(ts_to_ms(90_000, tb), 1000);
        assert_eq!(ms_to_ts(1500, tb), 135_000);
        assert_eq!(ts_to_ms(10, ffmpeg::Rational::new(1, 0)), 0);
        assert_eq!(ms_to_ts(10, ffmpeg::Rational::new(0, 1)), 0);
    }

    #[test]
    fn test_probe_rejects_non_media() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.mp4");
        std::fs::write(&path, b"definitely not a container").unwrap();
        assert!(matches!(MediaProbe::from_file(&path), Err(MediaError::Parse(_))));
    }

    #[test]
    fn test_parse_missing_file_is_parse_error() {
        let backend = FfmpegBackend::default();
        let err = backend.parse(Path::new("/nonexistent/clip.mkv")).unwrap_err();
        assert!(matches!(err, MediaError::Parse(_)));
    }

    #[test]
    fn test_from_config_clamps_attempts() {
        let config = SidecarConfig { parse_attempts: 0, ..SidecarConfig::default() };
        let backend = FfmpegBackend::from_config(&config);
        assert_eq!(backend.parse_attempts, 1);
    }
}
