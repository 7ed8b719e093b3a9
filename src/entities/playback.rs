//! FFmpeg playback session: one decode thread per player
//!
//! **Why**: Decoding has to run at media speed independently of the command
//! loop. The thread owns the demuxer, decoders and the RGBA scaler; the
//! session handle only flips transport flags and wakes it.
//!
//! **Used by**: FfmpegBackend::open, PlayerEntry (through `MediaSession`)
//!
//! # Thread protocol
//!
//! ```text
//! FfmpegSession (dispatcher side)        decode thread
//!   play/pause/seek/stop ──┐
//!                          ├─> Transport (Mutex) + Condvar ─> next_step()
//!   Drop: shutdown + join ─┘                                   │
//!                                        Seek -> av_seek_frame + flush
//!                                        Decode -> packet -> pace -> present
//! ```
//!
//! A paused thread parks on the condvar. Presenting writes through
//! `FrameBuffer::lock`, whose guard bumps the frame counter on release.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, error, trace, warn};
use playa_ffmpeg as ffmpeg;

use super::error::MediaError;
use super::frame::FrameBuffer;
use super::loader_video::{audio_stream_index, init_ffmpeg_logging, ms_to_ts, ts_to_ms, video_stream_index};
use super::player::{MediaInfo, MediaSession, PlayState};

#[cfg(feature = "audio")]
use super::audio_out::{self, AudioSink};

/// Player volume readable from the audio callback (f32 bits)
pub type SharedVolume = Arc<AtomicU32>;

/// Transport shared between the session handle and its thread
#[derive(Debug)]
struct Transport {
    state: PlayState,
    position_ms: i64,
    pending_seek: Option<u64>,
    /// Bumped by every seek and stop
    seek_serial: u64,
    /// `seek_serial` the last presented frame was decoded under
    presented_serial: u64,
    /// Present the next frame even though not playing (poster frame)
    preroll: bool,
    volume: f32,
    shutdown: bool,
}

#[derive(Debug)]
struct Shared {
    transport: Mutex<Transport>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Transport> {
        self.transport.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct FfmpegSession {
    shared: Arc<Shared>,
    duration_ms: u64,
    has_video: bool,
    volume_cell: SharedVolume,
    handle: Option<thread::JoinHandle<()>>,
}

impl FfmpegSession {
    /// Start the decode thread paused; returns once the media is opened.
    /// An open that outlasts `open_timeout` is abandoned.
    pub fn spawn(
        path: &Path,
        info: &MediaInfo,
        frame: Option<Arc<FrameBuffer>>,
        open_timeout: Duration,
    ) -> Result<Self, MediaError> {
        let has_video = frame.is_some();
        let shared = Arc::new(Shared {
            transport: Mutex::new(Transport {
                state: PlayState::Opening,
                position_ms: 0,
                pending_seek: None,
                seek_serial: 0,
                presented_serial: 0,
                preroll: has_video,
                volume: 1.0,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });

        let volume_cell: SharedVolume = Arc::new(AtomicU32::new(1.0f32.to_bits()));

        let (ready_tx, ready_rx) = bounded::<Result<(), MediaError>>(1);
        let thread_shared = Arc::clone(&shared);
        let thread_path = path.to_path_buf();
        let thread_volume = Arc::clone(&volume_cell);

        let handle = thread::Builder::new()
            .name("media-decode".to_string())
            .spawn(move || {
                match DecodeLoop::open(thread_path, frame, thread_shared, thread_volume) {
                    Ok(mut decode) => {
                        let _ = ready_tx.send(Ok(()));
                        decode.run();
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        let opened = match ready_rx.recv_timeout(open_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // The thread exits on its own once the open returns
                shared.lock().shutdown = true;
                warn!("Decoder open of {} gave up after {:?}", path.display(), open_timeout);
                return Err(MediaError::ParseTimeout(path.display().to_string()));
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(MediaError::Decoder("Decode thread exited during open".to_string()))
            }
        };
        if let Err(e) = opened {
            let _ = handle.join();
            return Err(e);
        }

        {
            let mut t = shared.lock();
            if t.state == PlayState::Opening {
                t.state = PlayState::Paused;
            }
        }

        Ok(Self {
            shared,
            duration_ms: info.duration_ms,
            has_video,
            volume_cell,
            handle: Some(handle),
        })
    }

    fn update(&self, f: impl FnOnce(&mut Transport)) {
        let mut t = self.shared.lock();
        f(&mut t);
        drop(t);
        self.shared.wake.notify_all();
    }
}

impl MediaSession for FfmpegSession {
    fn state(&self) -> PlayState {
        self.shared.lock().state
    }

    fn play(&mut self) -> Result<(), MediaError> {
        let mut t = self.shared.lock();
        if t.state == PlayState::Error {
            return Err(MediaError::Decoder("Decoder is in error state".to_string()));
        }
        t.state = PlayState::Playing;
        drop(t);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn pause(&mut self) {
        self.update(|t| {
            if t.state == PlayState::Playing {
                t.state = PlayState::Paused;
            }
        });
    }

    fn stop(&mut self) {
        let has_video = self.has_video;
        self.update(|t| {
            if t.state != PlayState::Error {
                t.state = PlayState::Stopped;
            }
            t.position_ms = 0;
            t.pending_seek = Some(0);
            t.seek_serial += 1;
            t.preroll = has_video;
        });
    }

    fn seek_ms(&mut self, pos_ms: u64) -> Result<(), MediaError> {
        let has_video = self.has_video;
        self.update(|t| {
            t.pending_seek = Some(pos_ms);
            t.seek_serial += 1;
            t.position_ms = pos_ms as i64;
            if t.state == PlayState::Ended {
                t.state = PlayState::Paused;
            }
            // The target frame is shown even if a pause lands first
            t.preroll = has_video;
        });
        Ok(())
    }

    fn seek_presented(&self) -> bool {
        let t = self.shared.lock();
        t.pending_seek.is_none() && t.presented_serial == t.seek_serial
    }

    fn position_ms(&self) -> i64 {
        self.shared.lock().position_ms
    }

    fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    fn set_volume(&mut self, volume: f32) -> Result<(), MediaError> {
        let volume = volume.clamp(0.0, 1.0);
        self.volume_cell.store(volume.to_bits(), Ordering::Relaxed);
        self.shared.lock().volume = volume;
        Ok(())
    }

    fn volume(&self) -> f32 {
        self.shared.lock().volume
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        self.update(|t| t.shutdown = true);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Decode thread panicked");
            }
        }
    }
}

// ===== Decode thread =====

enum Step {
    Shutdown,
    Seek(u64),
    Decode,
}

struct VideoTrack {
    index: usize,
    decoder: ffmpeg::decoder::Video,
    time_base: ffmpeg::Rational,
    scaler: Option<ffmpeg::software::scaling::Context>,
    frame: Arc<FrameBuffer>,
}

struct AudioTrack {
    index: usize,
    time_base: ffmpeg::Rational,
    #[cfg(feature = "audio")]
    decoder: ffmpeg::decoder::Audio,
    #[cfg(feature = "audio")]
    sink: Option<AudioSink>,
}

struct DecodeLoop {
    path: PathBuf,
    input: ffmpeg::format::context::Input,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    shared: Arc<Shared>,
    /// Wall clock anchor: (instant, media ms shown at that instant)
    clock: Option<(Instant, i64)>,
    /// Drop output earlier than this after a seek
    skip_until: Option<i64>,
    /// Latest frame dropped by `skip_until`, shown at EOF when the target
    /// lies past the last frame
    last_skipped: Option<(ffmpeg::util::frame::video::Video, i64)>,
    /// `seek_serial` of the seek being decoded
    serial: u64,
    #[cfg(feature = "audio")]
    sink_running: bool,
}

impl DecodeLoop {
    fn open(
        path: PathBuf,
        frame: Option<Arc<FrameBuffer>>,
        shared: Arc<Shared>,
        volume: SharedVolume,
    ) -> Result<Self, MediaError> {
        init_ffmpeg_logging();

        let input = ffmpeg::format::input(&path)
            .map_err(|e| MediaError::Decoder(format!("Failed to open {}: {}", path.display(), e)))?;

        let video = match (frame, video_stream_index(&input)) {
            (Some(frame), Some(index)) => {
                let stream = input
                    .stream(index)
                    .ok_or_else(|| MediaError::Decoder("Video stream vanished".to_string()))?;
                let time_base = stream.time_base();
                let mut decoder_ctx = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                    .map_err(|e| MediaError::Decoder(format!("Failed to create decoder context: {}", e)))?;

                // Enable multi-threaded frame decoding (2-4x speedup)
                unsafe {
                    (*decoder_ctx.as_mut_ptr()).thread_type = ffmpeg::ffi::FF_THREAD_FRAME;
                    (*decoder_ctx.as_mut_ptr()).thread_count = 0; // Auto-detect CPU cores
                }

                let decoder = decoder_ctx
                    .decoder()
                    .video()
                    .map_err(|e| MediaError::Decoder(format!("Failed to create video decoder: {}", e)))?;
                Some(VideoTrack { index, decoder, time_base, scaler: None, frame })
            }
            _ => None,
        };

        let audio = match audio_stream_index(&input) {
            Some(index) => {
                let stream = input
                    .stream(index)
                    .ok_or_else(|| MediaError::Decoder("Audio stream vanished".to_string()))?;
                let time_base = stream.time_base();

                #[cfg(feature = "audio")]
                {
                    let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
                        .and_then(|ctx| ctx.decoder().audio())
                        .map_err(|e| MediaError::Decoder(format!("Failed to create audio decoder: {}", e)))?;
                    let sink = match AudioSink::open(volume) {
                        Ok(sink) => Some(sink),
                        Err(e) => {
                            warn!("No audio output for {}: {}", path.display(), e);
                            None
                        }
                    };
                    Some(AudioTrack { index, time_base, decoder, sink })
                }
                #[cfg(not(feature = "audio"))]
                {
                    // No output device: the track only drives the clock
                    let _ = &volume;
                    Some(AudioTrack { index, time_base })
                }
            }
            None => None,
        };

        if video.is_none() && audio.is_none() {
            return Err(MediaError::Decoder(format!("Nothing to play in {}", path.display())));
        }

        if video.is_none() {
            shared.lock().preroll = false;
        }

        debug!(
            "Decode thread ready: {} (video: {}, audio: {})",
            path.display(),
            video.is_some(),
            audio.is_some()
        );

        Ok(Self {
            path,
            input,
            video,
            audio,
            shared,
            clock: None,
            skip_until: None,
            last_skipped: None,
            serial: 0,
            #[cfg(feature = "audio")]
            sink_running: false,
        })
    }

    fn run(&mut self) {
        loop {
            match self.next_step() {
                Step::Shutdown => break,
                Step::Seek(ms) => self.seek(ms),
                Step::Decode => {
                    if let Err(e) = self.decode_packet() {
                        error!("Playback of {} failed: {}", self.path.display(), e);
                        let mut t = self.shared.lock();
                        t.state = PlayState::Error;
                        t.preroll = false;
                    }
                }
            }
        }
        debug!("Decode thread finished: {}", self.path.display());
    }

    /// Block until there is something to do
    fn next_step(&mut self) -> Step {
        let shared = Arc::clone(&self.shared);
        let mut t = shared.lock();
        loop {
            if t.shutdown {
                return Step::Shutdown;
            }
            if let Some(ms) = t.pending_seek.take() {
                self.serial = t.seek_serial;
                return Step::Seek(ms);
            }
            if t.state == PlayState::Playing || (t.preroll && t.state != PlayState::Error) {
                #[cfg(feature = "audio")]
                self.set_sink_running(t.state == PlayState::Playing);
                return Step::Decode;
            }

            // Parked: the clock restarts from the next presented frame
            self.clock = None;
            #[cfg(feature = "audio")]
            self.set_sink_running(false);
            t = shared.wake.wait(t).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn seek(&mut self, target_ms: u64) {
        let (index, time_base) = match (&self.video, &self.audio) {
            (Some(v), _) => (v.index, v.time_base),
            (None, Some(a)) => (a.index, a.time_base),
            (None, None) => return,
        };

        let ts = ms_to_ts(target_ms, time_base);
        let ret = unsafe {
            ffmpeg::ffi::av_seek_frame(
                self.input.as_mut_ptr(),
                index as i32,
                ts,
                ffmpeg::ffi::AVSEEK_FLAG_BACKWARD,
            )
        };
        if ret < 0 {
            warn!("Seek to {} ms failed in {} (ret={})", target_ms, self.path.display(), ret);
        }

        if let Some(video) = self.video.as_mut() {
            video.decoder.flush();
        }
        #[cfg(feature = "audio")]
        if let Some(audio) = self.audio.as_mut() {
            audio.decoder.flush();
            if let Some(sink) = &audio.sink {
                sink.flush();
            }
        }

        self.skip_until = Some(target_ms as i64);
        self.last_skipped = None;
        self.clock = None;
        trace!("Seek {} -> {} ms (ts {})", self.path.display(), target_ms, ts);
    }

    /// Demux one packet and handle its output; EOF drains and ends playback
    fn decode_packet(&mut self) -> Result<(), MediaError> {
        let next = self
            .input
            .packets()
            .next()
            .map(|(stream, packet)| (stream.index(), packet));

        let Some((index, packet)) = next else {
            return self.finish();
        };

        if let Some(video) = self.video.as_mut() {
            if video.index == index {
                if let Err(e) = video.decoder.send_packet(&packet) {
                    trace!("Video packet rejected: {}", e);
                    return Ok(());
                }
                return self.receive_video();
            }
        }

        if self.audio.as_ref().is_some_and(|a| a.index == index) {
            self.handle_audio(&packet);
        }
        Ok(())
    }

    fn receive_video(&mut self) -> Result<(), MediaError> {
        loop {
            let mut decoded = ffmpeg::util::frame::video::Video::empty();
            let Some(video) = self.video.as_mut() else {
                return Ok(());
            };
            if video.decoder.receive_frame(&mut decoded).is_err() {
                return Ok(());
            }
            let time_base = video.time_base;

            let Some(ts) = decoded.timestamp().or_else(|| decoded.pts()) else {
                continue;
            };
            let pts_ms = ts_to_ms(ts, time_base);

            if let Some(skip) = self.skip_until {
                if pts_ms < skip {
                    self.last_skipped = Some((decoded, pts_ms));
                    continue;
                }
                self.skip_until = None;
                self.last_skipped = None;
            }

            if !self.wait_until_due(pts_ms) {
                // Seek or shutdown arrived; the frame is stale
                return Ok(());
            }
            self.present(&decoded)?;
            self.mark_presented(pts_ms);
        }
    }

    /// Publish the position of a presented frame unless a newer seek is
    /// already queued
    fn mark_presented(&self, pts_ms: i64) {
        let mut t = self.shared.lock();
        if t.pending_seek.is_some() {
            return;
        }
        t.position_ms = pts_ms;
        t.presented_serial = self.serial;
        t.preroll = false;
    }

    /// Scale into RGBA and copy row by row into the shared buffer
    fn present(&mut self, decoded: &ffmpeg::util::frame::video::Video) -> Result<(), MediaError> {
        let Some(video) = self.video.as_mut() else {
            return Ok(());
        };
        let width = video.frame.width() as u32;
        let height = video.frame.height() as u32;

        let stale = video.scaler.as_ref().is_none_or(|s| {
            let input = s.input();
            input.format != decoded.format() || input.width != decoded.width() || input.height != decoded.height()
        });
        if stale {
            let scaler = ffmpeg::software::scaling::Context::get(
                decoded.format(),
                decoded.width(),
                decoded.height(),
                ffmpeg::format::Pixel::RGBA,
                width,
                height,
                ffmpeg::software::scaling::Flags::BILINEAR,
            )
            .map_err(|e| MediaError::Decoder(format!("Failed to create scaler: {}", e)))?;
            video.scaler = Some(scaler);
        }
        let Some(scaler) = video.scaler.as_mut() else {
            return Ok(());
        };

        let mut rgba_frame = ffmpeg::util::frame::video::Video::empty();
        scaler
            .run(decoded, &mut rgba_frame)
            .map_err(|e| MediaError::Decoder(format!("Failed to scale frame: {}", e)))?;

        let rgba_data = rgba_frame.data(0);
        let stride = rgba_frame.stride(0);
        let row_bytes = video.frame.pitch();
        let mut pixels = video.frame.lock();
        for y in 0..height as usize {
            let src = y * stride;
            let dst = y * row_bytes;
            if src + row_bytes > rgba_data.len() {
                break;
            }
            pixels[dst..dst + row_bytes].copy_from_slice(&rgba_data[src..src + row_bytes]);
        }
        Ok(())
    }

    fn handle_audio(&mut self, packet: &ffmpeg::Packet) {
        let Some(time_base) = self.audio.as_ref().map(|a| a.time_base) else {
            return;
        };
        let pts_ms = packet.pts().or_else(|| packet.dts()).map(|ts| ts_to_ms(ts, time_base));
        let drives_clock = self.video.is_none();

        if let (Some(skip), Some(pts)) = (self.skip_until, pts_ms) {
            if pts < skip {
                return;
            }
            if drives_clock {
                self.skip_until = None;
            }
        }

        #[cfg(feature = "audio")]
        if let Some(audio) = self.audio.as_mut() {
            decode_audio(audio, packet);
        }

        // Audio-only media: packets drive position and pacing
        if drives_clock {
            if let Some(pts) = pts_ms {
                if self.wait_until_due(pts) {
                    let mut t = self.shared.lock();
                    if t.pending_seek.is_none() {
                        t.position_ms = pts;
                        t.presented_serial = self.serial;
                    }
                }
            }
        }
    }

    /// Sleep until `pts_ms` is due on the wall clock. Returns false when a
    /// seek or shutdown makes the pending output stale.
    fn wait_until_due(&mut self, pts_ms: i64) -> bool {
        let shared = Arc::clone(&self.shared);
        let mut t = shared.lock();
        let (mut anchor, mut anchor_ms) = *self.clock.get_or_insert((Instant::now(), pts_ms));
        let mut parked = false;

        loop {
            if t.shutdown || t.pending_seek.is_some() {
                return false;
            }
            if t.preroll && t.state != PlayState::Playing {
                return true;
            }
            if t.state != PlayState::Playing {
                parked = true;
                #[cfg(feature = "audio")]
                self.set_sink_running(false);
                t = shared.wake.wait(t).unwrap_or_else(|e| e.into_inner());
                continue;
            }
            if parked {
                parked = false;
                (anchor, anchor_ms) = (Instant::now(), pts_ms);
                self.clock = Some((anchor, anchor_ms));
                #[cfg(feature = "audio")]
                self.set_sink_running(true);
            }

            let due = anchor + Duration::from_millis((pts_ms - anchor_ms).max(0) as u64);
            let now = Instant::now();
            if now >= due {
                return true;
            }
            t = shared
                .wake
                .wait_timeout(t, due - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// End of stream: flush the video decoder, then park as Ended
    fn finish(&mut self) -> Result<(), MediaError> {
        if let Some(video) = self.video.as_mut() {
            if video.decoder.send_eof().is_ok() {
                self.receive_video()?;
            }
        }

        // Seek target past the last frame: show the last one before it
        if self.skip_until.take().is_some() {
            if let Some((last, pts_ms)) = self.last_skipped.take() {
                self.present(&last)?;
                self.mark_presented(pts_ms);
            }
        }

        let mut t = self.shared.lock();
        if t.pending_seek.is_some() {
            return Ok(());
        }
        t.preroll = false;
        if t.state == PlayState::Playing {
            t.state = PlayState::Ended;
            debug!("Playback ended: {}", self.path.display());
        }
        Ok(())
    }

    #[cfg(feature = "audio")]
    fn set_sink_running(&mut self, running: bool) {
        if self.sink_running == running {
            return;
        }
        self.sink_running = running;
        if let Some(sink) = self.audio.as_ref().and_then(|a| a.sink.as_ref()) {
            if running { sink.play() } else { sink.pause() }
        }
    }
}

/// Decode one audio packet and queue the samples on the output
#[cfg(feature = "audio")]
fn decode_audio(audio: &mut AudioTrack, packet: &ffmpeg::Packet) {
    let Some(sink) = audio.sink.as_ref() else {
        return;
    };
    if let Err(e) = audio.decoder.send_packet(packet) {
        trace!("Audio packet rejected: {}", e);
        return;
    }
    let mut decoded = ffmpeg::util::frame::audio::Audio::empty();
    while audio.decoder.receive_frame(&mut decoded).is_ok() {
        let Some((planes, planar)) = frame_samples(&decoded) else {
            trace!("Unsupported sample format {:?}", decoded.format());
            continue;
        };
        let samples = audio_out::convert(
            &planes,
            planar,
            decoded.channels() as usize,
            decoded.rate(),
            sink.channels as usize,
            sink.sample_rate,
        );
        sink.push(samples);
    }
}

/// f32/s16 samples of a decoded frame as f32 planes
#[cfg(feature = "audio")]
fn frame_samples(frame: &ffmpeg::util::frame::audio::Audio) -> Option<(Vec<Vec<f32>>, bool)> {
    use ffmpeg::format::Sample;
    use ffmpeg::format::sample::Type;

    let channels = frame.channels() as usize;
    let samples = frame.samples();
    let (planar, bytes_per_sample) = match frame.format() {
        Sample::F32(Type::Planar) => (true, 4),
        Sample::F32(Type::Packed) => (false, 4),
        Sample::I16(Type::Planar) => (true, 2),
        Sample::I16(Type::Packed) => (false, 2),
        _ => return None,
    };
    let is_float = bytes_per_sample == 4;

    let decode_plane = |raw: &[u8], count: usize| -> Vec<f32> {
        let raw = &raw[..(count * bytes_per_sample).min(raw.len())];
        if is_float {
            raw.chunks_exact(4)
                .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        } else {
            raw.chunks_exact(2)
                .map(|b| i16::from_ne_bytes([b[0], b[1]]) as f32 / 32768.0)
                .collect()
        }
    };

    let planes = if planar {
        (0..channels).map(|ch| decode_plane(frame.data(ch), samples)).collect()
    } else {
        vec![decode_plane(frame.data(0), samples * channels)]
    };
    Some((planes, planar))
}
