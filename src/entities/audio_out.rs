//! CPAL audio output for the FFmpeg backend (feature `audio`)
//!
//! The decode thread pushes interleaved f32 chunks (already at the device
//! rate and channel count) into a bounded crossbeam ring; the CPAL callback
//! drains it and applies the player volume. The callback never blocks.
//!
//! `cpal::Stream` is not `Send`, so an `AudioSink` is created and dropped on
//! the decode thread that feeds it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, trace};

use super::error::MediaError;
use super::playback::SharedVolume;

/// Ring size in chunks; one decoded audio frame per chunk (~20-40 ms)
const RING_BUFFER_CHUNKS: usize = 64;

pub struct AudioSink {
    stream: Stream,
    sender: Sender<Vec<f32>>,
    /// Second handle on the ring so a seek can discard queued audio
    drain: Receiver<Vec<f32>>,
    playing: Arc<AtomicBool>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioSink {
    /// Open the default output device at its preferred rate/channels
    pub fn open(volume: SharedVolume) -> Result<Self, MediaError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| MediaError::Decoder("No audio output device found".to_string()))?;

        let supported = device
            .default_output_config()
            .map_err(|e| MediaError::Decoder(format!("No usable output config: {}", e)))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (sender, receiver) = bounded::<Vec<f32>>(RING_BUFFER_CHUNKS);
        let drain = receiver.clone();
        let playing = Arc::new(AtomicBool::new(false));
        let playing_cb = Arc::clone(&playing);

        // Leftover of a chunk that didn't fit the previous callback
        let remainder: Mutex<(Vec<f32>, usize)> = Mutex::new((Vec::new(), 0));

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !playing_cb.load(Ordering::Relaxed) {
                        data.fill(0.0);
                        return;
                    }

                    let gain = f32::from_bits(volume.load(Ordering::Relaxed));
                    let mut rem = remainder.lock().unwrap_or_else(|e| e.into_inner());
                    let mut written = 0;

                    while written < data.len() {
                        let (chunk, pos) = &mut *rem;
                        if *pos >= chunk.len() {
                            match receiver.try_recv() {
                                Ok(next) => {
                                    *chunk = next;
                                    *pos = 0;
                                    continue;
                                }
                                Err(_) => {
                                    // Underrun: silence
                                    data[written..].fill(0.0);
                                    break;
                                }
                            }
                        }
                        let n = (chunk.len() - *pos).min(data.len() - written);
                        for (out, sample) in data[written..written + n].iter_mut().zip(&chunk[*pos..*pos + n]) {
                            *out = sample * gain;
                        }
                        *pos += n;
                        written += n;
                    }
                },
                move |err| {
                    error!("Audio output stream error: {}", err);
                },
                None,
            )
            .map_err(|e| MediaError::Decoder(format!("Failed to build audio stream: {}", e)))?;

        debug!("Audio output: {} Hz, {} channels", sample_rate, channels);

        Ok(Self {
            stream,
            sender,
            drain,
            playing,
            sample_rate,
            channels,
        })
    }

    pub fn play(&self) {
        if let Err(e) = self.stream.play() {
            error!("Audio output failed to start: {}", e);
            return;
        }
        self.playing.store(true, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        self.playing.store(false, Ordering::Relaxed);
    }

    /// Queue interleaved samples; dropped when the ring is full
    pub fn push(&self, samples: Vec<f32>) {
        if samples.is_empty() {
            return;
        }
        match self.sender.try_send(samples) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("Audio ring full, dropping chunk"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Discard everything queued (after a seek)
    pub fn flush(&self) {
        while self.drain.try_recv().is_ok() {}
    }
}

/// Convert one decoded frame's samples to `out_channels` interleaved f32 at
/// `out_rate` (linear interpolation).
///
/// `planes` holds one slice per channel (planar) or a single interleaved
/// slice of `in_channels` channels (packed).
pub fn convert(
    planes: &[Vec<f32>],
    planar: bool,
    in_channels: usize,
    in_rate: u32,
    out_channels: usize,
    out_rate: u32,
) -> Vec<f32> {
    if in_channels == 0 || out_channels == 0 || in_rate == 0 || out_rate == 0 || planes.is_empty() {
        return Vec::new();
    }

    let frames = if planar { planes[0].len() } else { planes[0].len() / in_channels };
    let sample = |frame: usize, ch: usize| -> f32 {
        let ch = ch.min(in_channels - 1);
        if planar {
            planes.get(ch).and_then(|p| p.get(frame)).copied().unwrap_or(0.0)
        } else {
            planes[0].get(frame * in_channels + ch).copied().unwrap_or(0.0)
        }
    };
    // Mono sources go to every output channel, extra source channels are dropped
    let source = |frame: usize, out_ch: usize| -> f32 {
        if in_channels == 1 { sample(frame, 0) } else { sample(frame, out_ch) }
    };

    if frames == 0 {
        return Vec::new();
    }

    let out_frames = (frames as u64 * out_rate as u64 / in_rate as u64) as usize;
    let step = in_rate as f64 / out_rate as f64;
    let mut out = Vec::with_capacity(out_frames * out_channels);
    for i in 0..out_frames {
        let src = i as f64 * step;
        let i0 = (src as usize).min(frames - 1);
        let i1 = (i0 + 1).min(frames - 1);
        let t = (src - i0 as f64) as f32;
        for ch in 0..out_channels {
            let a = source(i0, ch);
            let b = source(i1, ch);
            out.push(a + (b - a) * t);
        }
    }
    out
}
