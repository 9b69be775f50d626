//! Audio playback to speakers

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};

use super::resample::resample;
use crate::{Error, Result};

/// Sample rate of OpenAI TTS output
pub const TTS_SAMPLE_RATE: u32 = 24000;

/// How playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    Completed,
    Cancelled,
}

/// Decoded mono audio
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Plays audio to the default output device
///
/// Playback blocks the calling thread; run it under `spawn_blocking`.
pub struct AudioPlayback {
    device: Device,
    config: StreamConfig,
}

impl AudioPlayback {
    /// Open the default output device
    ///
    /// # Errors
    ///
    /// Returns error if no output device exists or it has no f32 config
    pub fn new() -> Result<Self> {
        let device = cpal::default_host()
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?;

        let supported = device
            .default_output_config()
            .map_err(|e| Error::Audio(e.to_string()))?;
        if supported.sample_format() != SampleFormat::F32 {
            return Err(Error::Audio(format!(
                "unsupported output sample format {}",
                supported.sample_format()
            )));
        }
        let config = supported.config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = config.sample_rate.0,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self { device, config })
    }

    /// Play a clip until it ends or `cancel` is set
    ///
    /// # Errors
    ///
    /// Returns error if the clip cannot be resampled or the output stream
    /// fails to start
    pub fn play(&self, clip: &Clip, volume: f32, cancel: &AtomicBool) -> Result<PlaybackEnd> {
        let samples = resample(&clip.samples, clip.sample_rate, self.config.sample_rate.0)?;
        if samples.is_empty() {
            return Ok(PlaybackEnd::Completed);
        }

        let channels = usize::from(self.config.channels);
        let total = samples.len();
        let samples = Arc::new(samples);
        let position = Arc::new(AtomicUsize::new(0));
        let gain = volume.clamp(0.0, 1.0);

        let stream = {
            let samples = Arc::clone(&samples);
            let position = Arc::clone(&position);
            self.device
                .build_output_stream(
                    &self.config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut pos = position.load(Ordering::Relaxed);
                        for frame in data.chunks_mut(channels) {
                            let sample = samples.get(pos).map_or(0.0, |s| s * gain);
                            frame.fill(sample);
                            if pos < samples.len() {
                                pos += 1;
                            }
                        }
                        position.store(pos, Ordering::Relaxed);
                    },
                    |err| {
                        tracing::error!(error = %err, "audio playback error");
                    },
                    None,
                )
                .map_err(|e| Error::Audio(e.to_string()))?
        };

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;

        let duration_ms = (total as u64 * 1000) / u64::from(self.config.sample_rate.0);
        let deadline = Instant::now() + Duration::from_millis(duration_ms + 500);

        let end = loop {
            if cancel.load(Ordering::SeqCst) {
                break PlaybackEnd::Cancelled;
            }
            if position.load(Ordering::Relaxed) >= total || Instant::now() > deadline {
                // let the device drain its last buffer
                std::thread::sleep(Duration::from_millis(100));
                break PlaybackEnd::Completed;
            }
            std::thread::sleep(Duration::from_millis(20));
        };

        drop(stream);
        tracing::debug!(samples = total, ?end, "playback finished");
        Ok(end)
    }
}

/// Decode MP3 bytes to a mono clip
///
/// # Errors
///
/// Returns error if the data is not valid MP3
pub fn decode_mp3(mp3_data: &[u8]) -> Result<Clip> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = TTS_SAMPLE_RATE;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if let Ok(rate) = u32::try_from(frame.sample_rate) {
                    sample_rate = rate;
                }
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(Clip {
        samples,
        sample_rate,
    })
}

/// Stoppable handle shared between a player thread and its owner
#[derive(Debug, Default, Clone)]
pub struct PlaybackCancel(Arc<AtomicBool>);

impl PlaybackCancel {
    /// Ask the player to stop
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// The flag the player polls
    #[must_use]
    pub fn flag(&self) -> &AtomicBool {
        &self.0
    }
}

/// Tracks the cancel handle of whatever is playing now
#[derive(Debug, Default)]
pub struct CurrentPlayback(Mutex<Option<PlaybackCancel>>);

impl CurrentPlayback {
    /// Cancel anything playing and register a new handle
    pub fn begin(&self) -> PlaybackCancel {
        let next = PlaybackCancel::default();
        let previous = self
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(next.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        next
    }

    /// Cancel anything playing
    pub fn cancel(&self) {
        let current = self
            .0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(current) = current {
            current.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_cancels_previous() {
        let current = CurrentPlayback::default();
        let first = current.begin();
        let second = current.begin();
        assert!(first.flag().load(Ordering::SeqCst));
        assert!(!second.flag().load(Ordering::SeqCst));

        current.cancel();
        assert!(second.flag().load(Ordering::SeqCst));
    }
}
