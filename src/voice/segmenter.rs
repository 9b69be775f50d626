//! Utterance segmentation
//!
//! Splits a microphone stream into one spoken utterance using local energy
//! detection. Feeds the cloud recognizer, which only uploads audio once a
//! complete utterance has been heard.

use std::time::Duration;

use super::capture::SAMPLE_RATE;

/// Minimum audio energy threshold to consider speech
const ENERGY_THRESHOLD: f32 = 0.03;

/// Minimum duration of speech to count as an utterance (in samples at 16kHz)
const MIN_SPEECH_SAMPLES: usize = 4800; // 0.3 seconds

/// Silence duration that ends an utterance (in samples)
const SILENCE_SAMPLES: usize = 8000; // 0.5 seconds

/// Default time to wait for any speech before giving up
pub const NO_SPEECH_TIMEOUT: Duration = Duration::from_secs(8);

/// State of the segmenter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Waiting for speech
    Waiting,
    /// Speech detected, accumulating
    Speaking,
    /// Speech followed by enough silence
    Complete,
    /// No speech within the timeout
    NoSpeech,
}

/// Detects the start and end of one utterance
pub struct SpeechSegmenter {
    state: SegmentState,
    speech_buffer: Vec<f32>,
    silence_counter: usize,
    waited: usize,
    no_speech_limit: usize,
}

impl SpeechSegmenter {
    /// Create a segmenter that gives up after `no_speech` of silence
    #[must_use]
    pub fn new(no_speech: Duration) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let no_speech_limit =
            (no_speech.as_millis() as usize).saturating_mul(SAMPLE_RATE as usize) / 1000;
        Self {
            state: SegmentState::Waiting,
            speech_buffer: Vec::new(),
            silence_counter: 0,
            waited: 0,
            no_speech_limit,
        }
    }

    /// Feed captured samples and return the resulting state
    pub fn process(&mut self, samples: &[f32]) -> SegmentState {
        let energy = calculate_energy(samples);
        let is_speech = energy > ENERGY_THRESHOLD;

        match self.state {
            SegmentState::Waiting => {
                if is_speech {
                    self.state = SegmentState::Speaking;
                    self.speech_buffer.clear();
                    self.speech_buffer.extend_from_slice(samples);
                    self.silence_counter = 0;
                    tracing::trace!(energy, "speech detected");
                } else {
                    self.waited += samples.len();
                    if self.waited >= self.no_speech_limit {
                        tracing::debug!("no speech before timeout");
                        self.state = SegmentState::NoSpeech;
                    }
                }
            }
            SegmentState::Speaking => {
                self.speech_buffer.extend_from_slice(samples);

                if is_speech {
                    self.silence_counter = 0;
                } else {
                    self.silence_counter += samples.len();
                }

                if self.silence_counter > SILENCE_SAMPLES {
                    if self.speech_buffer.len() > MIN_SPEECH_SAMPLES + self.silence_counter {
                        tracing::debug!(
                            samples = self.speech_buffer.len(),
                            "utterance complete"
                        );
                        self.state = SegmentState::Complete;
                    } else {
                        tracing::trace!("blip too short, waiting again");
                        self.waited += self.speech_buffer.len();
                        self.speech_buffer.clear();
                        self.silence_counter = 0;
                        self.state = SegmentState::Waiting;
                    }
                }
            }
            SegmentState::Complete | SegmentState::NoSpeech => {}
        }

        self.state
    }

    /// Get the accumulated speech buffer
    #[must_use]
    pub fn speech_buffer(&self) -> &[f32] {
        &self.speech_buffer
    }

    /// Take the speech buffer, clearing it
    pub fn take_speech_buffer(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.speech_buffer)
    }

    /// Get current state
    #[must_use]
    pub const fn state(&self) -> SegmentState {
        self.state
    }

    /// Reset to waiting, restarting the no-speech timer
    pub fn reset(&mut self) {
        self.state = SegmentState::Waiting;
        self.speech_buffer.clear();
        self.silence_counter = 0;
        self.waited = 0;
    }
}

impl Default for SpeechSegmenter {
    fn default() -> Self {
        Self::new(NO_SPEECH_TIMEOUT)
    }
}

/// Calculate RMS energy of audio samples
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn calculate_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
