//! Audio plumbing for the cloud speech engines
//!
//! Microphone capture, utterance segmentation, speaker playback, and the
//! Whisper and OpenAI TTS clients.

mod capture;
mod playback;
mod resample;
mod segmenter;
mod stt;
mod tts;

pub use capture::{AudioCapture, SAMPLE_RATE, samples_to_wav};
pub use playback::{AudioPlayback, Clip, CurrentPlayback, PlaybackCancel, PlaybackEnd, decode_mp3};
pub use resample::{StreamResampler, resample};
pub use segmenter::{NO_SPEECH_TIMEOUT, SegmentState, SpeechSegmenter, calculate_energy};
pub use stt::{SpeechToText, SttFailure, WHISPER_URL};
pub use tts::{OPENAI_TTS_URL, OPENAI_VOICES, TextToSpeech};
