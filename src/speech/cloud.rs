//! Cloud speech engines
//!
//! Desktop backends for the speech channels: local microphone capture with
//! Whisper transcription, and OpenAI TTS with local playback. Both keep the
//! `!Send` cpal streams on blocking threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::HostTrait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::input::{EngineEvent, RecognitionEngine, RecognitionErrorCode, Transcript};
use super::output::{SpeechEngine, SpeechRequest, SynthesisError, Voice};
use crate::voice::{
    AudioCapture, AudioPlayback, CurrentPlayback, NO_SPEECH_TIMEOUT, SAMPLE_RATE, SegmentState,
    SpeechSegmenter, SpeechToText, SttFailure, TextToSpeech, OPENAI_VOICES, decode_mp3,
    samples_to_wav,
};

/// How often the capture buffer is drained
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest single utterance before it is cut off and transcribed
const MAX_UTTERANCE: Duration = Duration::from_secs(30);

/// Microphone plus Whisper
pub struct CloudRecognizer {
    stt: Arc<SpeechToText>,
    no_speech: Duration,
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl CloudRecognizer {
    /// Create a recognizer using `stt` for transcription
    #[must_use]
    pub fn new(stt: SpeechToText) -> Self {
        Self {
            stt: Arc::new(stt),
            no_speech: NO_SPEECH_TIMEOUT,
            current: Mutex::new(None),
        }
    }

    fn replace_current(&self, next: Option<Arc<AtomicBool>>) {
        let previous = std::mem::replace(
            &mut *self
                .current
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            next,
        );
        if let Some(previous) = previous {
            previous.store(true, Ordering::SeqCst);
        }
    }
}

impl RecognitionEngine for CloudRecognizer {
    fn is_supported(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn start(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Result<(), RecognitionErrorCode> {
        let runtime =
            Handle::try_current().map_err(|e| RecognitionErrorCode::Other(e.to_string()))?;
        let stop = Arc::new(AtomicBool::new(false));
        self.replace_current(Some(Arc::clone(&stop)));

        let stt = Arc::clone(&self.stt);
        let no_speech = self.no_speech;

        std::thread::Builder::new()
            .name("lens-listen".to_string())
            .spawn(move || {
                if let Some(event) = listen(&runtime, &stt, no_speech, &stop) {
                    let _ = events.send(event);
                }
                let _ = events.send(EngineEvent::End);
            })
            .map_err(|e| RecognitionErrorCode::Other(e.to_string()))?;

        Ok(())
    }

    fn stop(&self) {
        self.replace_current(None);
    }
}

/// Record one utterance and transcribe it; `None` when stopped
fn listen(
    runtime: &Handle,
    stt: &SpeechToText,
    no_speech: Duration,
    stop: &AtomicBool,
) -> Option<EngineEvent> {
    let samples = match record_utterance(no_speech, stop) {
        Ok(Some(samples)) => samples,
        Ok(None) => return None,
        Err(code) => return Some(EngineEvent::Error(code)),
    };

    let wav = match samples_to_wav(&samples, SAMPLE_RATE) {
        Ok(wav) => wav,
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode utterance");
            return Some(EngineEvent::Error(RecognitionErrorCode::AudioCapture));
        }
    };

    let result = runtime.block_on(stt.transcribe(&wav));
    if stop.load(Ordering::SeqCst) {
        return None;
    }

    Some(match result {
        Ok(text) if text.trim().is_empty() => EngineEvent::Error(RecognitionErrorCode::NoSpeech),
        Ok(text) => EngineEvent::Result(Transcript::new(text.trim(), 1.0)),
        Err(failure) => {
            if failure == SttFailure::Unauthorized {
                tracing::error!("Whisper rejected the API key");
            }
            EngineEvent::Error(RecognitionErrorCode::Network)
        }
    })
}

fn record_utterance(
    no_speech: Duration,
    stop: &AtomicBool,
) -> Result<Option<Vec<f32>>, RecognitionErrorCode> {
    let mut capture = AudioCapture::new().map_err(|e| {
        tracing::warn!(error = %e, "microphone unavailable");
        RecognitionErrorCode::AudioCapture
    })?;
    capture.start().map_err(|e| {
        tracing::warn!(error = %e, "microphone failed to start");
        RecognitionErrorCode::AudioCapture
    })?;

    let mut segmenter = SpeechSegmenter::new(no_speech);
    let started = Instant::now();

    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);

        match segmenter.process(&capture.take_buffer()) {
            SegmentState::Complete => return Ok(Some(segmenter.take_speech_buffer())),
            SegmentState::NoSpeech => return Err(RecognitionErrorCode::NoSpeech),
            SegmentState::Waiting if started.elapsed() > no_speech => {
                // device delivered no samples at all
                return Err(RecognitionErrorCode::NoSpeech);
            }
            SegmentState::Speaking if started.elapsed() > no_speech + MAX_UTTERANCE => {
                tracing::debug!("utterance cut off at maximum length");
                return Ok(Some(segmenter.take_speech_buffer()));
            }
            SegmentState::Waiting | SegmentState::Speaking => {}
        }
    }
}

/// OpenAI TTS plus speaker playback
pub struct CloudSynthesizer {
    tts: TextToSpeech,
    voice: String,
    locale: String,
    playback: Arc<CurrentPlayback>,
}

impl CloudSynthesizer {
    /// Create a synthesizer speaking with `voice` in `locale`
    #[must_use]
    pub fn new(tts: TextToSpeech, voice: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            tts,
            voice: voice.into(),
            locale: locale.into(),
            playback: Arc::new(CurrentPlayback::default()),
        }
    }
}

#[async_trait]
impl SpeechEngine for CloudSynthesizer {
    /// The configured voice comes first so it wins voice selection
    fn voices(&self) -> Vec<Voice> {
        let configured = std::iter::once(self.voice.as_str());
        let others = OPENAI_VOICES.iter().copied().filter(|v| *v != self.voice);
        configured
            .chain(others)
            .map(|name| Voice {
                name: name.to_string(),
                lang: self.locale.clone(),
                local_service: false,
                default: name == self.voice,
            })
            .collect()
    }

    async fn speak(&self, request: &SpeechRequest) -> Result<(), SynthesisError> {
        let cancel = self.playback.begin();
        let voice = request
            .voice
            .as_ref()
            .map_or(self.voice.as_str(), |v| v.name.as_str());

        let mp3 = self
            .tts
            .synthesize(&request.text, voice, request.settings.rate)
            .await
            .map_err(|e| SynthesisError(e.to_string()))?;
        if cancel.flag().load(Ordering::SeqCst) {
            return Ok(());
        }

        let volume = request.settings.volume;
        tokio::task::spawn_blocking(move || {
            let clip = decode_mp3(&mp3)?;
            AudioPlayback::new()?.play(&clip, volume, cancel.flag())
        })
        .await
        .map_err(|e| SynthesisError(e.to_string()))?
        .map_err(|e| SynthesisError(e.to_string()))?;

        Ok(())
    }

    fn cancel(&self) {
        self.playback.cancel();
    }
}

/// Stand-in when no recognizer can be built; reports itself unsupported
pub struct UnsupportedRecognizer;

impl RecognitionEngine for UnsupportedRecognizer {
    fn is_supported(&self) -> bool {
        false
    }

    fn start(&self, _events: mpsc::UnboundedSender<EngineEvent>) -> Result<(), RecognitionErrorCode> {
        Err(RecognitionErrorCode::Other("unsupported".to_string()))
    }

    fn stop(&self) {}
}

/// Stand-in when no synthesizer can be built; finishes every utterance at once
pub struct SilentSynthesizer;

#[async_trait]
impl SpeechEngine for SilentSynthesizer {
    fn voices(&self) -> Vec<Voice> {
        Vec::new()
    }

    async fn speak(&self, _request: &SpeechRequest) -> Result<(), SynthesisError> {
        Ok(())
    }

    fn cancel(&self) {}
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;

    use super::*;

    #[test]
    fn test_configured_voice_listed_first() {
        let tts = TextToSpeech::new_openai(SecretString::from("sk-test"), "tts-1".to_string())
            .unwrap();
        let synth = CloudSynthesizer::new(tts, "nova", "en-US");
        let voices = synth.voices();

        assert_eq!(voices[0].name, "nova");
        assert!(voices[0].default);
        assert_eq!(voices.len(), OPENAI_VOICES.len());
        assert!(voices.iter().all(|v| v.lang == "en-US" && !v.local_service));
    }
}
