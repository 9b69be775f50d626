//! Speech input and output channels

pub mod cloud;
pub mod input;
pub mod output;

pub use cloud::{CloudRecognizer, CloudSynthesizer, SilentSynthesizer, UnsupportedRecognizer};
pub use input::{
    EngineEvent, ErrorPolicy, InputSettings, MIN_TRANSCRIPT_CHARS, RecognitionEngine,
    RecognitionError, RecognitionErrorCode, SpeechEvent, SpeechInputController, Transcript,
};
pub use output::{
    AudioOutputController, CALM_PRESET, Completion, SkipReason, SpeechEngine, SpeechOutcome,
    SpeechRequest, SynthesisError, Voice, VoiceSettings,
};
