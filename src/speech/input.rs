//! Spoken input
//!
//! The [`SpeechInputController`] owns the speech-to-text channel. It runs at
//! most one recognition attempt at a time, classifies engine errors, and in
//! continuous mode restarts listening after a clean end.
//!
//! Every attempt gets a generation number. `start` and `stop` bump it, so
//! events and scheduled restarts from an older attempt are dropped. Restart
//! tasks hold only a weak reference to the controller and give up once it
//! has been torn down.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::permission::PermissionGate;

/// Transcripts shorter than this (after trimming) are not answers
pub const MIN_TRANSCRIPT_CHARS: usize = 3;

/// One recognition result
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Engine confidence in `0.0..=1.0`; `1.0` when the engine doesn't score
    pub confidence: f32,
}

impl Transcript {
    /// Create a transcript
    #[must_use]
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }

    /// Trimmed text
    #[must_use]
    pub fn trimmed(&self) -> &str {
        self.text.trim()
    }

    /// Whether the transcript is long enough to act on
    #[must_use]
    pub fn is_answer(&self, min_chars: usize) -> bool {
        self.trimmed().chars().count() >= min_chars
    }
}

/// Platform recognition error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorCode {
    NotAllowed,
    ServiceNotAllowed,
    NoSpeech,
    AudioCapture,
    Network,
    Aborted,
    Other(String),
}

impl RecognitionErrorCode {
    /// Map a platform error name (`not-allowed`, `no-speech`, ...)
    #[must_use]
    pub fn from_platform(code: &str) -> Self {
        match code {
            "not-allowed" => Self::NotAllowed,
            "service-not-allowed" => Self::ServiceNotAllowed,
            "no-speech" => Self::NoSpeech,
            "audio-capture" => Self::AudioCapture,
            "network" => Self::Network,
            "aborted" => Self::Aborted,
            other => Self::Other(other.to_string()),
        }
    }

    /// How the error is handled
    #[must_use]
    pub const fn policy(&self) -> ErrorPolicy {
        match self {
            Self::NotAllowed | Self::ServiceNotAllowed => ErrorPolicy {
                user_facing: true,
                revoke_permission: true,
            },
            Self::NoSpeech | Self::Aborted => ErrorPolicy {
                user_facing: false,
                revoke_permission: false,
            },
            Self::AudioCapture | Self::Network | Self::Other(_) => ErrorPolicy {
                user_facing: true,
                revoke_permission: false,
            },
        }
    }
}

impl std::fmt::Display for RecognitionErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotAllowed => write!(f, "not-allowed"),
            Self::ServiceNotAllowed => write!(f, "service-not-allowed"),
            Self::NoSpeech => write!(f, "no-speech"),
            Self::AudioCapture => write!(f, "audio-capture"),
            Self::Network => write!(f, "network"),
            Self::Aborted => write!(f, "aborted"),
            Self::Other(code) => write!(f, "{code}"),
        }
    }
}

/// Whether an error is announced and whether it revokes the microphone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    pub user_facing: bool,
    pub revoke_permission: bool,
}

/// A classified recognition failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("speech recognition error: {code}")]
pub struct RecognitionError {
    pub code: RecognitionErrorCode,
}

impl RecognitionError {
    /// Wrap a platform code
    #[must_use]
    pub const fn new(code: RecognitionErrorCode) -> Self {
        Self { code }
    }

    /// Whether the user hears about it
    #[must_use]
    pub const fn is_user_facing(&self) -> bool {
        self.code.policy().user_facing
    }

    /// Message for the user
    #[must_use]
    pub fn user_message(&self) -> String {
        match &self.code {
            RecognitionErrorCode::NotAllowed | RecognitionErrorCode::ServiceNotAllowed => {
                "Microphone access was denied. Please allow microphone access to ask questions."
                    .to_string()
            }
            RecognitionErrorCode::NoSpeech => "I didn't hear anything.".to_string(),
            RecognitionErrorCode::AudioCapture => {
                "I couldn't access the microphone. Please check that it is connected.".to_string()
            }
            RecognitionErrorCode::Network => {
                "Speech recognition needs a network connection. Please check your connection."
                    .to_string()
            }
            RecognitionErrorCode::Aborted => "Listening was cancelled.".to_string(),
            RecognitionErrorCode::Other(code) => {
                format!("Speech recognition failed ({code}). Please try again.")
            }
        }
    }
}

/// Events an engine reports for one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Final transcript
    Result(Transcript),
    /// Attempt failed; `End` follows
    Error(RecognitionErrorCode),
    /// Attempt finished
    End,
}

/// Platform speech-to-text engine
pub trait RecognitionEngine: Send + Sync {
    /// Whether recognition is available at all
    fn is_supported(&self) -> bool;

    /// Begin one attempt, reporting on `events` and finishing with `End`
    ///
    /// # Errors
    ///
    /// Returns the platform error if the attempt cannot begin
    fn start(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Result<(), RecognitionErrorCode>;

    /// End the current attempt
    fn stop(&self);
}

/// What the controller reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum SpeechEvent {
    /// Recognition produced a transcript
    Transcript { attempt: u64, transcript: Transcript },
    /// Recognition failed
    Failed { attempt: u64, error: RecognitionError },
    /// Attempt ended; `clean` when no error was reported
    Ended { attempt: u64, clean: bool },
}

/// Restart behaviour
#[derive(Debug, Clone, Copy)]
pub struct InputSettings {
    /// Restart listening after a clean end
    pub continuous: bool,
    /// Delay before restarting
    pub restart_delay: Duration,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            continuous: true,
            restart_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
struct InputState {
    listening: bool,
    generation: u64,
    suspended: bool,
    /// Last attempt ended without error and nothing stopped it since
    restartable: bool,
    torn_down: bool,
}

struct Inner {
    engine: Arc<dyn RecognitionEngine>,
    permission: PermissionGate,
    camera_active: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<SpeechEvent>,
    settings: InputSettings,
    state: Mutex<InputState>,
}

/// Owns the speech-to-text channel
pub struct SpeechInputController {
    inner: Arc<Inner>,
}

impl SpeechInputController {
    /// Create a controller and the receiver for its events
    #[must_use]
    pub fn new(
        engine: Arc<dyn RecognitionEngine>,
        permission: PermissionGate,
        camera_active: watch::Receiver<bool>,
        settings: InputSettings,
    ) -> (Self, mpsc::UnboundedReceiver<SpeechEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            engine,
            permission,
            camera_active,
            events,
            settings,
            state: Mutex::new(InputState::default()),
        });
        (Self { inner }, rx)
    }

    /// Start listening
    ///
    /// If an attempt is already running it is stopped instead and an
    /// `aborted` failure is reported. Returns the new attempt number when
    /// listening began.
    pub fn start(&self) -> Option<u64> {
        Inner::start(&self.inner)
    }

    /// Stop the current attempt; no-op when idle
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Hold off automatic restarts
    pub fn suspend(&self) {
        self.inner.lock().suspended = true;
    }

    /// Allow automatic restarts again
    ///
    /// Schedules a restart when the last attempt ended cleanly and nothing
    /// has stopped listening since.
    pub fn resume(&self) {
        let generation = {
            let mut state = self.inner.lock();
            state.suspended = false;
            if state.listening {
                return;
            }
            state.generation
        };
        Inner::schedule_restart(&self.inner, generation);
    }

    /// Stop listening for good; later restarts and events are ignored
    pub fn shutdown(&self) {
        self.inner.stop();
        self.inner.lock().torn_down = true;
    }

    /// Whether an attempt is running
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.inner.lock().listening
    }

    /// Whether recognition is available
    #[must_use]
    pub fn is_supported(&self) -> bool {
        self.inner.engine.is_supported()
    }
}

impl Drop for SpeechInputController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, InputState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn start(this: &Arc<Self>) -> Option<u64> {
        let generation = {
            let mut state = this.lock();
            if state.torn_down {
                return None;
            }
            if state.listening {
                let attempt = state.generation;
                drop(state);
                tracing::debug!(attempt, "start while listening, stopping current attempt");
                this.stop();
                this.emit(SpeechEvent::Failed {
                    attempt,
                    error: RecognitionError::new(RecognitionErrorCode::Aborted),
                });
                return None;
            }
            state.generation += 1;
            state.listening = true;
            state.restartable = false;
            state.generation
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(code) = this.engine.start(tx) {
            this.lock().listening = false;
            tracing::warn!(attempt = generation, error = %code, "recognition failed to start");
            this.fail(generation, code);
            return None;
        }

        tracing::debug!(attempt = generation, "listening");
        tokio::spawn(pump(Arc::downgrade(this), generation, rx));
        Some(generation)
    }

    fn stop(&self) {
        let was_listening = {
            let mut state = self.lock();
            state.generation += 1;
            state.restartable = false;
            std::mem::replace(&mut state.listening, false)
        };
        if was_listening {
            self.engine.stop();
            tracing::debug!("listening stopped");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        !state.torn_down && state.generation == generation
    }

    /// Mark the attempt finished; false when it was superseded
    fn finish(&self, generation: u64, clean: bool) -> bool {
        let mut state = self.lock();
        if state.torn_down || state.generation != generation {
            return false;
        }
        state.listening = false;
        state.restartable = clean;
        true
    }

    fn fail(&self, attempt: u64, code: RecognitionErrorCode) {
        let policy = code.policy();
        if policy.revoke_permission {
            self.permission.revoke();
        }
        if policy.user_facing {
            tracing::warn!(attempt, error = %code, "speech recognition error");
        } else {
            tracing::debug!(attempt, error = %code, "speech recognition ended without result");
        }
        self.emit(SpeechEvent::Failed {
            attempt,
            error: RecognitionError::new(code),
        });
    }

    fn emit(&self, event: SpeechEvent) {
        let _ = self.events.send(event);
    }

    fn may_restart(&self, generation: u64) -> bool {
        let state = self.lock();
        self.settings.continuous
            && !state.torn_down
            && !state.suspended
            && !state.listening
            && state.restartable
            && state.generation == generation
            && *self.camera_active.borrow()
            && self.permission.require_granted()
    }

    fn schedule_restart(this: &Arc<Self>, generation: u64) {
        if !this.may_restart(generation) {
            return;
        }

        let delay = this.settings.restart_delay;
        let weak = Arc::downgrade(this);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.may_restart(generation) {
                tracing::debug!(after = generation, "restarting recognition");
                Self::start(&inner);
            }
        });
    }
}

async fn pump(weak: Weak<Inner>, generation: u64, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
    let mut clean = true;

    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.is_current(generation) {
            return;
        }
        match event {
            EngineEvent::Result(transcript) => {
                tracing::info!(
                    attempt = generation,
                    text = %transcript.text,
                    confidence = transcript.confidence,
                    "transcript received"
                );
                inner.emit(SpeechEvent::Transcript {
                    attempt: generation,
                    transcript,
                });
            }
            EngineEvent::Error(code) => {
                clean = false;
                inner.fail(generation, code);
            }
            EngineEvent::End => break,
        }
    }

    let Some(inner) = weak.upgrade() else {
        return;
    };
    if !inner.finish(generation, clean) {
        return;
    }
    inner.emit(SpeechEvent::Ended {
        attempt: generation,
        clean,
    });
    if clean {
        Inner::schedule_restart(&inner, generation);
    }
}
