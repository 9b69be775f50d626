//! Spoken output
//!
//! The [`AudioOutputController`] owns the text-to-speech channel. Every call
//! to [`AudioOutputController::speak`] returns a [`Completion`] that resolves
//! exactly once: when the utterance ends, is superseded, fails, or runs past
//! its watchdog limit. Turn sequencing awaits these completions, so output
//! that is disabled or unavailable still completes immediately.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::permission::PermissionGate;

/// Shortest watchdog limit for any utterance
const WATCHDOG_FLOOR: Duration = Duration::from_secs(5);

/// Watchdog allowance per character of text
const WATCHDOG_PER_CHAR: Duration = Duration::from_millis(100);

/// A voice offered by the speech engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub name: String,
    /// BCP 47 language tag, e.g. `en-US`
    pub lang: String,
    /// Synthesized on-device rather than by a network service
    pub local_service: bool,
    /// The engine's default voice
    pub default: bool,
}

/// Rate, pitch and volume for an utterance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceSettings {
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

/// Calm, slightly slowed delivery
pub const CALM_PRESET: VoiceSettings = VoiceSettings {
    rate: 0.9,
    pitch: 1.0,
    volume: 1.0,
};

/// What the engine is asked to say
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: Option<Voice>,
    pub settings: VoiceSettings,
}

/// Engine-reported synthesis failure; never fatal to a session
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("speech synthesis failed: {0}")]
pub struct SynthesisError(pub String);

/// Platform text-to-speech engine
#[async_trait]
pub trait SpeechEngine: Send + Sync {
    /// Voices the engine can use
    fn voices(&self) -> Vec<Voice>;

    /// Speak one utterance, resolving when playback ends
    ///
    /// # Errors
    ///
    /// Returns error if the engine fails to synthesize or play
    async fn speak(&self, request: &SpeechRequest) -> Result<(), SynthesisError>;

    /// Cancel queued and playing speech
    fn cancel(&self);
}

/// Why an utterance produced no audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Voice output switched off
    Disabled,
    /// Nothing to say
    EmptyText,
    /// Microphone permission not granted
    PermissionNotGranted,
}

/// How an utterance finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechOutcome {
    /// Played to the end
    Finished,
    /// Completed immediately without audio
    Skipped(SkipReason),
    /// Superseded by a newer utterance or stopped
    Cancelled,
    /// Engine never signalled completion within the watchdog limit
    TimedOut,
    /// Engine reported an error
    Failed(SynthesisError),
}

/// Resolves once with the utterance outcome
pub type Completion = oneshot::Receiver<SpeechOutcome>;

struct ActiveUtterance {
    id: u64,
    cancel: oneshot::Sender<()>,
}

/// Owns the speech output channel
pub struct AudioOutputController {
    engine: Arc<dyn SpeechEngine>,
    permission: PermissionGate,
    voice: Option<Voice>,
    settings: VoiceSettings,
    enabled: AtomicBool,
    speaking: Arc<AtomicBool>,
    active: Arc<Mutex<Option<ActiveUtterance>>>,
    next_id: AtomicU64,
}

impl AudioOutputController {
    /// Create a controller, choosing the best voice for `locale`
    #[must_use]
    pub fn new(engine: Arc<dyn SpeechEngine>, permission: PermissionGate, locale: &str) -> Self {
        let voice = select_voice(&engine.voices(), locale);
        match &voice {
            Some(v) => tracing::debug!(voice = %v.name, lang = %v.lang, "speech voice selected"),
            None => tracing::debug!(locale, "no matching voice, using engine default"),
        }

        Self {
            engine,
            permission,
            voice,
            settings: CALM_PRESET,
            enabled: AtomicBool::new(true),
            speaking: Arc::new(AtomicBool::new(false)),
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Speak `text`, superseding anything already playing
    ///
    /// The returned completion always resolves exactly once.
    pub fn speak(&self, text: &str) -> Completion {
        let (done_tx, done_rx) = oneshot::channel();

        if let Some(reason) = self.skip_reason(text) {
            tracing::debug!(?reason, "speech skipped");
            let _ = done_tx.send(SpeechOutcome::Skipped(reason));
            return done_rx;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let previous = lock(&self.active).replace(ActiveUtterance {
            id,
            cancel: cancel_tx,
        });
        if let Some(previous) = previous {
            tracing::debug!(superseded = previous.id, id, "cancelling previous utterance");
            self.engine.cancel();
            let _ = previous.cancel.send(());
        }
        self.speaking.store(true, Ordering::SeqCst);

        let request = SpeechRequest {
            text: text.to_string(),
            voice: self.voice.clone(),
            settings: self.settings,
        };
        let limit = watchdog_limit(text);
        let engine = Arc::clone(&self.engine);
        let active = Arc::clone(&self.active);
        let speaking = Arc::clone(&self.speaking);

        tokio::spawn(async move {
            tracing::debug!(id, chars = request.text.len(), "speaking");
            let outcome = tokio::select! {
                result = engine.speak(&request) => match result {
                    Ok(()) => SpeechOutcome::Finished,
                    Err(e) => {
                        tracing::warn!(id, error = %e, "speech engine error");
                        SpeechOutcome::Failed(e)
                    }
                },
                _ = cancel_rx => SpeechOutcome::Cancelled,
                () = tokio::time::sleep(limit) => {
                    tracing::warn!(id, limit_ms = limit.as_millis(), "speech watchdog fired");
                    engine.cancel();
                    SpeechOutcome::TimedOut
                }
            };

            let mut current = lock(&active);
            if current.as_ref().is_some_and(|a| a.id == id) {
                *current = None;
                speaking.store(false, Ordering::SeqCst);
            }
            drop(current);

            let _ = done_tx.send(outcome);
        });

        done_rx
    }

    /// Cancel anything playing or pending; safe to call when idle
    pub fn stop(&self) {
        if let Some(active) = lock(&self.active).take() {
            tracing::debug!(id = active.id, "stopping speech");
            let _ = active.cancel.send(());
        }
        self.engine.cancel();
        self.speaking.store(false, Ordering::SeqCst);
    }

    /// Switch voice output on or off
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.stop();
        }
    }

    /// Whether voice output is on
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether an utterance is playing
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    /// Voice chosen at construction
    #[must_use]
    pub const fn voice(&self) -> Option<&Voice> {
        self.voice.as_ref()
    }

    fn skip_reason(&self, text: &str) -> Option<SkipReason> {
        if !self.is_enabled() {
            Some(SkipReason::Disabled)
        } else if text.trim().is_empty() {
            Some(SkipReason::EmptyText)
        } else if !self.permission.require_granted() {
            Some(SkipReason::PermissionNotGranted)
        } else {
            None
        }
    }
}

fn lock(active: &Mutex<Option<ActiveUtterance>>) -> MutexGuard<'_, Option<ActiveUtterance>> {
    active
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Longest an utterance may take before the watchdog resets it
#[must_use]
pub fn watchdog_limit(text: &str) -> Duration {
    let chars = u32::try_from(text.chars().count()).unwrap_or(u32::MAX);
    WATCHDOG_FLOOR.max(WATCHDOG_PER_CHAR.saturating_mul(chars))
}

/// Pick a voice for `locale`
///
/// Preference: enhanced or natural voice, then on-device voice, then any
/// voice in the language. `None` leaves the choice to the engine.
#[must_use]
pub fn select_voice(voices: &[Voice], locale: &str) -> Option<Voice> {
    let language = locale
        .split(['-', '_'])
        .next()
        .unwrap_or(locale)
        .to_lowercase();
    let matching = || {
        voices
            .iter()
            .filter(|v| v.lang.to_lowercase().starts_with(&language))
    };

    matching()
        .find(|v| is_enhanced(v))
        .or_else(|| matching().find(|v| v.local_service))
        .or_else(|| matching().next())
        .cloned()
}

fn is_enhanced(voice: &Voice) -> bool {
    let name = voice.name.to_lowercase();
    name.contains("enhanced") || name.contains("natural")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::Notify;

    use super::*;
    use crate::permission::{PermissionState, StaticPermissions};

    #[derive(Clone, Copy)]
    enum Behaviour {
        Instant,
        Fail,
        Hang,
    }

    struct TestEngine {
        behaviour: Behaviour,
        spoken: Mutex<Vec<String>>,
        cancels: AtomicUsize,
        release: Notify,
    }

    impl TestEngine {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                spoken: Mutex::new(Vec::new()),
                cancels: AtomicUsize::new(0),
                release: Notify::new(),
            })
        }
    }

    #[async_trait]
    impl SpeechEngine for TestEngine {
        fn voices(&self) -> Vec<Voice> {
            Vec::new()
        }

        async fn speak(&self, request: &SpeechRequest) -> Result<(), SynthesisError> {
            self.spoken.lock().unwrap().push(request.text.clone());
            match self.behaviour {
                Behaviour::Instant => Ok(()),
                Behaviour::Fail => Err(SynthesisError("synthesis-failed".to_string())),
                Behaviour::Hang => {
                    self.release.notified().await;
                    Ok(())
                }
            }
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn controller(
        engine: Arc<TestEngine>,
        permission: PermissionState,
    ) -> AudioOutputController {
        let gate = PermissionGate::new(Arc::new(StaticPermissions(permission)));
        gate.query_microphone().await;
        AudioOutputController::new(engine, gate, "en-US")
    }

    fn voice(name: &str, lang: &str, local_service: bool) -> Voice {
        Voice {
            name: name.to_string(),
            lang: lang.to_string(),
            local_service,
            default: false,
        }
    }

    #[tokio::test]
    async fn test_speak_finishes() {
        let engine = TestEngine::new(Behaviour::Instant);
        let output = controller(engine.clone(), PermissionState::Granted).await;

        assert_eq!(output.speak("hello").await.unwrap(), SpeechOutcome::Finished);
        assert!(!output.is_speaking());
        assert_eq!(*engine.spoken.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_completion_pending_while_speaking() {
        let engine = TestEngine::new(Behaviour::Hang);
        let output = controller(engine.clone(), PermissionState::Granted).await;

        let mut completion = tokio_test::task::spawn(output.speak("hello"));
        tokio::task::yield_now().await;
        tokio_test::assert_pending!(completion.poll());
        assert!(output.is_speaking());

        engine.release.notify_one();
        assert_eq!(
            completion.into_inner().await.unwrap(),
            SpeechOutcome::Finished
        );
    }

    #[tokio::test]
    async fn test_skips_complete_immediately() {
        let engine = TestEngine::new(Behaviour::Instant);
        let output = controller(engine.clone(), PermissionState::Granted).await;

        assert_eq!(
            output.speak("   ").await.unwrap(),
            SpeechOutcome::Skipped(SkipReason::EmptyText)
        );

        output.set_enabled(false);
        assert_eq!(
            output.speak("hello").await.unwrap(),
            SpeechOutcome::Skipped(SkipReason::Disabled)
        );

        let denied = controller(engine.clone(), PermissionState::Denied).await;
        assert_eq!(
            denied.speak("hello").await.unwrap(),
            SpeechOutcome::Skipped(SkipReason::PermissionNotGranted)
        );

        assert!(engine.spoken.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_utterance_supersedes_previous() {
        let engine = TestEngine::new(Behaviour::Hang);
        let output = controller(engine.clone(), PermissionState::Granted).await;

        let first = output.speak("first");
        let second = output.speak("second");

        assert_eq!(first.await.unwrap(), SpeechOutcome::Cancelled);
        assert!(output.is_speaking());
        assert!(engine.cancels.load(Ordering::SeqCst) >= 1);

        engine.release.notify_one();
        assert_eq!(second.await.unwrap(), SpeechOutcome::Finished);
        assert!(!output.is_speaking());
    }

    #[tokio::test]
    async fn test_engine_error_still_completes() {
        let engine = TestEngine::new(Behaviour::Fail);
        let output = controller(engine, PermissionState::Granted).await;

        assert!(matches!(
            output.speak("hello").await.unwrap(),
            SpeechOutcome::Failed(_)
        ));
        assert!(!output.is_speaking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_resets_stuck_utterance() {
        let engine = TestEngine::new(Behaviour::Hang);
        let output = controller(engine.clone(), PermissionState::Granted).await;

        let completion = output.speak("hello");
        assert_eq!(completion.await.unwrap(), SpeechOutcome::TimedOut);
        assert!(!output.is_speaking());
        assert_eq!(engine.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_and_is_idempotent() {
        let engine = TestEngine::new(Behaviour::Hang);
        let output = controller(engine, PermissionState::Granted).await;

        output.stop();
        assert!(!output.is_speaking());

        let completion = output.speak("hello");
        output.stop();
        output.stop();
        assert_eq!(completion.await.unwrap(), SpeechOutcome::Cancelled);
        assert!(!output.is_speaking());
    }

    #[test]
    fn test_watchdog_limit_scales_with_length() {
        assert_eq!(watchdog_limit("hi"), Duration::from_secs(5));
        assert_eq!(watchdog_limit(&"a".repeat(100)), Duration::from_secs(10));
    }

    #[test]
    fn test_voice_preference_order() {
        let voices = vec![
            voice("Daniel", "en-GB", false),
            voice("Samantha", "en-US", true),
            voice("Ava (Enhanced)", "en-US", false),
            voice("Thomas", "fr-FR", true),
        ];
        assert_eq!(select_voice(&voices, "en-US").unwrap().name, "Ava (Enhanced)");
        assert_eq!(select_voice(&voices[..2], "en-US").unwrap().name, "Samantha");
        assert_eq!(select_voice(&voices[..1], "en-US").unwrap().name, "Daniel");
        assert_eq!(select_voice(&voices, "fr_FR").unwrap().name, "Thomas");
        assert!(select_voice(&voices, "de-DE").is_none());
    }
}
