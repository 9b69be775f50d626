//! Session orchestration
//!
//! The [`SessionOrchestrator`] is an actor that owns every controller and
//! runs one question-and-answer turn at a time:
//!
//! ```text
//! Idle → AwaitingPermission → Prompting → Listening → Capturing
//!      → Analyzing → Speaking → Idle
//! ```
//!
//! Each turn is a linear sequence of awaited steps. While a step waits, the
//! actor keeps serving commands from its [`SessionHandle`]; a new turn, a
//! stop, or a shutdown interrupts the step, releases speech and recognition,
//! and drops whatever the step was waiting on. A vision query that is still
//! in flight finishes in the background and its result is discarded.

pub mod messages;
mod phase;

pub use phase::{SessionPhase, SessionSnapshot};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::camera::{CameraDevice, CaptureController, CaptureError, Facing, VideoDeviceInfo};
use crate::permission::PermissionGate;
use crate::speech::{
    AudioOutputController, InputSettings, MIN_TRANSCRIPT_CHARS, RecognitionEngine,
    RecognitionError, RecognitionErrorCode, SpeechEngine, SpeechEvent, SpeechInputController,
    Transcript,
};
use crate::vision::{QueryError, VisionQuery};
use crate::{Error, Result};

/// Depth of the command queue
const COMMAND_BUFFER: usize = 32;

/// Platform capabilities a session runs on
pub struct SessionComponents {
    pub permission: PermissionGate,
    pub camera: Arc<dyn CameraDevice>,
    pub recognizer: Arc<dyn RecognitionEngine>,
    pub synthesizer: Arc<dyn SpeechEngine>,
    pub vision: Arc<dyn VisionQuery>,
}

/// Session behaviour
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Locale for voice selection
    pub locale: String,
    /// Speak prompts and answers
    pub speech_output: bool,
    /// Keep listening between turns
    pub continuous: bool,
    /// Delay before listening restarts
    pub restart_delay: Duration,
    /// Shortest transcript treated as a question
    pub min_transcript_chars: usize,
    /// Re-prompts allowed per turn before giving up
    pub max_reprompts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            locale: "en-US".to_string(),
            speech_output: true,
            continuous: true,
            restart_delay: Duration::from_millis(500),
            min_transcript_chars: MIN_TRANSCRIPT_CHARS,
            max_reprompts: 2,
        }
    }
}

/// Requests accepted by the orchestrator
#[derive(Debug)]
pub enum SessionCommand {
    /// Start a turn, cancelling any turn in progress
    BeginTurn,
    /// Cancel the turn in progress and silence output
    Stop,
    StartCamera {
        facing: Facing,
        reply: oneshot::Sender<std::result::Result<Facing, CaptureError>>,
    },
    /// Release the camera; ends a turn in progress
    StopCamera,
    SwitchFacing {
        reply: oneshot::Sender<std::result::Result<Facing, CaptureError>>,
    },
    ListCameras {
        reply: oneshot::Sender<Vec<VideoDeviceInfo>>,
    },
    SetSpeechOutput(bool),
    Shutdown,
}

/// Cloneable client for a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    /// Start a turn
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session has shut down
    pub async fn begin_turn(&self) -> Result<()> {
        self.send(SessionCommand::BeginTurn).await
    }

    /// Cancel the turn in progress
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session has shut down
    pub async fn stop(&self) -> Result<()> {
        self.send(SessionCommand::Stop).await
    }

    /// Open the camera
    ///
    /// # Errors
    ///
    /// Returns the capture failure, or `SessionClosed`
    pub async fn start_camera(&self, facing: Facing) -> Result<Facing> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::StartCamera { facing, reply }).await?;
        Ok(rx.await.map_err(|_| Error::SessionClosed)??)
    }

    /// Release the camera
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session has shut down
    pub async fn stop_camera(&self) -> Result<()> {
        self.send(SessionCommand::StopCamera).await
    }

    /// Switch to the other camera
    ///
    /// # Errors
    ///
    /// Returns the capture failure, or `SessionClosed`
    pub async fn switch_facing(&self) -> Result<Facing> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::SwitchFacing { reply }).await?;
        Ok(rx.await.map_err(|_| Error::SessionClosed)??)
    }

    /// List video inputs
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session has shut down
    pub async fn cameras(&self) -> Result<Vec<VideoDeviceInfo>> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::ListCameras { reply }).await?;
        rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Turn spoken output on or off
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session has shut down
    pub async fn set_speech_output(&self, enabled: bool) -> Result<()> {
        self.send(SessionCommand::SetSpeechOutput(enabled)).await
    }

    /// Tear the session down
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session has already shut down
    pub async fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown).await
    }

    /// Current state
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Watch state changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Wait until the state satisfies `predicate`
    ///
    /// # Errors
    ///
    /// Returns `SessionClosed` if the session ends first
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let mut state = self.state.clone();
        let snapshot = state
            .wait_for(predicate)
            .await
            .map_err(|_| Error::SessionClosed)?;
        Ok(snapshot.clone())
    }

    async fn send(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::SessionClosed)
    }
}

/// How a turn is entered
#[derive(Debug)]
enum TurnEntry {
    /// User asked; prompt and listen
    Prompt,
    /// Continuous listening already heard the question
    Heard(Transcript),
}

/// Why a waiting step gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Restart,
    Stop,
    Shutdown,
}

/// What a recognition attempt produced
enum Heard {
    Transcript(Transcript),
    Failed(RecognitionError),
    Nothing,
}

/// Outcome of one select over recognition and commands
enum ListenStep {
    Event(Option<SpeechEvent>),
    Command(Option<SessionCommand>),
}

/// Whether the actor keeps running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

/// Owns the controllers and runs turns
pub struct SessionOrchestrator {
    permission: PermissionGate,
    capture: CaptureController,
    input: SpeechInputController,
    speech_events: mpsc::UnboundedReceiver<SpeechEvent>,
    output: AudioOutputController,
    vision: Arc<dyn VisionQuery>,
    settings: SessionSettings,
    commands: mpsc::Receiver<SessionCommand>,
    state: watch::Sender<SessionSnapshot>,
    /// Newest recognition attempt started by a turn
    turn_attempt: u64,
}

impl SessionOrchestrator {
    /// Build a session from its components
    #[must_use]
    pub fn new(components: SessionComponents, settings: SessionSettings) -> (Self, SessionHandle) {
        let SessionComponents {
            permission,
            camera,
            recognizer,
            synthesizer,
            vision,
        } = components;

        let capture = CaptureController::new(camera);
        let (input, speech_events) = SpeechInputController::new(
            recognizer,
            permission.clone(),
            capture.subscribe(),
            InputSettings {
                continuous: settings.continuous,
                restart_delay: settings.restart_delay,
            },
        );
        let output = AudioOutputController::new(synthesizer, permission.clone(), &settings.locale);
        output.set_enabled(settings.speech_output);

        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (state, state_rx) = watch::channel(SessionSnapshot {
            facing: capture.facing(),
            speech_output: settings.speech_output,
            ..SessionSnapshot::default()
        });

        let orchestrator = Self {
            permission,
            capture,
            input,
            speech_events,
            output,
            vision,
            settings,
            commands,
            state,
            turn_attempt: 0,
        };
        let handle = SessionHandle {
            commands: command_tx,
            state: state_rx,
        };
        (orchestrator, handle)
    }

    /// Build a session and run it on the current runtime
    #[must_use]
    pub fn spawn(
        components: SessionComponents,
        settings: SessionSettings,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (orchestrator, handle) = Self::new(components, settings);
        (handle, tokio::spawn(orchestrator.run()))
    }

    /// Serve commands until shutdown or every handle is dropped
    pub async fn run(mut self) {
        tracing::info!("session started");

        loop {
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_idle_command(command).await,
                    None => Flow::Shutdown,
                },
                Some(event) = self.speech_events.recv() => self.on_idle_speech(event).await,
            };
            if flow == Flow::Shutdown {
                break;
            }
        }

        self.teardown();
        tracing::info!("session ended");
    }

    async fn on_idle_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::BeginTurn => self.run_turns(TurnEntry::Prompt).await,
            SessionCommand::Stop => {
                self.cancel_activity();
                self.set_status(messages::STOPPED);
                Flow::Continue
            }
            SessionCommand::StopCamera => {
                self.stop_camera();
                Flow::Continue
            }
            SessionCommand::Shutdown => Flow::Shutdown,
            other => {
                self.serve(other).await;
                Flow::Continue
            }
        }
    }

    /// Recognition while no turn runs comes from continuous listening
    async fn on_idle_speech(&mut self, event: SpeechEvent) -> Flow {
        match event {
            SpeechEvent::Transcript {
                attempt,
                transcript,
            } if attempt > self.turn_attempt => {
                if transcript.is_answer(self.settings.min_transcript_chars) {
                    tracing::info!(attempt, "question heard while idle");
                    self.run_turns(TurnEntry::Heard(transcript)).await
                } else {
                    tracing::debug!(attempt, text = %transcript.text, "ignoring short idle transcript");
                    Flow::Continue
                }
            }
            SpeechEvent::Failed { attempt, error }
                if attempt > self.turn_attempt && error.is_user_facing() =>
            {
                let message = error.user_message();
                self.state.send_modify(|s| {
                    s.last_error = Some(message.clone());
                    s.status = Some(message.clone());
                });
                // completes on its own; nothing waits on it while idle
                drop(self.output.speak(&message));
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    /// Run a turn, and the turns that interrupt it
    async fn run_turns(&mut self, entry: TurnEntry) -> Flow {
        let mut next = Some(entry);
        while let Some(entry) = next.take() {
            match self.turn(entry).await {
                None | Some(Interrupt::Stop) => {}
                Some(Interrupt::Restart) => next = Some(TurnEntry::Prompt),
                Some(Interrupt::Shutdown) => return Flow::Shutdown,
            }
        }
        Flow::Continue
    }

    async fn turn(&mut self, entry: TurnEntry) -> Option<Interrupt> {
        self.input.suspend();
        match entry {
            // the attempt that heard the question ends on its own, and its
            // clean end is what lets listening resume after this turn
            TurnEntry::Heard(_) => self.output.stop(),
            TurnEntry::Prompt => self.cancel_activity(),
        }

        let mut turn = 0;
        self.state.send_modify(|s| {
            s.turn += 1;
            s.phase = SessionPhase::AwaitingPermission;
            s.last_error = None;
            s.status = None;
            turn = s.turn;
        });
        tracing::info!(turn, "turn started");

        let result = self.turn_steps(entry).await;

        if let Err(interrupt) = result {
            tracing::info!(turn, ?interrupt, "turn interrupted");
            self.cancel_activity();
        }
        self.set_phase(SessionPhase::Idle);
        if result != Err(Interrupt::Shutdown) {
            self.input.resume();
        }
        tracing::debug!(turn, "turn finished");
        result.err()
    }

    async fn turn_steps(&mut self, entry: TurnEntry) -> std::result::Result<(), Interrupt> {
        if !self.input.is_supported() {
            return self.fail(messages::RECOGNITION_UNSUPPORTED).await;
        }
        if !self.permission.require_granted() {
            self.permission.query_microphone().await;
        }
        if !self.permission.require_granted() {
            return self.fail(messages::MICROPHONE_REQUIRED).await;
        }
        if !self.capture.is_active() {
            return self.fail(messages::CAMERA_INACTIVE).await;
        }

        let transcript = match entry {
            TurnEntry::Heard(transcript) => transcript,
            TurnEntry::Prompt => match self.ask_for_question().await? {
                Some(transcript) => transcript,
                None => return Ok(()),
            },
        };
        let question = transcript.trimmed().to_string();
        self.state
            .send_modify(|s| s.last_transcript = Some(question.clone()));

        self.say(&messages::heard(&question)).await?;

        self.set_phase(SessionPhase::Capturing);
        let image = match self.capture.capture_frame() {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                return self.fail(&e.user_message()).await;
            }
        };

        self.set_phase(SessionPhase::Analyzing);
        let (tx, rx) = oneshot::channel();
        let vision = Arc::clone(&self.vision);
        tokio::spawn(async move {
            let result = vision.query(&image, &question).await;
            if tx.send(result).is_err() {
                tracing::debug!("vision result arrived after the turn ended, discarded");
            }
        });

        let result = self
            .interruptible(rx)
            .await?
            .unwrap_or_else(|_| Err(QueryError::Transport("vision task ended".to_string())));

        match result {
            Ok(answer) => {
                self.state.send_modify(|s| {
                    s.last_answer = Some(answer.clone());
                    s.last_error = None;
                });
                self.set_phase(SessionPhase::Speaking);
                let completion = self.output.speak(&answer);
                self.interruptible(completion).await?;
                self.state.send_modify(|s| s.completed_turns += 1);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "vision query failed");
                let message = e.user_message();
                self.record_error(message);
                self.set_phase(SessionPhase::Speaking);
                self.say(message).await
            }
        }
    }

    /// Prompt, listen, and re-prompt until a question is heard
    ///
    /// `None` means the turn already reported why it is ending.
    async fn ask_for_question(&mut self) -> std::result::Result<Option<Transcript>, Interrupt> {
        let mut prompt = messages::LISTENING;
        let mut reprompts = 0;

        loop {
            self.set_phase(SessionPhase::Prompting);
            self.set_status(prompt);
            let completion = self.output.speak(prompt);
            self.interruptible(completion).await?;

            // anything queued belongs to attempts that no longer matter
            while self.speech_events.try_recv().is_ok() {}

            self.set_phase(SessionPhase::Listening);
            let heard = match self.input.start() {
                Some(attempt) => {
                    self.turn_attempt = attempt;
                    self.await_transcript(attempt).await?
                }
                None => Heard::Failed(self.start_failure()),
            };

            match heard {
                Heard::Transcript(transcript)
                    if transcript.is_answer(self.settings.min_transcript_chars) =>
                {
                    return Ok(Some(transcript));
                }
                Heard::Transcript(transcript) => {
                    tracing::debug!(text = %transcript.text, "transcript too short");
                    let text = transcript.trimmed().to_string();
                    self.state.send_modify(|s| s.last_transcript = Some(text));
                }
                Heard::Failed(error) if error.is_user_facing() => {
                    self.fail(&error.user_message()).await?;
                    return Ok(None);
                }
                Heard::Failed(_) | Heard::Nothing => {
                    tracing::debug!("no question heard");
                }
            }

            reprompts += 1;
            if reprompts > self.settings.max_reprompts {
                tracing::info!(reprompts, "giving up on hearing a question");
                self.set_phase(SessionPhase::Speaking);
                self.say(messages::GIVE_UP).await?;
                return Ok(None);
            }
            prompt = messages::DID_NOT_CATCH;
        }
    }

    /// The failure reported by a recognition attempt that never began
    fn start_failure(&mut self) -> RecognitionError {
        let mut failure = None;
        while let Ok(event) = self.speech_events.try_recv() {
            if let SpeechEvent::Failed { attempt, error } = event {
                self.turn_attempt = self.turn_attempt.max(attempt);
                failure = Some(error);
            }
        }
        failure.unwrap_or_else(|| {
            RecognitionError::new(RecognitionErrorCode::Other("not started".to_string()))
        })
    }

    async fn await_transcript(&mut self, attempt: u64) -> std::result::Result<Heard, Interrupt> {
        loop {
            let step = tokio::select! {
                event = self.speech_events.recv() => ListenStep::Event(event),
                command = self.commands.recv() => ListenStep::Command(command),
            };

            match step {
                ListenStep::Event(Some(SpeechEvent::Transcript {
                    attempt: a,
                    transcript,
                })) if a == attempt => return Ok(Heard::Transcript(transcript)),
                ListenStep::Event(Some(SpeechEvent::Failed { attempt: a, error })) if a == attempt => {
                    return Ok(Heard::Failed(error));
                }
                ListenStep::Event(Some(SpeechEvent::Ended { attempt: a, .. })) if a == attempt => {
                    return Ok(Heard::Nothing);
                }
                ListenStep::Event(Some(stale)) => {
                    tracing::trace!(?stale, "ignoring event from another attempt");
                }
                ListenStep::Event(None) => return Ok(Heard::Nothing),
                ListenStep::Command(command) => {
                    if let Some(interrupt) = self.serve_in_turn(command).await {
                        return Err(interrupt);
                    }
                }
            }
        }
    }

    /// Await `future` while serving commands
    async fn interruptible<F: Future>(
        &mut self,
        future: F,
    ) -> std::result::Result<F::Output, Interrupt> {
        tokio::pin!(future);
        loop {
            let command = tokio::select! {
                output = &mut future => return Ok(output),
                command = self.commands.recv() => command,
            };
            if let Some(interrupt) = self.serve_in_turn(command).await {
                return Err(interrupt);
            }
        }
    }

    /// Handle a command that arrived mid-turn; `Some` ends the turn
    async fn serve_in_turn(&mut self, command: Option<SessionCommand>) -> Option<Interrupt> {
        match command {
            None | Some(SessionCommand::Shutdown) => Some(Interrupt::Shutdown),
            Some(SessionCommand::BeginTurn) => Some(Interrupt::Restart),
            Some(SessionCommand::Stop) => {
                self.set_status(messages::STOPPED);
                Some(Interrupt::Stop)
            }
            Some(SessionCommand::StopCamera) => {
                self.stop_camera();
                Some(Interrupt::Stop)
            }
            Some(other) => {
                self.serve(other).await;
                None
            }
        }
    }

    /// Commands that never end a turn
    async fn serve(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::StartCamera { facing, reply } => {
                let result = self.capture.start(facing).await.map(|s| s.facing());
                self.publish_camera();
                let _ = reply.send(result);
            }
            SessionCommand::SwitchFacing { reply } => {
                let result = self.capture.switch_facing().await;
                self.publish_camera();
                let _ = reply.send(result);
            }
            SessionCommand::ListCameras { reply } => {
                let _ = reply.send(self.capture.video_devices().await);
            }
            SessionCommand::SetSpeechOutput(enabled) => {
                self.output.set_enabled(enabled);
                self.state.send_modify(|s| s.speech_output = enabled);
                tracing::info!(enabled, "speech output toggled");
            }
            SessionCommand::BeginTurn
            | SessionCommand::Stop
            | SessionCommand::StopCamera
            | SessionCommand::Shutdown => {}
        }
    }

    /// Record a failure, say it in the `Error` phase, and end the turn
    async fn fail(&mut self, message: &str) -> std::result::Result<(), Interrupt> {
        self.record_error(message);
        self.set_phase(SessionPhase::Error);
        self.say(message).await
    }

    fn record_error(&self, message: &str) {
        self.state.send_modify(|s| {
            s.last_error = Some(message.to_string());
            s.last_answer = None;
        });
    }

    async fn say(&mut self, text: &str) -> std::result::Result<(), Interrupt> {
        self.set_status(text);
        let completion = self.output.speak(text);
        self.interruptible(completion).await.map(drop)
    }

    fn stop_camera(&mut self) {
        self.capture.stop();
        self.input.stop();
        self.publish_camera();
    }

    /// Silence output and end any recognition attempt
    fn cancel_activity(&self) {
        self.output.stop();
        self.input.stop();
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.state.send_if_modified(|s| {
            if s.phase == phase {
                return false;
            }
            tracing::debug!(from = %s.phase, to = %phase, "phase");
            s.phase = phase;
            true
        });
    }

    fn set_status(&self, status: &str) {
        self.state.send_modify(|s| s.status = Some(status.to_string()));
    }

    fn publish_camera(&self) {
        let active = self.capture.is_active();
        let facing = self.capture.facing();
        self.state.send_modify(|s| {
            s.camera_active = active;
            s.facing = facing;
        });
    }

    fn teardown(&mut self) {
        self.input.shutdown();
        self.output.stop();
        self.capture.stop();
        self.publish_camera();
        self.set_phase(SessionPhase::Idle);
    }
}
