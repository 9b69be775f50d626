//! Shared test utilities

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use beacon_lens::camera::{
    CameraDevice, DeviceError, Facing, Frame, ImageBytes, VideoConstraints, VideoDeviceInfo,
    VideoFeed,
};
use beacon_lens::permission::StaticPermissions;
use beacon_lens::speech::{
    EngineEvent, RecognitionEngine, RecognitionErrorCode, SpeechEngine, SpeechRequest,
    SynthesisError, Transcript, Voice,
};
use beacon_lens::vision::QueryError;
use beacon_lens::{
    PermissionGate, PermissionState, SessionComponents, SessionHandle, SessionOrchestrator,
    SessionSettings, VisionQuery,
};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

/// Smallest byte string that looks like a JPEG
#[must_use]
pub fn tiny_jpeg() -> Vec<u8> {
    vec![0xFF, 0xD8, 0xFF, 0xD9]
}

/// Permission gate fixed at `state`, already queried
pub async fn gate(state: PermissionState) -> PermissionGate {
    let gate = PermissionGate::new(Arc::new(StaticPermissions(state)));
    gate.query_microphone().await;
    gate
}

/// Camera with a feed for each configured facing
pub struct FakeCamera {
    facings: Vec<Facing>,
    pub opens: AtomicUsize,
}

impl FakeCamera {
    #[must_use]
    pub fn with(facings: &[Facing]) -> Arc<Self> {
        Arc::new(Self {
            facings: facings.to_vec(),
            opens: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl CameraDevice for FakeCamera {
    async fn open(&self, constraints: &VideoConstraints) -> Result<Box<dyn VideoFeed>, DeviceError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.facings.contains(&constraints.facing) {
            return Err(DeviceError::NotFound);
        }
        Ok(Box::new(FakeFeed { live: true }))
    }

    async fn list_video_devices(&self) -> Vec<VideoDeviceInfo> {
        self.facings
            .iter()
            .map(|facing| VideoDeviceInfo {
                id: format!("fake-{facing}"),
                label: format!("Fake {facing} camera"),
                facing: Some(*facing),
            })
            .collect()
    }
}

struct FakeFeed {
    live: bool,
}

impl VideoFeed for FakeFeed {
    fn latest_frame(&self) -> Option<Frame> {
        self.live.then(|| Frame {
            width: 4,
            height: 4,
            pixels: vec![128; 4 * 4 * 3],
        })
    }

    fn stop(&mut self) {
        self.live = false;
    }
}

/// What one recognition attempt does
#[derive(Debug, Clone)]
pub enum Attempt {
    /// Hear `text`, then end cleanly
    Say(&'static str),
    /// Report `code`, then end
    Fail(RecognitionErrorCode),
    /// End without a result
    Silent,
    /// Stay open until stopped
    Hang,
}

/// Recognition engine playing back scripted attempts
///
/// Attempts beyond the script hang until stopped.
pub struct FakeRecognizer {
    supported: bool,
    script: Mutex<VecDeque<Attempt>>,
    open: Mutex<Option<mpsc::UnboundedSender<EngineEvent>>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    /// Starts that happened while another attempt was still open
    pub overlaps: AtomicUsize,
}

impl FakeRecognizer {
    #[must_use]
    pub fn scripted(script: impl IntoIterator<Item = Attempt>) -> Arc<Self> {
        Self::build(true, script)
    }

    #[must_use]
    pub fn unsupported() -> Arc<Self> {
        Self::build(false, [])
    }

    fn build(supported: bool, script: impl IntoIterator<Item = Attempt>) -> Arc<Self> {
        Arc::new(Self {
            supported,
            script: Mutex::new(script.into_iter().collect()),
            open: Mutex::new(None),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            overlaps: AtomicUsize::new(0),
        })
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Whether an attempt is waiting to be stopped
    pub fn is_open(&self) -> bool {
        self.open
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl RecognitionEngine for FakeRecognizer {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn start(&self, events: mpsc::UnboundedSender<EngineEvent>) -> Result<(), RecognitionErrorCode> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.is_open() {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        let attempt = self.script.lock().unwrap().pop_front().unwrap_or(Attempt::Hang);
        match attempt {
            Attempt::Say(text) => {
                let _ = events.send(EngineEvent::Result(Transcript::new(text, 0.9)));
                let _ = events.send(EngineEvent::End);
            }
            Attempt::Fail(code) => {
                let _ = events.send(EngineEvent::Error(code));
                let _ = events.send(EngineEvent::End);
            }
            Attempt::Silent => {
                let _ = events.send(EngineEvent::End);
            }
            Attempt::Hang => *self.open.lock().unwrap() = Some(events),
        }
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.open.lock().unwrap().take();
    }
}

/// Speech engine that records what it was asked to say
pub struct FakeSynth {
    spoken: Mutex<Vec<String>>,
    /// How long each utterance takes
    duration: Duration,
    pub cancels: AtomicUsize,
}

impl FakeSynth {
    #[must_use]
    pub fn instant() -> Arc<Self> {
        Self::taking(Duration::ZERO)
    }

    #[must_use]
    pub fn taking(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            spoken: Mutex::new(Vec::new()),
            duration,
            cancels: AtomicUsize::new(0),
        })
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechEngine for FakeSynth {
    fn voices(&self) -> Vec<Voice> {
        vec![Voice {
            name: "Test Voice".to_string(),
            lang: "en-US".to_string(),
            local_service: true,
            default: true,
        }]
    }

    async fn speak(&self, request: &SpeechRequest) -> Result<(), SynthesisError> {
        self.spoken.lock().unwrap().push(request.text.clone());
        if !self.duration.is_zero() {
            tokio::time::sleep(self.duration).await;
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Vision service with a canned reply
pub struct FakeVision {
    reply: Result<String, QueryError>,
    /// When set, each query waits for a notification before replying
    gate: Option<Arc<Notify>>,
    questions: Mutex<Vec<String>>,
    pub finished: AtomicUsize,
}

impl FakeVision {
    #[must_use]
    pub fn answering(answer: &str) -> Arc<Self> {
        Self::build(Ok(answer.to_string()), None)
    }

    #[must_use]
    pub fn failing(error: QueryError) -> Arc<Self> {
        Self::build(Err(error), None)
    }

    /// Answers only once `gate` is notified
    #[must_use]
    pub fn gated(answer: &str, gate: Arc<Notify>) -> Arc<Self> {
        Self::build(Ok(answer.to_string()), Some(gate))
    }

    fn build(reply: Result<String, QueryError>, gate: Option<Arc<Notify>>) -> Arc<Self> {
        Arc::new(Self {
            reply,
            gate,
            questions: Mutex::new(Vec::new()),
            finished: AtomicUsize::new(0),
        })
    }

    pub fn questions(&self) -> Vec<String> {
        self.questions.lock().unwrap().clone()
    }
}

#[async_trait]
impl VisionQuery for FakeVision {
    async fn query(&self, image: &ImageBytes, question: &str) -> Result<String, QueryError> {
        assert_eq!(image.mime_type, "image/jpeg");
        self.questions.lock().unwrap().push(question.to_string());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        self.reply.clone()
    }
}

/// Settings for deterministic tests: no continuous listening
#[must_use]
pub fn settings() -> SessionSettings {
    SessionSettings {
        continuous: false,
        restart_delay: Duration::from_millis(10),
        ..SessionSettings::default()
    }
}

/// A running session and its fakes
pub struct TestSession {
    pub handle: SessionHandle,
    pub task: JoinHandle<()>,
    pub camera: Arc<FakeCamera>,
    pub recognizer: Arc<FakeRecognizer>,
    pub synth: Arc<FakeSynth>,
    pub vision: Arc<FakeVision>,
}

impl TestSession {
    /// Spawn a session; the camera is not started
    pub async fn spawn(
        permission: PermissionState,
        camera: Arc<FakeCamera>,
        recognizer: Arc<FakeRecognizer>,
        synth: Arc<FakeSynth>,
        vision: Arc<FakeVision>,
        settings: SessionSettings,
    ) -> Self {
        let components = SessionComponents {
            permission: gate(permission).await,
            camera: camera.clone(),
            recognizer: recognizer.clone(),
            synthesizer: synth.clone(),
            vision: vision.clone(),
        };
        let (handle, task) = SessionOrchestrator::spawn(components, settings);
        Self {
            handle,
            task,
            camera,
            recognizer,
            synth,
            vision,
        }
    }

    /// Spawn with a granted microphone and a live back camera
    pub async fn ready(recognizer: Arc<FakeRecognizer>, vision: Arc<FakeVision>) -> Self {
        let session = Self::spawn(
            PermissionState::Granted,
            FakeCamera::with(&[Facing::Front, Facing::Back]),
            recognizer,
            FakeSynth::instant(),
            vision,
            settings(),
        )
        .await;
        session.handle.start_camera(Facing::Back).await.unwrap();
        session
    }

    /// Shut down and wait for the actor to exit
    pub async fn close(self) {
        self.handle.shutdown().await.unwrap();
        self.task.await.unwrap();
    }
}
