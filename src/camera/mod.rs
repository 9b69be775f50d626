//! Camera capture
//!
//! The [`CaptureController`] is the only owner of the live video device. It
//! opens the feed, switches facing, and samples single still frames encoded
//! as JPEG for the vision query.

mod still;

pub use still::StillImageCamera;

use std::sync::Arc;

use async_trait::async_trait;
use image::ExtendedColorType;
use image::codecs::jpeg::JpegEncoder;
use tokio::sync::watch;

/// Preferred capture resolution
pub const IDEAL_RESOLUTION: Resolution = Resolution {
    width: 1280,
    height: 720,
};

/// Smallest acceptable capture resolution
pub const MIN_RESOLUTION: Resolution = Resolution {
    width: 640,
    height: 480,
};

/// JPEG quality for still frames
const JPEG_QUALITY: u8 = 80;

/// Which way the camera points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Facing {
    /// Towards the user
    Front,
    /// Away from the user
    #[default]
    Back,
}

impl Facing {
    /// The other camera
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

impl std::fmt::Display for Facing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Front => write!(f, "front"),
            Self::Back => write!(f, "back"),
        }
    }
}

/// Frame dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// What the controller asks the device for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub facing: Facing,
    pub ideal: Resolution,
    pub min: Resolution,
}

impl VideoConstraints {
    /// Default constraints for a facing
    #[must_use]
    pub const fn for_facing(facing: Facing) -> Self {
        Self {
            facing,
            ideal: IDEAL_RESOLUTION,
            min: MIN_RESOLUTION,
        }
    }
}

/// Raw RGB8 video frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB pixels, `width * height * 3` bytes
    pub pixels: Vec<u8>,
}

impl Frame {
    fn is_ready(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.pixels.len() == self.width as usize * self.height as usize * 3
    }
}

/// Encoded still image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBytes {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
}

/// A video input the platform can open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoDeviceInfo {
    pub id: String,
    pub label: String,
    pub facing: Option<Facing>,
}

/// Reasons a platform refuses to open a camera
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// User or policy denied access
    NotAllowed,
    /// No device matches the request
    NotFound,
    /// Device exists but is in use or unreadable
    NotReadable,
    /// Device cannot satisfy the constraints
    Overconstrained,
    /// Anything else the platform reports
    Other(String),
}

/// Errors from the capture controller
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// Camera access denied
    #[error("camera permission denied")]
    PermissionDenied,

    /// No matching camera
    #[error("camera not found")]
    DeviceNotFound,

    /// Camera busy or unreadable
    #[error("camera is busy")]
    DeviceBusy,

    /// Camera cannot be used this way
    #[error("camera unsupported: {0}")]
    Unsupported(String),

    /// No live feed
    #[error("camera is not active")]
    Inactive,

    /// Feed has not produced a usable frame yet
    #[error("camera frame not ready")]
    NotReady,

    /// Still frame could not be encoded
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

impl CaptureError {
    /// Message for the user
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied => {
                "Camera permission was denied. Please allow camera access and try again.".to_string()
            }
            Self::DeviceNotFound => "No camera was found on this device.".to_string(),
            Self::DeviceBusy => {
                "The camera is being used by another application. Please close it and try again."
                    .to_string()
            }
            Self::Unsupported(_) => "This camera is not supported on this device.".to_string(),
            Self::Inactive => "The camera is off. Please start the camera first.".to_string(),
            Self::NotReady => {
                "The camera isn't ready yet. Please wait a moment and try again.".to_string()
            }
            Self::Encode(_) => "I couldn't take a picture. Please try again.".to_string(),
        }
    }
}

impl From<DeviceError> for CaptureError {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::NotAllowed => Self::PermissionDenied,
            DeviceError::NotFound => Self::DeviceNotFound,
            DeviceError::NotReadable => Self::DeviceBusy,
            DeviceError::Overconstrained => {
                Self::Unsupported("resolution constraints not satisfiable".to_string())
            }
            DeviceError::Other(reason) => Self::Unsupported(reason),
        }
    }
}

/// Platform media capture
#[async_trait]
pub trait CameraDevice: Send + Sync {
    /// Open a live feed
    ///
    /// # Errors
    ///
    /// Returns the platform's refusal reason
    async fn open(&self, constraints: &VideoConstraints) -> Result<Box<dyn VideoFeed>, DeviceError>;

    /// List video inputs
    async fn list_video_devices(&self) -> Vec<VideoDeviceInfo>;
}

/// A running camera feed
pub trait VideoFeed: Send + Sync {
    /// Most recent frame, if any has arrived
    fn latest_frame(&self) -> Option<Frame>;

    /// Release the device
    fn stop(&mut self);
}

/// Live device handle; dropping it releases the camera
pub struct CaptureSession {
    facing: Facing,
    feed: Box<dyn VideoFeed>,
}

impl CaptureSession {
    /// Camera facing
    #[must_use]
    pub const fn facing(&self) -> Facing {
        self.facing
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.feed.stop();
        tracing::debug!(facing = %self.facing, "camera released");
    }
}

/// Owns the camera and extracts still frames
pub struct CaptureController {
    device: Arc<dyn CameraDevice>,
    session: Option<CaptureSession>,
    facing: Facing,
    active: watch::Sender<bool>,
}

impl CaptureController {
    /// Create a controller with no live feed
    #[must_use]
    pub fn new(device: Arc<dyn CameraDevice>) -> Self {
        let (active, _rx) = watch::channel(false);
        Self {
            device,
            session: None,
            facing: Facing::default(),
            active,
        }
    }

    /// Open the camera with the given facing
    ///
    /// Any running feed is released first.
    ///
    /// # Errors
    ///
    /// Returns the classified platform refusal
    pub async fn start(&mut self, facing: Facing) -> Result<&CaptureSession, CaptureError> {
        self.release();

        let constraints = VideoConstraints::for_facing(facing);
        match self.device.open(&constraints).await {
            Ok(feed) => {
                tracing::info!(%facing, "camera started");
                self.facing = facing;
                self.active.send_replace(true);
                let session = self.session.insert(CaptureSession { facing, feed });
                Ok(&*session)
            }
            Err(e) => {
                let error = CaptureError::from(e);
                tracing::warn!(%facing, error = %error, "camera start failed");
                Err(error)
            }
        }
    }

    /// Release the camera; no-op when already stopped
    pub fn stop(&mut self) {
        if self.session.is_some() {
            self.release();
            tracing::info!("camera stopped");
        }
    }

    /// Restart with the opposite facing
    ///
    /// On failure the previous facing is reopened, so either the new or the
    /// old camera is live afterwards.
    ///
    /// # Errors
    ///
    /// Returns why the new facing could not be opened
    pub async fn switch_facing(&mut self) -> Result<Facing, CaptureError> {
        let previous = self.facing;
        let target = previous.opposite();
        let was_active = self.session.is_some();

        match self.start(target).await.map(CaptureSession::facing) {
            Ok(facing) => Ok(facing),
            Err(error) => {
                self.facing = previous;
                if was_active
                    && let Err(restore) = self.start(previous).await
                {
                    tracing::error!(
                        facing = %previous,
                        error = %restore,
                        "failed to restore previous camera"
                    );
                }
                Err(error)
            }
        }
    }

    /// Sample the live feed into a JPEG still
    ///
    /// # Errors
    ///
    /// Returns `Inactive` with no feed, `NotReady` before the first usable
    /// frame, or `Encode` if JPEG encoding fails
    pub fn capture_frame(&self) -> Result<ImageBytes, CaptureError> {
        let session = self.session.as_ref().ok_or(CaptureError::Inactive)?;
        let frame = session
            .feed
            .latest_frame()
            .filter(Frame::is_ready)
            .ok_or(CaptureError::NotReady)?;

        let data = encode_jpeg(&frame)?;
        tracing::debug!(
            width = frame.width,
            height = frame.height,
            bytes = data.len(),
            "frame captured"
        );

        Ok(ImageBytes {
            data,
            mime_type: "image/jpeg",
        })
    }

    /// List video inputs
    pub async fn video_devices(&self) -> Vec<VideoDeviceInfo> {
        self.device.list_video_devices().await
    }

    /// Whether a feed is live
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.session.is_some()
    }

    /// Current facing (the last one successfully opened)
    #[must_use]
    pub const fn facing(&self) -> Facing {
        self.facing
    }

    /// Watch whether a feed is live
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    fn release(&mut self) {
        if self.session.take().is_some() {
            self.active.send_replace(false);
        }
    }
}

fn encode_jpeg(frame: &Frame) -> Result<Vec<u8>, CaptureError> {
    let mut data = Vec::new();
    JpegEncoder::new_with_quality(&mut data, JPEG_QUALITY)
        .encode(&frame.pixels, frame.width, frame.height, ExtendedColorType::Rgb8)
        .map_err(|e| CaptureError::Encode(e.to_string()))?;
    Ok(data)
}
