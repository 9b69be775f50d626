//! Camera backed by still image files
//!
//! Serves a fixed picture per facing. Used on machines without a camera
//! driver and for demos: point it at a photo and ask about it.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{CameraDevice, DeviceError, Facing, Frame, VideoConstraints, VideoDeviceInfo, VideoFeed};

/// A camera that always shows the same image
pub struct StillImageCamera {
    front: Option<PathBuf>,
    back: Option<PathBuf>,
}

impl StillImageCamera {
    /// Create a camera from optional per-facing image paths
    #[must_use]
    pub const fn new(front: Option<PathBuf>, back: Option<PathBuf>) -> Self {
        Self { front, back }
    }

    fn path_for(&self, facing: Facing) -> Option<&PathBuf> {
        match facing {
            Facing::Front => self.front.as_ref(),
            Facing::Back => self.back.as_ref(),
        }
    }
}

#[async_trait]
impl CameraDevice for StillImageCamera {
    async fn open(&self, constraints: &VideoConstraints) -> Result<Box<dyn VideoFeed>, DeviceError> {
        let path = self
            .path_for(constraints.facing)
            .cloned()
            .ok_or(DeviceError::NotFound)?;

        let decoded = tokio::task::spawn_blocking(move || image::open(&path).map(|i| i.to_rgb8()))
            .await
            .map_err(|e| DeviceError::Other(e.to_string()))?
            .map_err(|e| {
                tracing::warn!(error = %e, "failed to read camera image");
                DeviceError::NotReadable
            })?;

        let (width, height) = decoded.dimensions();
        if width < constraints.min.width || height < constraints.min.height {
            tracing::warn!(
                width,
                height,
                min_width = constraints.min.width,
                min_height = constraints.min.height,
                "camera image below minimum resolution"
            );
            return Err(DeviceError::Overconstrained);
        }

        Ok(Box::new(StillFeed {
            frame: Some(Frame {
                width,
                height,
                pixels: decoded.into_raw(),
            }),
        }))
    }

    async fn list_video_devices(&self) -> Vec<VideoDeviceInfo> {
        [(Facing::Front, &self.front), (Facing::Back, &self.back)]
            .into_iter()
            .filter_map(|(facing, path)| {
                path.as_ref().map(|p| VideoDeviceInfo {
                    id: format!("still-{facing}"),
                    label: p.display().to_string(),
                    facing: Some(facing),
                })
            })
            .collect()
    }
}

struct StillFeed {
    frame: Option<Frame>,
}

impl VideoFeed for StillFeed {
    fn latest_frame(&self) -> Option<Frame> {
        self.frame.clone()
    }

    fn stop(&mut self) {
        self.frame = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CaptureController, CaptureError};
    use std::sync::Arc;

    fn write_png(dir: &tempfile::TempDir, name: &str, width: u32, height: u32) -> PathBuf {
        let path = dir.path().join(name);
        image::RgbImage::from_pixel(width, height, image::Rgb([10, 120, 200]))
            .save(&path)
            .unwrap();
        path
    }

    #[tokio::test]
    async fn test_serves_configured_image() {
        let dir = tempfile::tempdir().unwrap();
        let back = write_png(&dir, "back.png", 640, 480);
        let mut controller =
            CaptureController::new(Arc::new(StillImageCamera::new(None, Some(back))));

        controller.start(Facing::Back).await.unwrap();
        let image = controller.capture_frame().unwrap();
        assert_eq!(&image.data[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_missing_facing_is_not_found() {
        let camera = StillImageCamera::new(None, None);
        let err = camera
            .open(&VideoConstraints::for_facing(Facing::Front))
            .await
            .err()
            .unwrap();
        assert_eq!(err, DeviceError::NotFound);
    }

    #[tokio::test]
    async fn test_small_image_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let back = write_png(&dir, "tiny.png", 32, 32);
        let mut controller =
            CaptureController::new(Arc::new(StillImageCamera::new(None, Some(back))));

        let err = controller.start(Facing::Back).await.err().unwrap();
        assert!(matches!(err, CaptureError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_unreadable_file_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.png");
        let mut controller =
            CaptureController::new(Arc::new(StillImageCamera::new(Some(missing), None)));

        let err = controller.start(Facing::Front).await.err().unwrap();
        assert_eq!(err, CaptureError::DeviceBusy);
    }

    #[tokio::test]
    async fn test_lists_configured_devices() {
        let camera = StillImageCamera::new(Some(PathBuf::from("a.png")), None);
        let devices = camera.list_video_devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].facing, Some(Facing::Front));
        assert_eq!(devices[0].id, "still-front");
    }
}
