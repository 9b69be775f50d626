//! Error types for Beacon Lens

use thiserror::Error;

use crate::camera::CaptureError;
use crate::vision::QueryError;

/// Result type alias for Beacon Lens operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Beacon Lens
///
/// Session-level failures (capture, recognition, vision) are classified at
/// their component boundary and turned into spoken messages; this type only
/// carries them out of the crate when a caller asks for a `Result`
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Text-to-speech error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Camera capture error
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Vision query error
    #[error(transparent)]
    Query(#[from] QueryError),

    /// The session actor has shut down
    #[error("session closed")]
    SessionClosed,

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_errors_pass_through() {
        let err = Error::from(CaptureError::Inactive);
        assert_eq!(err.to_string(), "camera is not active");
        assert!(matches!(err, Error::Capture(CaptureError::Inactive)));

        let err: Error = QueryError::MalformedResponse.into();
        assert_eq!(err.to_string(), "vision response had no answer");
    }

    #[test]
    fn test_local_failures_are_labelled() {
        assert_eq!(
            Error::Config("missing key".to_string()).to_string(),
            "configuration error: missing key"
        );
        assert_eq!(
            Error::Audio("no input device available".to_string()).to_string(),
            "audio error: no input device available"
        );
        assert_eq!(Error::SessionClosed.to_string(), "session closed");
    }
}
