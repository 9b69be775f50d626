//! What the session says to the user

pub const MICROPHONE_REQUIRED: &str =
    "Microphone permission is required to ask questions. Please allow microphone access.";

pub const RECOGNITION_UNSUPPORTED: &str =
    "Speech recognition isn't available on this device, so I can't hear your question.";

pub const CAMERA_INACTIVE: &str = "The camera is off. Please start the camera, then ask again.";

pub const LISTENING: &str = "I'm listening...";

pub const DID_NOT_CATCH: &str = "Sorry, I didn't catch that. Please try again.";

pub const GIVE_UP: &str = "I still couldn't hear a question. Let's try again later.";

pub const STOPPED: &str = "Stopped.";

/// Acknowledge the recognized question
#[must_use]
pub fn heard(text: &str) -> String {
    format!("I heard: {}", text.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heard_trims() {
        assert_eq!(heard(" What do you see? "), "I heard: What do you see?");
    }
}
