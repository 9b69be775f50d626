//! Published session state

use crate::camera::Facing;

/// Where the current turn is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    AwaitingPermission,
    Prompting,
    Listening,
    Capturing,
    Analyzing,
    Speaking,
    /// Reporting a failure before returning to idle
    Error,
}

impl SessionPhase {
    /// Whether a turn is running
    #[must_use]
    pub const fn in_turn(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingPermission => "awaiting-permission",
            Self::Prompting => "prompting",
            Self::Listening => "listening",
            Self::Capturing => "capturing",
            Self::Analyzing => "analyzing",
            Self::Speaking => "speaking",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Read-only view of the session, republished on every change
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    /// Number of the latest turn started
    pub turn: u64,
    /// Turns that ended with a spoken answer
    pub completed_turns: u64,
    pub last_transcript: Option<String>,
    /// Answer shown for the latest successful turn
    pub last_answer: Option<String>,
    /// Message shown for the latest failure
    pub last_error: Option<String>,
    /// Latest prompt or status line spoken to the user
    pub status: Option<String>,
    pub camera_active: bool,
    pub facing: Facing,
    pub speech_output: bool,
}
