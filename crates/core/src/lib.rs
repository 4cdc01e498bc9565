pub mod error;
pub mod phase;
pub mod scoring;
pub mod session_state;
pub mod transcript;

pub use error::SessionError;
pub use phase::{Phase, PhaseController};
pub use session_state::{SessionState, SessionStatus};
pub use transcript::{Speaker, TranscriptEntry, TranscriptStore};

/// Represents commands that the orchestration engine issues to the runtime
/// embedding it.
///
/// This enum is the primary API for decoupling the session's decision-making
/// from the runtime's execution of side effects (like delivering instructions
/// to the interviewer backend).
#[derive(Debug, Clone)]
pub enum Command {
    /// Forward an out-of-band instruction to the interviewer backend.
    /// System messages never produce transcript entries.
    SystemMessage(String),
    /// Command indicating the interview reached its terminal phase, with a
    /// final message.
    SessionComplete(String),
}
