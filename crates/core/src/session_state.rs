use crate::error::SessionError;
use crate::phase::Phase;

/// Lifecycle of a conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Connecting,
    Connected,
    Speaking,
    Listening,
    /// Terminal until a fresh start.
    Error,
    Ended,
}

/// The single mutable status record owned by the session orchestrator.
/// Sub-components report into it through events; nothing else writes it
/// directly.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub status: SessionStatus,
    pub connected: bool,
    pub listening: bool,
    pub speaking: bool,
    pub muted: bool,
    pub current_phase: Phase,
    pub interim_text: String,
    pub error: Option<SessionError>,
    pub volume_level: f32,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Idle,
            connected: false,
            listening: false,
            speaking: false,
            muted: false,
            current_phase: Phase::Fit,
            interim_text: String::new(),
            error: None,
            volume_level: 0.0,
        }
    }

    /// Records a failure. Fatal errors park the session in `Error` and
    /// disconnect it; operation-local failures only surface the message.
    pub fn record_error(&mut self, error: SessionError) {
        tracing::warn!(%error, "session error");
        if error.is_fatal() {
            self.status = SessionStatus::Error;
            self.connected = false;
            self.listening = false;
            self.speaking = false;
        }
        self.error = Some(error);
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_error_disconnects_the_session() {
        let mut state = SessionState::new();
        state.connected = true;
        state.listening = true;
        state.status = SessionStatus::Listening;

        state.record_error(SessionError::Permission("denied".into()));
        assert_eq!(state.status, SessionStatus::Error);
        assert!(!state.connected);
        assert!(!state.listening);
    }

    #[test]
    fn operation_local_error_keeps_the_session_alive() {
        let mut state = SessionState::new();
        state.connected = true;
        state.status = SessionStatus::Connected;

        state.record_error(SessionError::Network("synthesis API returned 500".into()));
        assert_eq!(state.status, SessionStatus::Connected);
        assert!(state.connected);
        assert!(state.error.is_some());

        state.clear_error();
        assert!(state.error.is_none());
    }
}
