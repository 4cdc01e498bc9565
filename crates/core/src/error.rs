use thiserror::Error;

/// Failure taxonomy for a conversation session.
///
/// Operation-local failures (a single synthesis or recognition request) are
/// reported into session state and survived; connection-level failures end
/// the session until a fresh start.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("microphone permission denied: {0}")]
    Permission(String),

    #[error("network request failed: {0}")]
    Network(String),

    #[error("invalid command for current state: {0}")]
    State(String),
}

impl SessionError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Initialization(_) | SessionError::Permission(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_split() {
        assert!(SessionError::Initialization("no provider".into()).is_fatal());
        assert!(SessionError::Permission("denied".into()).is_fatal());
        assert!(!SessionError::Network("500".into()).is_fatal());
        assert!(!SessionError::State("not connected".into()).is_fatal());
    }
}
