//! Error taxonomy for voice sessions
//!
//! Every fallible operation in the crate reports one of these variants.
//! Failures during `start()`'s setup chain are returned to the caller after
//! the session has transitioned to `Error`; failures after the session is
//! connected are surfaced through observer notifications instead.

/// Errors surfaced by a voice session.
#[derive(Debug, Clone)]
pub enum SessionError {
    /// `start()` was called while a session is already connecting or connected
    AlreadyActive,
    /// The credential endpoint was unreachable or returned no usable secret
    CredentialUnavailable(String),
    /// The microphone could not be acquired
    MicrophoneUnavailable(String),
    /// The offer/answer exchange with the agent endpoint was rejected or malformed
    NegotiationFailed(String),
    /// The event sideband failed at the transport level
    ChannelFailure(String),
    /// The remote agent reported an application error
    RemoteError(String),
    /// The transcript flush to the storage endpoint failed (never fatal)
    PersistenceFailed(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::AlreadyActive => {
                write!(f, "A session is already active on this controller")
            }
            SessionError::CredentialUnavailable(e) => {
                write!(f, "Failed to obtain session credential: {}", e)
            }
            SessionError::MicrophoneUnavailable(e) => {
                write!(f, "Failed to acquire microphone: {}", e)
            }
            SessionError::NegotiationFailed(e) => {
                write!(f, "Media negotiation failed: {}", e)
            }
            SessionError::ChannelFailure(e) => {
                write!(f, "Event channel failed: {}", e)
            }
            SessionError::RemoteError(e) => {
                write!(f, "Remote agent error: {}", e)
            }
            SessionError::PersistenceFailed(e) => {
                write!(f, "Failed to persist transcript: {}", e)
            }
        }
    }
}

impl std::error::Error for SessionError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::AlreadyActive;
        assert!(err.to_string().contains("already active"));

        let err = SessionError::CredentialUnavailable("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));

        let err = SessionError::MicrophoneUnavailable("no input device".to_string());
        assert!(err.to_string().contains("no input device"));

        let err = SessionError::NegotiationFailed("endpoint returned 403".to_string());
        assert!(err.to_string().contains("403"));
    }

    #[test]
    fn test_session_error_is_std_error() {
        fn assert_error<E: std::error::Error>(_: &E) {}
        assert_error(&SessionError::AlreadyActive);
    }
}
