#![forbid(unsafe_code)]

// Session-level error taxonomy surfaced to clients as `error { message, code }`.

use thiserror::Error;

use crate::media::types::MediaError;

/// Errors produced by the session layer. Each variant maps to a stable wire
/// code; `Internal` is logged with a correlation id and masked toward clients.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("invalid passcode")]
    InvalidPasscode,

    #[error("room is full")]
    RoomFull,

    #[error("not invited to this room")]
    NotInvited,

    #[error("call has ended")]
    Ended,

    #[error("host privileges required")]
    HostRequired,

    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("cannot consume producer {0}")]
    Unconsumable(String),

    #[error("too many attempts, try again later")]
    RateLimited,

    #[error("not in a room")]
    NotInRoom,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error")]
    Internal(anyhow::Error),
}

impl SessionError {
    /// Stable wire code for the `error` event.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "AuthenticationFailed",
            Self::RoomNotFound(_) => "RoomNotFound",
            Self::InvalidPasscode => "InvalidPasscode",
            Self::RoomFull => "RoomFull",
            Self::NotInvited => "NotInvited",
            Self::Ended => "Ended",
            Self::HostRequired => "HostRequired",
            Self::PeerUnreachable(_) => "PeerUnreachable",
            Self::Unconsumable(_) => "Unconsumable",
            Self::RateLimited => "RateLimited",
            Self::NotInRoom => "NotInRoom",
            Self::InvalidRequest(_) => "InvalidRequest",
            Self::Internal(_) => "Internal",
        }
    }

    /// Message safe to hand to the client. Internal details stay in the logs.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }

    #[must_use]
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self::Internal(err.into())
    }
}

impl From<MediaError> for SessionError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::Unconsumable(id) => Self::Unconsumable(id),
            MediaError::RoomNotFound(id) => Self::RoomNotFound(id),
            // Protocol misuse by the client, not a server fault.
            MediaError::PeerNotFound(_)
            | MediaError::TransportError(_)
            | MediaError::ConsumerError(_)
            | MediaError::ProducerError(_) => Self::InvalidRequest(err.to_string()),
            other => Self::Internal(other.into()),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_errors_are_masked() {
        let err = SessionError::internal(anyhow::anyhow!("pool exhausted on shard 3"));
        assert_eq!(err.code(), "Internal");
        assert_eq!(err.client_message(), "internal error");
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(SessionError::RoomFull.code(), "RoomFull");
        assert_eq!(SessionError::InvalidPasscode.code(), "InvalidPasscode");
        assert_eq!(
            SessionError::PeerUnreachable("peer_x".into()).code(),
            "PeerUnreachable"
        );
    }

    #[test]
    fn media_errors_map_to_session_codes() {
        let err: SessionError = MediaError::Unconsumable("prod_1".into()).into();
        assert_eq!(err.code(), "Unconsumable");

        let err: SessionError =
            MediaError::TransportError("send transport not created".into()).into();
        assert_eq!(err.code(), "InvalidRequest");

        let err: SessionError = MediaError::WorkerError("worker has died".into()).into();
        assert_eq!(err.code(), "Internal");
    }
}
