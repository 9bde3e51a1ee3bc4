//! Room Controller error types.
//!
//! Error kinds map to stable wire codes for client replies. Internal
//! details are logged server-side but not exposed to clients. The
//! `NotFoundInEngine` variant is distinguished so clients can treat a
//! missing media engine resource as a benign race rather than a bug.

use thiserror::Error;

/// Room Controller error type.
///
/// Wire code mapping:
/// - `Authorization`: 3 (FORBIDDEN)
/// - `NotFound`, `NotFoundInEngine`: 4 (NOT_FOUND)
/// - `NotJoined`, `AlreadyJoined`, `UnknownMethod`, `BadRequest`, `RoomClosed`: 5 (PRECONDITION)
/// - `Timeout`: 8 (TIMEOUT)
/// - `MediaEngine`, `Internal`: 6 (INTERNAL_ERROR)
#[derive(Debug, Error)]
pub enum RoomError {
    /// Permission or access check failed.
    #[error("peer not authorized")]
    Authorization,

    /// A referenced peer or resource is unknown to the room.
    #[error("{0} not found")]
    NotFound(String),

    /// A referenced resource is unknown to the media engine.
    #[error("{0} not found in media engine")]
    NotFoundInEngine(String),

    /// The peer has not completed the join protocol.
    #[error("peer not yet joined")]
    NotJoined,

    /// The peer already completed the join protocol.
    #[error("peer already joined")]
    AlreadyJoined,

    /// The request method is not part of the protocol.
    #[error("unknown request method \"{0}\"")]
    UnknownMethod(String),

    /// The request payload does not match the method's schema.
    #[error("malformed request: {0}")]
    BadRequest(String),

    /// The room is closed and accepts no further operations.
    #[error("room is closed")]
    RoomClosed,

    /// A peer RPC round trip exceeded its budget after retries.
    #[error("request timed out")]
    Timeout,

    /// A media engine operation failed downstream.
    #[error("media engine error: {0}")]
    MediaEngine(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RoomError {
    /// Shorthand for an internal error with context.
    pub fn internal(context: impl Into<String>) -> Self {
        RoomError::Internal(context.into())
    }

    /// Returns the stable wire code for this error.
    #[must_use]
    pub fn error_code(&self) -> u16 {
        match self {
            RoomError::Authorization => 3,
            RoomError::NotFound(_) | RoomError::NotFoundInEngine(_) => 4,
            RoomError::NotJoined
            | RoomError::AlreadyJoined
            | RoomError::UnknownMethod(_)
            | RoomError::BadRequest(_)
            | RoomError::RoomClosed => 5,
            RoomError::MediaEngine(_) | RoomError::Internal(_) => 6,
            RoomError::Timeout => 8,
        }
    }

    /// Whether this error means "not found in the media engine".
    #[must_use]
    pub fn is_not_found_in_engine(&self) -> bool {
        matches!(self, RoomError::NotFoundInEngine(_))
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RoomError::MediaEngine(_) | RoomError::Internal(_) => {
                "an internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<media_engine::EngineError> for RoomError {
    fn from(err: media_engine::EngineError) -> Self {
        match err {
            media_engine::EngineError::NotFound(what) => RoomError::NotFoundInEngine(what),
            other => RoomError::MediaEngine(other.to_string()),
        }
    }
}
