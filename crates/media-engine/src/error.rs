//! Engine error type.

use thiserror::Error;

/// Error returned by media engine operations.
///
/// `NotFound` is distinguished so callers can treat a missing resource as
/// a benign race (the resource closed between lookup and use) rather than
/// a bug.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The referenced resource does not exist in the engine.
    #[error("not found in media engine: {0}")]
    NotFound(String),

    /// The engine rejected or failed the operation.
    #[error("media engine operation failed: {0}")]
    Operation(String),

    /// The resource was already closed.
    #[error("media engine resource closed")]
    Closed,
}
