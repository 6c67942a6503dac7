//! Error taxonomy for the transcode engine.
//!
//! Probe and mapping problems are resolved locally wherever a safe default
//! exists; only launch-time and exit-code failures reach a job's terminal state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Media probe failed, or returned an unusable duration.
    #[error("media probe failed: {0}")]
    ProbeFailed(String),

    #[error("invalid duration {0}s: probe the source before estimating")]
    InvalidDuration(f64),

    /// Requested encoder was resolved away by the fallback resolver.
    #[error("encoder '{requested}' unavailable, using '{substitute}': {reason}")]
    EncoderUnavailable {
        requested: String,
        substitute: String,
        reason: String,
    },

    #[error("encoder '{encoder}' failed to initialize: {message}")]
    EncoderInitFailed { encoder: String, message: String },

    #[error("ffmpeg exited with code {code}\nLast stderr output:\n{tail}")]
    SubprocessFailed { code: i32, tail: String },

    #[error("cancelled by user")]
    CancelledByUser,

    #[error("'{0}' timed out after {1}s")]
    Timeout(String, u64),

    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown job {0}")]
    UnknownJob(uuid::Uuid),

    #[error("job {0} is still {1}")]
    JobActive(uuid::Uuid, crate::engine::core::JobStatus),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{0}: {1}")]
    Io(String, #[source] std::io::Error),
}

impl EngineError {
    /// Errors that end a job as `failed`. Cancellation is terminal but not a failure.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::CancelledByUser)
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
