use thiserror::Error;

/// The error taxonomy a pipeline stage or worker-loop iteration can surface.
///
/// `Cancelled` is a distinguished variant rather than a generic failure: every
/// site that would otherwise propagate a stage error checks for it explicitly
/// and performs the orderly `Cancelled` transition instead of `Failed`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tool exited non-zero or produced no output: {0}")]
    TransientToolFailure(String),

    #[error("stage timed out after {0}s")]
    StageTimeout(u64),

    #[error("failed to parse tool output: {0}")]
    ParseFailure(String),

    #[error("datastore unavailable: {0}")]
    DatastoreUnavailable(#[from] anyhow::Error),

    #[error("external service failure: {0}")]
    ExternalServiceFailure(String),

    #[error("job cancelled")]
    Cancelled,

    #[error("invariant violation: {0}")]
    ProgrammerError(String),
}

impl EngineError {
    /// Truncate the display message to the 2000-character cap used for
    /// persisted `error_message` fields.
    pub fn truncated_message(&self) -> String {
        let msg = self.to_string();
        truncate_chars(&msg, 2000)
    }
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
