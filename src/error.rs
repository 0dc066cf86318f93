use thiserror::Error;

// Main application error types.

/// Run-level failures. Per-item failures never surface here; they are
/// carried in the item's report so sibling items keep running.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Run task failed: {0}")]
    Join(String),
}

/// Typed outcome of a single remote call. The boundary performs no
/// retries itself; this classification is what drives retry decisions
/// in the sequencer.
#[derive(Error, Debug, Clone)]
pub enum RemoteError {
    #[error("Transient remote failure: {0}")]
    Transient(String),
    #[error("Provider rejected the request: {0}")]
    Rejected(String),
    #[error("Malformed provider response: {0}")]
    Malformed(String),
    #[error("Call cancelled")]
    Cancelled,
}

impl RemoteError {
    /// Transient and rejected calls may be retried up to the stage's
    /// budget. Malformed responses fail the item immediately and
    /// cancellation is propagated, never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Rejected(_))
    }
}

/// Failure of one (item, stage) execution.
#[derive(Error, Debug, Clone)]
pub enum StageError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("Raster error: {0}")]
    Raster(String),
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Remote(e) => e.is_retryable(),
            StageError::Raster(_) => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Remote(RemoteError::Cancelled))
    }
}
