use std::time::Duration;

/// Errors produced by the resolution and filtering pipeline.
///
/// Source failures (`Transport`, `Timeout`) never reach the client; the
/// engine converts an all-paths-exhausted condition into a SERVFAIL rcode.
#[derive(Debug, thiserror::Error)]
pub enum GudgeonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("list load error: {0}")]
    Load(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("resolution timed out after {0:?}")]
    Timeout(Duration),

    #[error("resolver cycle detected at '{0}'")]
    CycleDetected(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GudgeonError {
    /// Transport and timeout errors trigger source backoff and move the
    /// resolver to the next source.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

impl From<std::io::Error> for GudgeonError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GudgeonError>;
