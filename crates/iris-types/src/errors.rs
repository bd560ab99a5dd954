use thiserror::Error;

use crate::frame::FrameId;

pub type Result<T, E = IrisError> = std::result::Result<T, E>;

/// Unified error type covering the failure modes of the streaming pipeline.
#[derive(Debug, Error)]
pub enum IrisError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("capture error: {0}")]
    Capture(String),
    #[error("channel error: {0}")]
    Channel(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("stale result for frame {0}")]
    StaleResult(FrameId),
    #[error("frame {0} timed out")]
    Timeout(FrameId),
    #[error("operational error: {0}")]
    Ops(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IrisError {
    /// Errors the pipeline absorbs without surfacing anything to the user.
    pub fn is_silent(&self) -> bool {
        matches!(self, IrisError::StaleResult(_) | IrisError::Timeout(_))
    }
}
