//! Error kinds for the detection pipeline.

use thiserror::Error;

/// Errors surfaced by the core engine.
///
/// `LoadFailure` is fatal at startup (misconfigured deployment); every
/// other kind is recoverable and must never stop the capture loop.
#[derive(Debug, Error)]
pub enum IdsError {
    #[error("failed to load {what}: {reason}")]
    LoadFailure { what: String, reason: String },

    #[error("capture error: {0}")]
    Capture(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("alert delivery failed: {0}")]
    AlertDelivery(String),
}

impl IdsError {
    pub fn load(what: impl Into<String>, reason: impl ToString) -> Self {
        IdsError::LoadFailure {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IdsError>;
