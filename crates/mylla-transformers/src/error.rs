//! Error types shared across the engine.
//!
//! Numeric kernels never fail; everything fallible happens at setup time
//! (load, quantize, session open) or inside the decode orchestrator, and
//! surfaces synchronously through the token-stream pull.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Header magic mismatch, truncated tensor, unknown dtype tag, or tensor
    /// dims inconsistent with the architecture.
    #[error("malformed model: {0}")]
    MalformedModel(String),

    /// Unsupported quantization triple, ctx_size above the model maximum,
    /// non-positive thread count, and similar parameter rejections.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Unable to map the model file or allocate the KV cache.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// NaN/Inf detected in logits while the numeric guard is enabled.
    #[error("numeric fault: {0}")]
    NumericFault(String),

    /// Session released by the caller mid-step.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Violated internal invariant (e.g. block K does not divide the
    /// reduction dimension).
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        EngineError::MalformedModel(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        EngineError::InvalidConfiguration(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }
}
