//! Error taxonomy for the generation lifecycle.
//!
//! Every failure a caller can observe is one of these variants, so front-ends
//! can react differently to bad input, missing weights, memory pressure, and
//! opaque backend failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenerateError {
    /// Malformed parameters. Rejected before any device access.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Model weights could not be fetched or verified. The pipeline stays
    /// unloaded; the caller may retry later.
    #[error("model unavailable: {0}")]
    ResourceUnavailable(String),

    /// Insufficient device memory at load time or mid-render. The pipeline is
    /// released so the next attempt starts clean.
    #[error("device memory exhausted: {0} (try a lower resolution or fewer steps, or free other GPU users)")]
    ResourceExhausted(String),

    /// Any other backend failure during rendering. The loaded pipeline is
    /// presumed intact; the same request may be retried.
    #[error("render failed: {0}")]
    ExecutionFailure(String),

    /// Artifact persistence failed after a successful render.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl GenerateError {
    /// True for failures caused by device memory pressure.
    pub fn is_memory_pressure(&self) -> bool {
        matches!(self, GenerateError::ResourceExhausted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pressure_classification() {
        assert!(GenerateError::ResourceExhausted("oom".into()).is_memory_pressure());
        assert!(!GenerateError::ExecutionFailure("nan".into()).is_memory_pressure());
        assert!(!GenerateError::InvalidRequest("bad".into()).is_memory_pressure());
    }

    #[test]
    fn exhausted_message_carries_hint() {
        let msg = GenerateError::ResourceExhausted("CUDA out of memory".into()).to_string();
        assert!(msg.contains("lower resolution"));
    }
}
