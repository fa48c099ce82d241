//! Error taxonomy of the inference engine.

use thiserror::Error;

/// Errors surfaced by a sliding-window inference call.
///
/// Configuration errors are raised before the model is invoked. Model and
/// geometry errors abort the current call; nothing is retried at this layer.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("invalid inference configuration: {0}")]
    Config(String),

    #[error("model invocation failed: {0:#}")]
    Model(#[source] anyhow::Error),

    #[error("model returned a malformed prediction: {0}")]
    ModelOutput(String),

    #[error("window geometry invariant violated: {0}")]
    Geometry(String),
}

impl InferenceError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub(crate) fn geometry(message: impl Into<String>) -> Self {
        Self::Geometry(message.into())
    }

    pub(crate) fn model_output(message: impl Into<String>) -> Self {
        Self::ModelOutput(message.into())
    }

    /// True for errors detected before any model work was attempted.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

pub type Result<T, E = InferenceError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_classified() {
        assert!(InferenceError::config("overlap must be < 1").is_config());
        assert!(!InferenceError::geometry("window out of bounds").is_config());
    }

    #[test]
    fn model_error_keeps_source_chain() {
        let source = anyhow::anyhow!("CUDA out of memory").context("batch 3");
        let error = InferenceError::Model(source);
        let rendered = error.to_string();
        assert!(rendered.contains("batch 3"));
        assert!(rendered.contains("CUDA out of memory"));
    }
}
