use medi_model::BackendError;
use thiserror::Error;

/// Failures inside the attribution pipelines.
///
/// These never leave the public entry points [`crate::grad_cam`] and
/// [`crate::compute_shap`], which log them and report "not available".
#[derive(Error, Debug)]
pub enum ExplainError {
    #[error("layer '{0}' was not produced while replaying the model")]
    TargetNotObserved(String),
    #[error("model output is empty")]
    EmptyOutput,
    #[error("unexpected tensor shape: {0}")]
    Shape(String),
    #[error("invalid explainer configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}
