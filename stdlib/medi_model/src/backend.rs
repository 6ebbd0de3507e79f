//! Error type and tensor helpers shared by every layer operator

use ndarray::{ArrayD, IxDyn};
use thiserror::Error;

/// Dense activation tensor, NHWC for image data and `[batch, features]` after flattening.
pub type Tensor = ArrayD<f32>;

/// Errors that can occur while loading a model or running it
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Model loading failed: {0}")]
    LoadError(String),
    #[error("Inference failed: {0}")]
    InferenceError(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Layer not found: {0}")]
    LayerNotFound(String),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Build a tensor from a shape and row-major data, checking the element count.
pub fn tensor_from_vec(shape: &[usize], data: Vec<f32>) -> Result<Tensor, BackendError> {
    let expected: usize = shape.iter().product();
    if data.len() != expected {
        return Err(BackendError::InvalidInput(format!(
            "data length {} does not match shape {:?} (expected {})",
            data.len(),
            shape,
            expected
        )));
    }
    ArrayD::from_shape_vec(IxDyn(shape), data)
        .map_err(|e| BackendError::InvalidInput(format!("shape {shape:?}: {e}")))
}

/// Require a tensor of the given rank, returning its shape.
pub(crate) fn expect_rank<'a>(
    t: &'a Tensor,
    rank: usize,
    what: &str,
) -> Result<&'a [usize], BackendError> {
    if t.ndim() != rank {
        return Err(BackendError::InvalidInput(format!(
            "{what} expects a rank-{rank} tensor, got shape {:?}",
            t.shape()
        )));
    }
    Ok(t.shape())
}

/// Index of the largest element in a row; ties resolve to the lowest index.
pub fn argmax(row: impl IntoIterator<Item = f32>) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, v) in row.into_iter().enumerate() {
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}
