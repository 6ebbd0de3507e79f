//! Per-channel affine layers: inference-mode batch normalization and rescaling

use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, Tensor};

fn default_epsilon() -> f32 {
    1e-3
}

/// Batch normalization with frozen statistics, applied on the last axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Vec<f32>,
    pub beta: Vec<f32>,
    pub moving_mean: Vec<f32>,
    pub moving_variance: Vec<f32>,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

impl BatchNorm {
    pub fn validate(&self, name: &str) -> Result<(), BackendError> {
        let c = self.gamma.len();
        if c == 0
            || self.beta.len() != c
            || self.moving_mean.len() != c
            || self.moving_variance.len() != c
        {
            return Err(BackendError::LoadError(format!(
                "batch_normalization '{name}': parameter vectors must share a non-zero length"
            )));
        }
        Ok(())
    }

    fn scale(&self, ch: usize) -> f32 {
        self.gamma[ch] / (self.moving_variance[ch] + self.epsilon).sqrt()
    }

    fn check(&self, x: &Tensor) -> Result<usize, BackendError> {
        let c = x.shape().last().copied().unwrap_or(0);
        if c != self.gamma.len() {
            return Err(BackendError::InvalidInput(format!(
                "batch_normalization expects {} channels, got {c}",
                self.gamma.len()
            )));
        }
        Ok(c)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor, BackendError> {
        self.check(x)?;
        let last = x.ndim() - 1;
        Ok(Tensor::from_shape_fn(x.raw_dim(), |idx| {
            let ch = idx[last];
            (x[&idx] - self.moving_mean[ch]) * self.scale(ch) + self.beta[ch]
        }))
    }

    pub fn backward(&self, x: &Tensor, grad: &Tensor) -> Result<Tensor, BackendError> {
        self.check(x)?;
        let last = grad.ndim() - 1;
        Ok(Tensor::from_shape_fn(grad.raw_dim(), |idx| {
            grad[&idx] * self.scale(idx[last])
        }))
    }
}
