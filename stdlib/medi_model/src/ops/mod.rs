//! Layer operators: forward pass plus the gradient w.r.t. each operator's input

pub mod activation;
pub mod conv;
pub mod dense;
pub mod norm;
pub mod pool;

use serde::{Deserialize, Serialize};

use crate::backend::BackendError;

pub use activation::Activation;
pub use conv::Conv2d;
pub use dense::Dense;
pub use norm::BatchNorm;
pub use pool::{Pool2d, PoolKind};

/// Border handling for convolutions, with TensorFlow's split of odd padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    #[default]
    Valid,
    Same,
}

impl Padding {
    /// Output length and leading pad for one spatial axis.
    pub fn output_dim(
        self,
        size: usize,
        kernel: usize,
        stride: usize,
    ) -> Result<(usize, isize), BackendError> {
        if size == 0 || stride == 0 {
            return Err(BackendError::InvalidInput(format!(
                "cannot convolve axis of length {size} with stride {stride}"
            )));
        }
        match self {
            Padding::Valid => {
                if size < kernel {
                    return Err(BackendError::InvalidInput(format!(
                        "kernel {kernel} larger than input {size} with valid padding"
                    )));
                }
                Ok(((size - kernel) / stride + 1, 0))
            }
            Padding::Same => {
                let out = size.div_ceil(stride);
                let total = ((out - 1) * stride + kernel).saturating_sub(size);
                Ok((out, (total / 2) as isize))
            }
        }
    }
}
