//! Fully connected layer: `y = act(x · W + b)`

use serde::{Deserialize, Serialize};

use super::activation::Activation;
use crate::backend::{expect_rank, tensor_from_vec, BackendError, Tensor};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    pub units: usize,
    #[serde(default)]
    pub activation: Activation,
    /// Row-major `[in, units]`.
    pub kernel: Vec<f32>,
    #[serde(default)]
    pub bias: Vec<f32>,
}

impl Dense {
    pub fn new(units: usize, kernel: Vec<f32>) -> Self {
        Self {
            units,
            activation: Activation::Linear,
            kernel,
            bias: Vec::new(),
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_bias(mut self, bias: Vec<f32>) -> Self {
        self.bias = bias;
        self
    }

    pub fn in_features(&self) -> usize {
        if self.units == 0 {
            0
        } else {
            self.kernel.len() / self.units
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), BackendError> {
        if self.units == 0 || self.kernel.is_empty() || self.kernel.len() % self.units != 0 {
            return Err(BackendError::LoadError(format!(
                "dense '{name}': kernel length {} is not a multiple of units {}",
                self.kernel.len(),
                self.units
            )));
        }
        if !self.bias.is_empty() && self.bias.len() != self.units {
            return Err(BackendError::LoadError(format!(
                "dense '{name}': bias length {} != units {}",
                self.bias.len(),
                self.units
            )));
        }
        Ok(())
    }

    fn check_input(&self, x: &Tensor) -> Result<(usize, usize), BackendError> {
        let shape = expect_rank(x, 2, "dense")?;
        if shape[1] != self.in_features() {
            return Err(BackendError::InvalidInput(format!(
                "dense expects {} features, got {}",
                self.in_features(),
                shape[1]
            )));
        }
        Ok((shape[0], shape[1]))
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor, BackendError> {
        let (n, fin) = self.check_input(x)?;
        let u = self.units;
        let mut out = Vec::with_capacity(n * u);
        for row in x.outer_iter() {
            let mut acc = if self.bias.is_empty() {
                vec![0.0f32; u]
            } else {
                self.bias.clone()
            };
            for (i, xv) in row.iter().enumerate().take(fin) {
                let w = &self.kernel[i * u..(i + 1) * u];
                for (a, k) in acc.iter_mut().zip(w) {
                    *a += xv * k;
                }
            }
            out.extend(acc);
        }
        let mut y = tensor_from_vec(&[n, u], out)?;
        self.activation.apply(&mut y);
        Ok(y)
    }

    pub fn backward(&self, x: &Tensor, y: &Tensor, grad: &Tensor) -> Result<Tensor, BackendError> {
        let (n, fin) = self.check_input(x)?;
        let u = self.units;
        let pre = self.activation.backward(y, grad)?;
        let mut dx = Vec::with_capacity(n * fin);
        for g in pre.outer_iter() {
            for i in 0..fin {
                let w = &self.kernel[i * u..(i + 1) * u];
                dx.push(g.iter().zip(w).map(|(a, b)| a * b).sum());
            }
        }
        tensor_from_vec(&[n, fin], dx)
    }
}
