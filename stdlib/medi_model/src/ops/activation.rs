//! Element-wise and row-wise activations with their input-gradient rules

use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, Tensor};

/// Activation applied by a layer after its affine part (Keras `activation=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
}

impl Activation {
    /// Apply in place; softmax normalizes along the last axis.
    pub fn apply(self, t: &mut Tensor) {
        match self {
            Activation::Linear => {}
            Activation::Relu => t.mapv_inplace(|v| v.max(0.0)),
            Activation::Sigmoid => t.mapv_inplace(|v| 1.0 / (1.0 + (-v).exp())),
            Activation::Tanh => t.mapv_inplace(f32::tanh),
            Activation::Softmax => softmax_last_axis(t),
        }
    }

    /// Gradient w.r.t. the pre-activation, expressed through the activation output `y`.
    pub fn backward(self, y: &Tensor, grad: &Tensor) -> Result<Tensor, BackendError> {
        if y.shape() != grad.shape() {
            return Err(BackendError::InferenceError(format!(
                "activation gradient shape {:?} does not match output {:?}",
                grad.shape(),
                y.shape()
            )));
        }
        let out = match self {
            Activation::Linear => grad.clone(),
            Activation::Relu => {
                let mut g = grad.clone();
                g.zip_mut_with(y, |g, &y| {
                    if y <= 0.0 {
                        *g = 0.0
                    }
                });
                g
            }
            Activation::Sigmoid => {
                let mut g = grad.clone();
                g.zip_mut_with(y, |g, &y| *g *= y * (1.0 - y));
                g
            }
            Activation::Tanh => {
                let mut g = grad.clone();
                g.zip_mut_with(y, |g, &y| *g *= 1.0 - y * y);
                g
            }
            Activation::Softmax => softmax_backward(y, grad),
        };
        Ok(out)
    }
}

fn last_axis_len(t: &Tensor) -> usize {
    t.shape().last().copied().unwrap_or(1).max(1)
}

fn softmax_last_axis(t: &mut Tensor) {
    let k = last_axis_len(t);
    let mut data = t.as_standard_layout().into_owned();
    if let Some(slice) = data.as_slice_mut() {
        for row in slice.chunks_mut(k) {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for v in row.iter_mut() {
                *v = (*v - max).exp();
                sum += *v;
            }
            if sum > 0.0 {
                row.iter_mut().for_each(|v| *v /= sum);
            }
        }
    }
    *t = data;
}

fn softmax_backward(y: &Tensor, grad: &Tensor) -> Tensor {
    let k = last_axis_len(y);
    let y = y.as_standard_layout();
    let g = grad.as_standard_layout();
    let mut out = g.clone().into_owned();
    if let (Some(ys), Some(gs), Some(os)) = (y.as_slice(), g.as_slice(), out.as_slice_mut()) {
        for ((yr, gr), or) in ys.chunks(k).zip(gs.chunks(k)).zip(os.chunks_mut(k)) {
            let dot: f32 = yr.iter().zip(gr).map(|(a, b)| a * b).sum();
            for i in 0..yr.len() {
                or[i] = yr[i] * (gr[i] - dot);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tensor_from_vec;
    use approx::assert_abs_diff_eq;

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut t = tensor_from_vec(&[2, 3], vec![1.0, 2.0, 3.0, -1.0, 0.0, 1000.0]).unwrap();
        Activation::Softmax.apply(&mut t);
        for row in t.outer_iter() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn softmax_gradient_matches_finite_difference() {
        let x = vec![0.3, -0.2, 0.9];
        let seed = [0.0, 0.0, 1.0];
        let mut y = tensor_from_vec(&[1, 3], x.clone()).unwrap();
        Activation::Softmax.apply(&mut y);
        let g = tensor_from_vec(&[1, 3], seed.to_vec()).unwrap();
        let analytic = Activation::Softmax.backward(&y, &g).unwrap();

        let h = 1e-3;
        for i in 0..3 {
            let mut plus = x.clone();
            plus[i] += h;
            let mut minus = x.clone();
            minus[i] -= h;
            let mut yp = tensor_from_vec(&[1, 3], plus).unwrap();
            let mut ym = tensor_from_vec(&[1, 3], minus).unwrap();
            Activation::Softmax.apply(&mut yp);
            Activation::Softmax.apply(&mut ym);
            let numeric = (yp[[0, 2]] - ym[[0, 2]]) / (2.0 * h);
            assert_abs_diff_eq!(analytic[[0, i]], numeric, epsilon = 1e-3);
        }
    }

    #[test]
    fn relu_blocks_gradient_where_inactive() {
        let y = tensor_from_vec(&[4], vec![0.0, 1.0, 0.0, 2.0]).unwrap();
        let g = tensor_from_vec(&[4], vec![1.0; 4]).unwrap();
        let out = Activation::Relu.backward(&y, &g).unwrap();
        assert_eq!(out.as_slice().unwrap(), &[0.0, 1.0, 0.0, 1.0]);
    }
}
