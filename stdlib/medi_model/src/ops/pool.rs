//! Spatial pooling over NHWC tensors

use serde::{Deserialize, Serialize};

use crate::backend::{expect_rank, tensor_from_vec, BackendError, Tensor};

/// Window parameters for max/average pooling; `strides` defaults to the pool size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool2d {
    pub pool_size: [usize; 2],
    #[serde(default)]
    pub strides: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Max,
    Average,
}

impl Pool2d {
    pub fn new(pool_size: [usize; 2]) -> Self {
        Self {
            pool_size,
            strides: None,
        }
    }

    fn strides(&self) -> [usize; 2] {
        match self.strides {
            Some(s) => [s, s],
            None => self.pool_size,
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), BackendError> {
        let [ph, pw] = self.pool_size;
        let [sh, sw] = self.strides();
        if ph == 0 || pw == 0 || sh == 0 || sw == 0 {
            return Err(BackendError::LoadError(format!(
                "pool '{name}': pool size and strides must be positive"
            )));
        }
        Ok(())
    }

    fn output_hw(&self, h: usize, w: usize) -> Result<(usize, usize), BackendError> {
        let [ph, pw] = self.pool_size;
        let [sh, sw] = self.strides();
        if h < ph || w < pw {
            return Err(BackendError::InvalidInput(format!(
                "pool window {ph}x{pw} larger than input {h}x{w}"
            )));
        }
        Ok(((h - ph) / sh + 1, (w - pw) / sw + 1))
    }

    /// Visit each output cell with the flat input offsets of its window.
    fn for_each_window(
        &self,
        shape: &[usize],
        mut f: impl FnMut(usize, &[usize]),
    ) -> Result<Vec<usize>, BackendError> {
        let (n, h, w, c) = (shape[0], shape[1], shape[2], shape[3]);
        let (oh, ow) = self.output_hw(h, w)?;
        let [ph, pw] = self.pool_size;
        let [sh, sw] = self.strides();
        let mut window = Vec::with_capacity(ph * pw);
        for b in 0..n {
            for oy in 0..oh {
                for ox in 0..ow {
                    for ch in 0..c {
                        window.clear();
                        for ky in 0..ph {
                            for kx in 0..pw {
                                let iy = oy * sh + ky;
                                let ix = ox * sw + kx;
                                window.push(((b * h + iy) * w + ix) * c + ch);
                            }
                        }
                        let o = ((b * oh + oy) * ow + ox) * c + ch;
                        f(o, &window);
                    }
                }
            }
        }
        Ok(vec![n, oh, ow, c])
    }

    pub fn forward(&self, kind: PoolKind, x: &Tensor) -> Result<Tensor, BackendError> {
        let shape = expect_rank(x, 4, "pool2d")?.to_vec();
        let xs = x.as_standard_layout();
        let xd = xs
            .as_slice()
            .ok_or_else(|| BackendError::InferenceError("pool input not contiguous".into()))?;
        let (oh, ow) = self.output_hw(shape[1], shape[2])?;
        let mut out = vec![0.0f32; shape[0] * oh * ow * shape[3]];
        let out_shape = self.for_each_window(&shape, |o, window| {
            out[o] = match kind {
                PoolKind::Max => window
                    .iter()
                    .map(|&i| xd[i])
                    .fold(f32::NEG_INFINITY, f32::max),
                PoolKind::Average => {
                    window.iter().map(|&i| xd[i]).sum::<f32>() / window.len() as f32
                }
            };
        })?;
        tensor_from_vec(&out_shape, out)
    }

    pub fn backward(&self, kind: PoolKind, x: &Tensor, grad: &Tensor) -> Result<Tensor, BackendError> {
        let shape = expect_rank(x, 4, "pool2d")?.to_vec();
        let xs = x.as_standard_layout();
        let xd = xs
            .as_slice()
            .ok_or_else(|| BackendError::InferenceError("pool input not contiguous".into()))?;
        let gs = grad.as_standard_layout();
        let gd = gs
            .as_slice()
            .ok_or_else(|| BackendError::InferenceError("pool gradient not contiguous".into()))?;
        let mut dx = vec![0.0f32; xd.len()];
        self.for_each_window(&shape, |o, window| match kind {
            PoolKind::Max => {
                let mut best = window[0];
                for &i in window {
                    if xd[i] > xd[best] {
                        best = i;
                    }
                }
                dx[best] += gd[o];
            }
            PoolKind::Average => {
                let share = gd[o] / window.len() as f32;
                for &i in window {
                    dx[i] += share;
                }
            }
        })?;
        tensor_from_vec(&shape, dx)
    }
}

/// Mean over the spatial axes: `[n, h, w, c] -> [n, c]`.
pub fn global_average_pool(x: &Tensor) -> Result<Tensor, BackendError> {
    let shape = expect_rank(x, 4, "global_average_pool2d")?;
    let (n, c) = (shape[0], shape[3]);
    let area = (shape[1] * shape[2]).max(1) as f32;
    let mut out = vec![0.0f32; n * c];
    for (b, img) in x.outer_iter().enumerate() {
        for row in img.outer_iter() {
            for px in row.outer_iter() {
                for (ch, v) in px.iter().enumerate() {
                    out[b * c + ch] += v / area;
                }
            }
        }
    }
    tensor_from_vec(&[n, c], out)
}

pub fn global_average_pool_backward(x: &Tensor, grad: &Tensor) -> Result<Tensor, BackendError> {
    let shape = expect_rank(x, 4, "global_average_pool2d")?;
    let area = (shape[1] * shape[2]).max(1) as f32;
    let g = expect_rank(grad, 2, "global_average_pool2d gradient")?;
    if g[0] != shape[0] || g[1] != shape[3] {
        return Err(BackendError::InferenceError(format!(
            "gradient shape {g:?} does not match pooled input {shape:?}"
        )));
    }
    Ok(Tensor::from_shape_fn(x.raw_dim(), |idx| {
        grad[[idx[0], idx[3]]] / area
    }))
}
