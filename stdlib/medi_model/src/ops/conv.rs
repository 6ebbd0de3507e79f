//! 2-D convolution over NHWC tensors (Keras kernel layout `[kh, kw, in, out]`)

use serde::{Deserialize, Serialize};

use super::activation::Activation;
use super::Padding;
use crate::backend::{expect_rank, tensor_from_vec, BackendError, Tensor};

fn one() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conv2d {
    pub filters: usize,
    pub kernel_size: [usize; 2],
    #[serde(default = "one")]
    pub strides: usize,
    #[serde(default)]
    pub padding: Padding,
    #[serde(default)]
    pub activation: Activation,
    /// Row-major `[kh, kw, in, out]`.
    pub kernel: Vec<f32>,
    /// Empty means no bias.
    #[serde(default)]
    pub bias: Vec<f32>,
}

/// Resolved geometry of one convolution call.
struct Geometry {
    n: usize,
    h: usize,
    w: usize,
    c: usize,
    oh: usize,
    ow: usize,
    pad_top: isize,
    pad_left: isize,
}

impl Conv2d {
    pub fn new(filters: usize, kernel_size: [usize; 2], kernel: Vec<f32>) -> Self {
        Self {
            filters,
            kernel_size,
            strides: 1,
            padding: Padding::Valid,
            activation: Activation::Linear,
            kernel,
            bias: Vec::new(),
        }
    }

    pub fn with_strides(mut self, strides: usize) -> Self {
        self.strides = strides;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_bias(mut self, bias: Vec<f32>) -> Self {
        self.bias = bias;
        self
    }

    /// Input channel count implied by the kernel length.
    pub fn in_channels(&self) -> usize {
        let per_channel = self.kernel_size[0] * self.kernel_size[1] * self.filters;
        if per_channel == 0 {
            0
        } else {
            self.kernel.len() / per_channel
        }
    }

    pub fn validate(&self, name: &str) -> Result<(), BackendError> {
        let [kh, kw] = self.kernel_size;
        if self.filters == 0 || kh == 0 || kw == 0 || self.strides == 0 {
            return Err(BackendError::LoadError(format!(
                "conv2d '{name}': filters, kernel size and strides must be positive"
            )));
        }
        let cin = self.in_channels();
        if cin == 0 || cin * kh * kw * self.filters != self.kernel.len() {
            return Err(BackendError::LoadError(format!(
                "conv2d '{name}': kernel length {} is not a multiple of {kh}x{kw}x{}",
                self.kernel.len(),
                self.filters
            )));
        }
        if !self.bias.is_empty() && self.bias.len() != self.filters {
            return Err(BackendError::LoadError(format!(
                "conv2d '{name}': bias length {} != filters {}",
                self.bias.len(),
                self.filters
            )));
        }
        Ok(())
    }

    fn geometry(&self, x: &Tensor) -> Result<Geometry, BackendError> {
        let shape = expect_rank(x, 4, "conv2d")?;
        let (n, h, w, c) = (shape[0], shape[1], shape[2], shape[3]);
        if c != self.in_channels() {
            return Err(BackendError::InvalidInput(format!(
                "conv2d expects {} input channels, got {c}",
                self.in_channels()
            )));
        }
        let [kh, kw] = self.kernel_size;
        let (oh, pad_top) = self.padding.output_dim(h, kh, self.strides)?;
        let (ow, pad_left) = self.padding.output_dim(w, kw, self.strides)?;
        Ok(Geometry {
            n,
            h,
            w,
            c,
            oh,
            ow,
            pad_top,
            pad_left,
        })
    }

    /// Visit every (input offset, kernel row offset, output offset) triple of the convolution.
    fn for_each_tap(&self, g: &Geometry, mut f: impl FnMut(usize, usize, usize)) {
        let [kh, kw] = self.kernel_size;
        let s = self.strides;
        let fo = self.filters;
        for b in 0..g.n {
            for oy in 0..g.oh {
                for ox in 0..g.ow {
                    let o_base = ((b * g.oh + oy) * g.ow + ox) * fo;
                    for ky in 0..kh {
                        let iy = (oy * s + ky) as isize - g.pad_top;
                        if iy < 0 || iy >= g.h as isize {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ox * s + kx) as isize - g.pad_left;
                            if ix < 0 || ix >= g.w as isize {
                                continue;
                            }
                            let x_base = ((b * g.h + iy as usize) * g.w + ix as usize) * g.c;
                            let k_base = (ky * kw + kx) * g.c * fo;
                            f(x_base, k_base, o_base);
                        }
                    }
                }
            }
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor, BackendError> {
        let g = self.geometry(x)?;
        let xs = x.as_standard_layout();
        let xd = xs
            .as_slice()
            .ok_or_else(|| BackendError::InferenceError("conv2d input not contiguous".into()))?;
        let fo = self.filters;
        let mut out = vec![0.0f32; g.n * g.oh * g.ow * fo];
        if !self.bias.is_empty() {
            for px in out.chunks_mut(fo) {
                px.copy_from_slice(&self.bias);
            }
        }
        let kernel = &self.kernel;
        self.for_each_tap(&g, |x_base, k_base, o_base| {
            for ci in 0..g.c {
                let xv = xd[x_base + ci];
                if xv == 0.0 {
                    continue;
                }
                let kr = k_base + ci * fo;
                let dst = &mut out[o_base..o_base + fo];
                for (o, k) in dst.iter_mut().zip(&kernel[kr..kr + fo]) {
                    *o += xv * k;
                }
            }
        });
        let mut y = tensor_from_vec(&[g.n, g.oh, g.ow, fo], out)?;
        self.activation.apply(&mut y);
        Ok(y)
    }

    pub fn backward(&self, x: &Tensor, y: &Tensor, grad: &Tensor) -> Result<Tensor, BackendError> {
        let g = self.geometry(x)?;
        let pre = self.activation.backward(y, grad)?;
        let pre = pre.as_standard_layout();
        let gd = pre
            .as_slice()
            .ok_or_else(|| BackendError::InferenceError("conv2d gradient not contiguous".into()))?;
        let fo = self.filters;
        let mut dx = vec![0.0f32; g.n * g.h * g.w * g.c];
        let kernel = &self.kernel;
        self.for_each_tap(&g, |x_base, k_base, o_base| {
            let go = &gd[o_base..o_base + fo];
            for ci in 0..g.c {
                let kr = k_base + ci * fo;
                let acc: f32 = go.iter().zip(&kernel[kr..kr + fo]).map(|(a, b)| a * b).sum();
                dx[x_base + ci] += acc;
            }
        });
        tensor_from_vec(&[g.n, g.h, g.w, g.c], dx)
    }
}
