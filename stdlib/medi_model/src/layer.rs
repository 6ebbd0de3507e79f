//! Layer graph nodes
//!
//! A [`Layer`] is either a leaf operator or a container (`sequential`) that
//! holds further layers. Containers may nest arbitrarily deep, mirroring
//! models that embed a pretrained backbone as a sub-model.

use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, Tensor};
use crate::ops::pool::{global_average_pool, global_average_pool_backward};
use crate::ops::{Activation, BatchNorm, Conv2d, Dense, Pool2d, PoolKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub name: String,
    #[serde(flatten)]
    pub op: Op,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    Conv2d(Conv2d),
    Dense(Dense),
    MaxPool2d(Pool2d),
    AveragePool2d(Pool2d),
    GlobalAveragePool2d,
    Flatten,
    Relu,
    Sigmoid,
    Softmax,
    BatchNormalization(BatchNorm),
    Rescaling {
        scale: f32,
        #[serde(default)]
        offset: f32,
    },
    Dropout {
        #[serde(default)]
        rate: f32,
    },
    /// Identity in the forward pass; cuts the gradient.
    StopGradient,
    #[serde(alias = "functional", alias = "model")]
    Sequential {
        #[serde(default)]
        layers: Vec<Layer>,
    },
}

impl Layer {
    pub fn new(name: impl Into<String>, op: Op) -> Self {
        Self {
            name: name.into(),
            op,
        }
    }

    pub fn sequential(name: impl Into<String>, layers: Vec<Layer>) -> Self {
        Self::new(name, Op::Sequential { layers })
    }

    /// Child layers when this node is a container.
    pub fn children(&self) -> Option<&[Layer]> {
        match &self.op {
            Op::Sequential { layers } => Some(layers),
            _ => None,
        }
    }

    /// True for containers that actually hold layers.
    pub fn has_sublayers(&self) -> bool {
        self.children().is_some_and(|c| !c.is_empty())
    }

    pub fn is_conv2d(&self) -> bool {
        matches!(self.op, Op::Conv2d(_))
    }

    pub fn kind(&self) -> &'static str {
        match &self.op {
            Op::Conv2d(_) => "Conv2D",
            Op::Dense(_) => "Dense",
            Op::MaxPool2d(_) => "MaxPooling2D",
            Op::AveragePool2d(_) => "AveragePooling2D",
            Op::GlobalAveragePool2d => "GlobalAveragePooling2D",
            Op::Flatten => "Flatten",
            Op::Relu => "ReLU",
            Op::Sigmoid => "Sigmoid",
            Op::Softmax => "Softmax",
            Op::BatchNormalization(_) => "BatchNormalization",
            Op::Rescaling { .. } => "Rescaling",
            Op::Dropout { .. } => "Dropout",
            Op::StopGradient => "StopGradient",
            Op::Sequential { .. } => "Sequential",
        }
    }

    /// Check parameter shapes for this layer and everything below it.
    pub fn validate(&self) -> Result<(), BackendError> {
        match &self.op {
            Op::Conv2d(c) => c.validate(&self.name),
            Op::Dense(d) => d.validate(&self.name),
            Op::MaxPool2d(p) | Op::AveragePool2d(p) => p.validate(&self.name),
            Op::BatchNormalization(bn) => bn.validate(&self.name),
            Op::Sequential { layers } => layers.iter().try_for_each(Layer::validate),
            _ => Ok(()),
        }
    }

    /// Inference forward pass; containers run their children in order.
    ///
    /// Leaf parameters are checked first, so a layer built in code with
    /// inconsistent shapes fails with `LoadError` instead of panicking.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor, BackendError> {
        if !matches!(self.op, Op::Sequential { .. }) {
            self.validate()?;
        }
        let out = match &self.op {
            Op::Conv2d(c) => c.forward(x)?,
            Op::Dense(d) => d.forward(x)?,
            Op::MaxPool2d(p) => p.forward(PoolKind::Max, x)?,
            Op::AveragePool2d(p) => p.forward(PoolKind::Average, x)?,
            Op::GlobalAveragePool2d => global_average_pool(x)?,
            Op::Flatten => flatten(x)?,
            Op::Relu => activate(Activation::Relu, x),
            Op::Sigmoid => activate(Activation::Sigmoid, x),
            Op::Softmax => activate(Activation::Softmax, x),
            Op::BatchNormalization(bn) => bn.forward(x)?,
            Op::Rescaling { scale, offset } => x.mapv(|v| v * scale + offset),
            Op::Dropout { .. } | Op::StopGradient => x.clone(),
            Op::Sequential { layers } => {
                let mut h = x.clone();
                for layer in layers {
                    h = layer.forward(&h)?;
                }
                h
            }
        };
        Ok(out)
    }

    /// Gradient w.r.t. this layer's input given the gradient w.r.t. its output.
    ///
    /// `Ok(None)` means the operator has no gradient, which disconnects
    /// everything upstream of it from the differentiated output.
    pub fn backward(
        &self,
        input: &Tensor,
        output: &Tensor,
        grad: &Tensor,
    ) -> Result<Option<Tensor>, BackendError> {
        let dx = match &self.op {
            Op::Conv2d(c) => c.backward(input, output, grad)?,
            Op::Dense(d) => d.backward(input, output, grad)?,
            Op::MaxPool2d(p) => p.backward(PoolKind::Max, input, grad)?,
            Op::AveragePool2d(p) => p.backward(PoolKind::Average, input, grad)?,
            Op::GlobalAveragePool2d => global_average_pool_backward(input, grad)?,
            Op::Flatten => grad
                .clone()
                .into_shape_with_order(input.raw_dim())
                .map_err(|e| BackendError::InferenceError(format!("flatten gradient: {e}")))?,
            Op::Relu => Activation::Relu.backward(output, grad)?,
            Op::Sigmoid => Activation::Sigmoid.backward(output, grad)?,
            Op::Softmax => Activation::Softmax.backward(output, grad)?,
            Op::BatchNormalization(bn) => bn.backward(input, grad)?,
            Op::Rescaling { scale, .. } => grad.mapv(|g| g * scale),
            Op::Dropout { .. } => grad.clone(),
            Op::StopGradient => return Ok(None),
            Op::Sequential { layers } if layers.is_empty() => grad.clone(),
            Op::Sequential { .. } => {
                return Err(BackendError::InferenceError(format!(
                    "container '{}' must be differentiated through its children",
                    self.name
                )))
            }
        };
        Ok(Some(dx))
    }
}

fn activate(act: Activation, x: &Tensor) -> Tensor {
    let mut y = x.clone();
    act.apply(&mut y);
    y
}

fn flatten(x: &Tensor) -> Result<Tensor, BackendError> {
    let n = x.shape().first().copied().unwrap_or(0);
    let rest: usize = x.shape().iter().skip(1).product();
    x.as_standard_layout()
        .into_owned()
        .into_shape_with_order(ndarray::IxDyn(&[n, rest]))
        .map_err(|e| BackendError::InferenceError(format!("flatten: {e}")))
}
