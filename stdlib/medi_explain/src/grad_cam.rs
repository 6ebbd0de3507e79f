//! Gradient-weighted class activation maps
//!
//! [`grad_cam`] picks a strategy from the model's structure. Flat models run
//! through an [`ActivationModel`] that exposes the target layer's output next
//! to the final output; models embedding sub-models are replayed leaf by leaf
//! so the target can be watched wherever it sits. A flat failure is retried
//! with the nested replay; a nested failure means no map for this request.
//!
//! When the tape cannot reach the target (a `stop_gradient` or similar sits in
//! between) the map degrades to the plain channel mean of the activations.

use log::{debug, info, warn};
use ndarray::{s, Array1, Array2, ArrayView1, Axis, Ix4};
use serde::Serialize;

use medi_model::{argmax, GradientTape, Layer, Model, Tensor};

use crate::error::ExplainError;

/// Added to the maximum before normalizing so all-zero maps stay finite.
pub const NORM_EPSILON: f32 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributionMethod {
    GradCam,
    ActivationMean,
}

/// Saliency over the target layer's feature map, values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct AttributionMap {
    pub values: Array2<f32>,
    pub method: AttributionMethod,
    pub class_index: usize,
    pub layer: String,
}

impl AttributionMap {
    /// `(height, width)` of the map.
    pub fn dims(&self) -> (usize, usize) {
        self.values.dim()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Flat,
    Nested,
}

/// Outcome of one strategy run.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    /// Worth trying the nested replay.
    Retry(String),
    Failed(String),
}

impl Strategy {
    /// Nested replay whenever a top-level layer holds sub-layers.
    pub fn for_model(model: &Model) -> Self {
        if model.has_nested_layers() {
            Strategy::Nested
        } else {
            Strategy::Flat
        }
    }

    pub fn attempt(self, model: &Model, input: &Tensor, layer: &str) -> Attempt<AttributionMap> {
        let captured = match self {
            Strategy::Flat => {
                ActivationModel::new(model, layer).and_then(|am| am.capture(input))
            }
            Strategy::Nested => replay_nested(model, input, layer),
        };
        match (self, captured.and_then(|c| c.into_map(layer))) {
            (_, Ok(map)) => Attempt::Success(map),
            (Strategy::Flat, Err(e)) => Attempt::Retry(e.to_string()),
            (Strategy::Nested, Err(e)) => Attempt::Failed(e.to_string()),
        }
    }
}

/// Grad-CAM for the predicted class at `layer`, or `None` when no strategy
/// could produce a map. Never fails the caller.
pub fn grad_cam(model: &Model, input: &Tensor, layer: &str) -> Option<AttributionMap> {
    let mut strategy = Strategy::for_model(model);
    loop {
        debug!("grad-cam: {strategy:?} strategy on layer {layer}");
        match strategy.attempt(model, input, layer) {
            Attempt::Success(map) => {
                info!(
                    "grad-cam: {:?} map {:?} for class {} via {:?}",
                    map.method,
                    map.dims(),
                    map.class_index,
                    strategy
                );
                return Some(map);
            }
            Attempt::Retry(reason) => {
                info!("grad-cam: flat strategy failed ({reason}), replaying nested");
                strategy = Strategy::Nested;
            }
            Attempt::Failed(reason) => {
                warn!("grad-cam: unavailable for layer {layer}: {reason}");
                return None;
            }
        }
    }
}

/// Target activations, final output and (when reachable) the gradient of
/// the predicted class score w.r.t. the activations.
#[derive(Debug)]
pub struct Captured {
    pub activation: Tensor,
    pub output: Tensor,
    pub class_index: usize,
    pub gradient: Option<Tensor>,
}

impl Captured {
    fn into_map(self, layer: &str) -> Result<AttributionMap, ExplainError> {
        let (values, method) = compute_map(&self.activation, self.gradient.as_ref())?;
        Ok(AttributionMap {
            values,
            method,
            class_index: self.class_index,
            layer: layer.to_string(),
        })
    }
}

/// View of a flat model with two outputs: a top-level layer and the head.
pub struct ActivationModel<'m> {
    model: &'m Model,
    target: usize,
}

impl<'m> ActivationModel<'m> {
    /// Fails unless `layer` names a top-level layer.
    pub fn new(model: &'m Model, layer: &str) -> Result<Self, ExplainError> {
        model.get_layer(layer)?;
        let target = model
            .layers()
            .iter()
            .rposition(|l| l.name == layer)
            .ok_or_else(|| ExplainError::TargetNotObserved(layer.to_string()))?;
        Ok(Self { model, target })
    }

    pub fn capture(&self, input: &Tensor) -> Result<Captured, ExplainError> {
        self.model.check_input(input)?;
        let mut tape = GradientTape::new();
        let mut h = input.clone();
        let mut activation = None;
        for (i, layer) in self.model.layers().iter().enumerate() {
            h = tape.run(layer, h)?;
            if i == self.target {
                activation = Some(h.clone());
                tape.watch();
            }
        }
        let activation = activation.ok_or_else(|| {
            ExplainError::TargetNotObserved(self.model.layers()[self.target].name.clone())
        })?;
        differentiate(tape, activation, h)
    }
}

/// Replay the model leaf by leaf, watching the last place `layer` is produced.
fn replay_nested(model: &Model, input: &Tensor, layer: &str) -> Result<Captured, ExplainError> {
    model.check_input(input)?;
    let mut tape = GradientTape::new();
    let mut activation = None;
    let output = replay(&mut tape, model.layers(), input.clone(), layer, &mut activation)?;
    let activation = activation.ok_or_else(|| ExplainError::TargetNotObserved(layer.to_string()))?;
    differentiate(tape, activation, output)
}

fn replay<'m>(
    tape: &mut GradientTape<'m>,
    layers: &'m [Layer],
    mut h: Tensor,
    target: &str,
    activation: &mut Option<Tensor>,
) -> Result<Tensor, ExplainError> {
    for layer in layers {
        h = match layer.children() {
            Some(children) if !children.is_empty() => {
                debug!("replaying nested model {}", layer.name);
                replay(tape, children, h, target, activation)?
            }
            _ => tape.record(layer, h)?,
        };
        // A later layer with the same name replaces the earlier capture, so
        // the watched tensor is the one nearest the output.
        if layer.name == target {
            debug!("watching {} ({:?})", layer.name, h.shape());
            *activation = Some(h.clone());
            tape.watch();
        }
    }
    Ok(h)
}

fn differentiate(
    tape: GradientTape<'_>,
    activation: Tensor,
    output: Tensor,
) -> Result<Captured, ExplainError> {
    if output.ndim() != 2 {
        return Err(ExplainError::Shape(format!(
            "expected [batch, classes] output, got {:?}",
            output.shape()
        )));
    }
    let class_index = argmax(output.index_axis(Axis(0), 0).iter().copied())
        .ok_or(ExplainError::EmptyOutput)?;
    let mut seed = Tensor::zeros(output.raw_dim());
    seed[[0, class_index]] = 1.0;
    let gradient = tape.gradient(seed)?;
    if gradient.is_none() {
        debug!("no gradient reaches the target layer");
    }
    Ok(Captured {
        activation,
        output,
        class_index,
        gradient,
    })
}

/// Combine `[batch, h, w, c]` activations into one rectified, max-normalized
/// map. With a gradient the channels are weighted by its spatial mean,
/// otherwise they are averaged.
pub fn compute_map(
    activation: &Tensor,
    gradient: Option<&Tensor>,
) -> Result<(Array2<f32>, AttributionMethod), ExplainError> {
    let act = activation.view().into_dimensionality::<Ix4>().map_err(|_| {
        ExplainError::Shape(format!("activation {:?} is not [b, h, w, c]", activation.shape()))
    })?;
    if act.shape()[0] == 0 {
        return Err(ExplainError::Shape("empty batch".into()));
    }
    let channels = act.shape()[3];
    let (weights, method) = match gradient {
        Some(g) => {
            if g.shape() != activation.shape() {
                return Err(ExplainError::Shape(format!(
                    "gradient {:?} does not match activation {:?}",
                    g.shape(),
                    activation.shape()
                )));
            }
            let g = g
                .view()
                .into_dimensionality::<Ix4>()
                .map_err(|e| ExplainError::Shape(e.to_string()))?;
            let w = g
                .mean_axis(Axis(0))
                .and_then(|m| m.mean_axis(Axis(0)))
                .and_then(|m| m.mean_axis(Axis(0)))
                .ok_or_else(|| ExplainError::Shape("empty gradient".into()))?;
            (w, AttributionMethod::GradCam)
        }
        None => (
            Array1::from_elem(channels, 1.0 / channels.max(1) as f32),
            AttributionMethod::ActivationMean,
        ),
    };

    let first = act.slice(s![0, .., .., ..]);
    let (h, w) = (first.shape()[0], first.shape()[1]);
    let mut map = Array2::from_shape_fn((h, w), |(i, j)| {
        let pixel: ArrayView1<f32> = first.slice(s![i, j, ..]);
        pixel.dot(&weights)
    });
    map.mapv_inplace(|v| v.max(0.0));
    let max = map.iter().copied().fold(0.0f32, f32::max);
    map.mapv_inplace(|v| v / (max + NORM_EPSILON));
    Ok((map, method))
}
