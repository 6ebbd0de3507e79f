//! Reverse-mode differentiation over a recorded sequence of leaf layers
//!
//! A [`GradientTape`] records every leaf layer executed through it together
//! with that layer's input and output. [`GradientTape::watch`] marks the
//! tensor produced at the current point of the recording; [`GradientTape::gradient`]
//! then walks the recorded layers backwards from the final output to that
//! point. Tapes are meant to live for a single call and be dropped right after.

use log::trace;

use crate::backend::{BackendError, Tensor};
use crate::layer::Layer;

struct Recorded<'m> {
    layer: &'m Layer,
    input: Tensor,
    output: Tensor,
}

#[derive(Default)]
pub struct GradientTape<'m> {
    entries: Vec<Recorded<'m>>,
    watched: Option<usize>,
}

impl<'m> GradientTape<'m> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            watched: None,
        }
    }

    /// Run one leaf layer and record it.
    pub fn record(&mut self, layer: &'m Layer, input: Tensor) -> Result<Tensor, BackendError> {
        let output = layer.forward(&input)?;
        trace!(
            "tape: {} ({}) {:?} -> {:?}",
            layer.name,
            layer.kind(),
            input.shape(),
            output.shape()
        );
        self.entries.push(Recorded {
            layer,
            input,
            output: output.clone(),
        });
        Ok(output)
    }

    /// Run a layer, descending into containers so that every leaf is recorded.
    pub fn run(&mut self, layer: &'m Layer, input: Tensor) -> Result<Tensor, BackendError> {
        match layer.children() {
            Some(children) if !children.is_empty() => {
                let mut h = input;
                for child in children {
                    h = self.run(child, h)?;
                }
                Ok(h)
            }
            _ => self.record(layer, input),
        }
    }

    /// Track the tensor produced by everything recorded so far.
    pub fn watch(&mut self) {
        self.watched = Some(self.entries.len());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Gradient of `sum(seed * output)` w.r.t. the watched tensor.
    ///
    /// Returns `Ok(None)` when nothing is watched or when a recorded layer
    /// between the watched tensor and the output has no gradient.
    pub fn gradient(&self, seed: Tensor) -> Result<Option<Tensor>, BackendError> {
        let Some(start) = self.watched else {
            return Ok(None);
        };
        let mut grad = seed;
        for entry in self.entries[start..].iter().rev() {
            match entry.layer.backward(&entry.input, &entry.output, &grad)? {
                Some(g) => grad = g,
                None => {
                    trace!("tape: gradient cut at {}", entry.layer.name);
                    return Ok(None);
                }
            }
        }
        Ok(Some(grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tensor_from_vec;
    use crate::layer::Op;
    use crate::ops::{Activation, Dense};
    use approx::assert_abs_diff_eq;

    fn scale_layer(name: &str, scale: f32) -> Layer {
        Layer::new(name, Op::Rescaling { scale, offset: 0.0 })
    }

    #[test]
    fn chain_rule_through_recorded_layers() {
        let a = scale_layer("a", 2.0);
        let b = Layer::new(
            "b",
            Op::Dense(Dense::new(1, vec![3.0, -1.0]).with_activation(Activation::Linear)),
        );
        let mut tape = GradientTape::new();
        let x = tensor_from_vec(&[1, 2], vec![1.0, 1.0]).unwrap();
        let h = tape.record(&a, x).unwrap();
        tape.watch();
        let y = tape.record(&b, h).unwrap();
        let seed = Tensor::ones(y.raw_dim());
        let g = tape.gradient(seed).unwrap().unwrap();
        assert_abs_diff_eq!(g[[0, 0]], 3.0);
        assert_abs_diff_eq!(g[[0, 1]], -1.0);
    }

    #[test]
    fn unwatched_tape_has_no_gradient() {
        let a = scale_layer("a", 2.0);
        let mut tape = GradientTape::new();
        let x = tensor_from_vec(&[1, 1], vec![1.0]).unwrap();
        let y = tape.record(&a, x).unwrap();
        assert!(tape.gradient(y).unwrap().is_none());
    }

    #[test]
    fn stop_gradient_disconnects_watched_tensor() {
        let a = scale_layer("a", 2.0);
        let cut = Layer::new("cut", Op::StopGradient);
        let mut tape = GradientTape::new();
        tape.watch();
        let x = tensor_from_vec(&[1, 1], vec![1.0]).unwrap();
        let h = tape.record(&a, x).unwrap();
        let y = tape.record(&cut, h).unwrap();
        assert!(tape.gradient(y).unwrap().is_none());
    }

    #[test]
    fn run_records_leaves_of_nested_containers() {
        let inner = Layer::sequential("inner", vec![scale_layer("x2", 2.0), scale_layer("x3", 3.0)]);
        let outer = Layer::sequential("outer", vec![inner, scale_layer("x5", 5.0)]);
        let mut tape = GradientTape::new();
        tape.watch();
        let x = tensor_from_vec(&[1, 1], vec![1.0]).unwrap();
        let y = tape.run(&outer, x).unwrap();
        assert_eq!(tape.len(), 3);
        assert_abs_diff_eq!(y[[0, 0]], 30.0);
        let g = tape.gradient(Tensor::ones(y.raw_dim())).unwrap().unwrap();
        assert_abs_diff_eq!(g[[0, 0]], 30.0);
    }
}
