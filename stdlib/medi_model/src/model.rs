//! Loaded classifier: metadata plus an ordered layer graph

use std::fs::{read_to_string, File};
use std::io::BufWriter;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::backend::{BackendError, Tensor};
use crate::layer::Layer;
use crate::locate::find_last_conv_layer;
use crate::metadata::ModelMetadata;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    #[serde(default)]
    pub metadata: ModelMetadata,
    /// Per-sample input shape `[h, w, c]`; empty disables the check.
    #[serde(default)]
    pub input_shape: Vec<usize>,
    pub layers: Vec<Layer>,
}

impl Model {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self {
            metadata: ModelMetadata::default(),
            input_shape: Vec::new(),
            layers,
        }
    }

    pub fn with_input_shape(mut self, shape: Vec<usize>) -> Self {
        self.input_shape = shape;
        self
    }

    /// Load and validate a model file.
    pub fn load(path: impl AsRef<Path>) -> Result<Model, BackendError> {
        let path = path.as_ref();
        let s = read_to_string(path)?;
        let model = Self::from_json_str(&s)?;
        info!(
            "loaded model '{}' v{} from {} ({} top-level layers)",
            model.name(),
            model.metadata.version,
            path.display(),
            model.layers.len()
        );
        Ok(model)
    }

    pub fn from_json_str(s: &str) -> Result<Model, BackendError> {
        let model: Model = serde_json::from_str(s)?;
        model.validate()?;
        Ok(model)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), BackendError> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), BackendError> {
        self.layers.iter().try_for_each(Layer::validate)
    }

    pub fn name(&self) -> &str {
        if self.metadata.name.is_empty() {
            "model"
        } else {
            &self.metadata.name
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Look up a top-level layer by name; nested layers are not visible here.
    pub fn get_layer(&self, name: &str) -> Result<&Layer, BackendError> {
        self.layers
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| BackendError::LayerNotFound(format!("no top-level layer named {name}")))
    }

    /// True when any top-level layer is a container with children.
    pub fn has_nested_layers(&self) -> bool {
        self.layers.iter().any(Layer::has_sublayers)
    }

    pub fn last_conv_layer(&self) -> Option<&str> {
        find_last_conv_layer(&self.layers)
    }

    pub fn check_input(&self, x: &Tensor) -> Result<(), BackendError> {
        if x.ndim() < 2 {
            return Err(BackendError::InvalidInput(format!(
                "expected a batched input, got shape {:?}",
                x.shape()
            )));
        }
        if !self.input_shape.is_empty() && x.shape()[1..] != self.input_shape[..] {
            return Err(BackendError::InvalidInput(format!(
                "model '{}' expects samples of shape {:?}, got {:?}",
                self.name(),
                self.input_shape,
                &x.shape()[1..]
            )));
        }
        Ok(())
    }

    /// Run the whole graph; the result is `[batch, outputs]`.
    pub fn predict(&self, x: &Tensor) -> Result<Tensor, BackendError> {
        self.check_input(x)?;
        let mut h = x.clone();
        for layer in &self.layers {
            h = layer.forward(&h)?;
            debug!("{} -> {:?}", layer.name, h.shape());
        }
        if h.ndim() != 2 {
            return Err(BackendError::InferenceError(format!(
                "model output must be [batch, outputs], got {:?}",
                h.shape()
            )));
        }
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tensor_from_vec;
    use crate::layer::Op;
    use crate::ops::{Activation, Conv2d, Dense};

    fn tiny() -> Model {
        Model::new(vec![
            Layer::new("conv", Op::Conv2d(Conv2d::new(2, [1, 1], vec![1.0, -1.0]))),
            Layer::new("gap", Op::GlobalAveragePool2d),
            Layer::new(
                "head",
                Op::Dense(Dense::new(2, vec![1.0, 0.0, 0.0, 1.0]).with_activation(Activation::Softmax)),
            ),
        ])
        .with_input_shape(vec![2, 2, 1])
    }

    #[test]
    fn predict_returns_probabilities() {
        let x = tensor_from_vec(&[1, 2, 2, 1], vec![0.2, 0.4, 0.6, 0.8]).unwrap();
        let y = tiny().predict(&x).unwrap();
        assert_eq!(y.shape(), &[1, 2]);
        assert!((y.sum() - 1.0).abs() < 1e-6);
        assert!(y[[0, 0]] > y[[0, 1]]);
    }

    #[test]
    fn code_built_layer_with_bad_bias_is_an_error() {
        let model = Model::new(vec![
            Layer::new(
                "conv",
                Op::Conv2d(Conv2d::new(2, [1, 1], vec![1.0, -1.0]).with_bias(vec![0.1; 3])),
            ),
            Layer::new("gap", Op::GlobalAveragePool2d),
        ]);
        let x = tensor_from_vec(&[1, 2, 2, 1], vec![0.2, 0.4, 0.6, 0.8]).unwrap();
        assert!(matches!(model.predict(&x), Err(BackendError::LoadError(_))));
    }

    #[test]
    fn input_shape_is_enforced() {
        let x = tensor_from_vec(&[1, 3, 3, 1], vec![0.0; 9]).unwrap();
        assert!(matches!(tiny().predict(&x), Err(BackendError::InvalidInput(_))));
    }

    #[test]
    fn get_layer_sees_only_top_level() {
        let model = Model::new(vec![Layer::sequential(
            "base",
            vec![Layer::new("inner_conv", Op::Relu)],
        )]);
        assert!(model.get_layer("base").is_ok());
        assert!(matches!(
            model.get_layer("inner_conv"),
            Err(BackendError::LayerNotFound(_))
        ));
        assert!(model.has_nested_layers());
    }
}
