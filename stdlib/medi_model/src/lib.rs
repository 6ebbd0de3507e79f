//! Layer graphs, gradient tape and model loading for Medi imaging models
//!
//! Models are ordered lists of [`Layer`]s read from a JSON model file. A layer
//! is either a leaf operator (convolution, dense, pooling, ...) or a container
//! holding further layers, so pretrained backbones embedded as sub-models keep
//! their structure. Every operator knows its forward pass and the gradient
//! w.r.t. its input, which is all [`GradientTape`] needs for class activation
//! maps.

pub mod backend;
pub mod layer;
pub mod locate;
pub mod metadata;
pub mod model;
pub mod ops;
pub mod tape;

pub use backend::{argmax, tensor_from_vec, BackendError, Tensor};
pub use layer::{Layer, Op};
pub use locate::{find_last_conv_layer, is_conv_candidate};
pub use metadata::{ModelMetadata, ModelVersion};
pub use model::Model;
pub use ops::{Activation, BatchNorm, Conv2d, Dense, Padding, Pool2d};
pub use tape::GradientTape;
