//! Small deterministic models shared by the unit tests.

use medi_model::{
    tensor_from_vec, Activation, Conv2d, Dense, Layer, Model, Op, Padding, Pool2d, Tensor,
};

pub(crate) const SIDE: usize = 8;
pub(crate) const CLASSES: usize = 4;

pub(crate) fn weights(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32) * 0.73 + phase).sin() * 0.5).collect()
}

fn conv(name: &str, filters: usize) -> Layer {
    Layer::new(
        name,
        Op::Conv2d(
            Conv2d::new(filters, [3, 3], weights(3 * 3 * 3 * filters, 0.1))
                .with_padding(Padding::Same)
                .with_activation(Activation::Relu)
                .with_bias(vec![0.05; filters]),
        ),
    )
}

fn head(inputs: usize) -> Layer {
    Layer::new(
        "head",
        Op::Dense(
            Dense::new(CLASSES, weights(inputs * CLASSES, 1.3)).with_activation(Activation::Softmax),
        ),
    )
}

pub(crate) fn flat_model(stop_gradient: bool) -> Model {
    let mut layers = vec![conv("conv2d", 4)];
    if stop_gradient {
        layers.push(Layer::new("freeze", Op::StopGradient));
    }
    layers.push(Layer::new("gap", Op::GlobalAveragePool2d));
    layers.push(head(4));
    Model::new(layers).with_input_shape(vec![SIDE, SIDE, 3])
}

pub(crate) fn nested_model() -> Model {
    Model::new(vec![
        Layer::sequential(
            "backbone",
            vec![conv("block_conv", 4), Layer::new("block_act", Op::Relu)],
        ),
        Layer::new("gap", Op::GlobalAveragePool2d),
        head(4),
    ])
    .with_input_shape(vec![SIDE, SIDE, 3])
}

/// A backbone whose last conv reuses the name of a full-resolution conv
/// before it.
pub(crate) fn shadowed_name_model() -> Model {
    Model::new(vec![
        conv("feat", 3),
        Layer::sequential(
            "backbone",
            vec![Layer::new("pool", Op::MaxPool2d(Pool2d::new([2, 2]))), conv("feat", 4)],
        ),
        Layer::new("gap", Op::GlobalAveragePool2d),
        head(4),
    ])
    .with_input_shape(vec![SIDE, SIDE, 3])
}

/// One sample with some spatial structure.
pub(crate) fn input() -> Tensor {
    let data = (0..SIDE * SIDE * 3)
        .map(|i| ((i * 7 + i / 3) % 11) as f32 / 10.0)
        .collect();
    tensor_from_vec(&[1, SIDE, SIDE, 3], data).expect("fixture input")
}
