#![allow(dead_code)]

use std::sync::Once;

use medi_model::{tensor_from_vec, Activation, Conv2d, Dense, Layer, Model, Op, Padding, Pool2d, Tensor};

pub const SIDE: usize = 16;

static INIT: Once = Once::new();
pub fn setup_test_logger() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub fn weights(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32) * 0.61 + phase).cos() * 0.4).collect()
}

pub fn conv(name: &str, in_ch: usize, filters: usize) -> Layer {
    Layer::new(
        name,
        Op::Conv2d(
            Conv2d::new(filters, [3, 3], weights(9 * in_ch * filters, in_ch as f32))
                .with_padding(Padding::Same)
                .with_activation(Activation::Relu),
        ),
    )
}

pub fn head(inputs: usize, classes: usize) -> Layer {
    Layer::new(
        "predictions",
        Op::Dense(Dense::new(classes, weights(inputs * classes, 2.0)).with_activation(Activation::Softmax)),
    )
}

/// Pretrained-backbone layout: a stem conv, a nested feature extractor and a head.
pub fn backbone_model(freeze_features: bool) -> Model {
    let mut features = vec![
        conv("block1_conv1", 3, 4),
        Layer::new("block1_pool", Op::MaxPool2d(Pool2d::new([2, 2]))),
        conv("block2_conv1", 4, 6),
    ];
    if freeze_features {
        features.push(Layer::new("frozen", Op::StopGradient));
    }
    Model::new(vec![
        conv("conv_stem", 3, 3),
        Layer::sequential("vgg16", features),
        Layer::new("gap", Op::GlobalAveragePool2d),
        Layer::new("dropout", Op::Dropout { rate: 0.5 }),
        head(6, 4),
    ])
    .with_input_shape(vec![SIDE, SIDE, 3])
}

pub fn image() -> Tensor {
    let data = (0..SIDE * SIDE * 3)
        .map(|i| {
            let (y, x) = (i / (SIDE * 3), (i / 3) % SIDE);
            if (4..12).contains(&y) && (6..14).contains(&x) {
                0.9
            } else {
                0.1 + (i % 5) as f32 * 0.02
            }
        })
        .collect();
    tensor_from_vec(&[1, SIDE, SIDE, 3], data).expect("image")
}
