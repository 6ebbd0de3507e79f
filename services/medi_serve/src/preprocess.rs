//! Uploaded bytes to model input

use image::imageops::FilterType;
use image::DynamicImage;
use medi_model::{tensor_from_vec, Tensor};

use crate::error::ServeError;

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, ServeError> {
    image::load_from_memory(bytes).map_err(|e| ServeError::Preprocess(e.to_string()))
}

/// RGB, resized to `side` x `side`, scaled to `[0, 1]`, shaped `[1, side, side, 3]`.
pub fn to_input(img: &DynamicImage, side: u32) -> Result<Tensor, ServeError> {
    let rgb = img.resize_exact(side, side, FilterType::Triangle).to_rgb8();
    let data = rgb.into_raw().into_iter().map(|v| v as f32 / 255.0).collect();
    let side = side as usize;
    tensor_from_vec(&[1, side, side, 3], data).map_err(|e| ServeError::Preprocess(e.to_string()))
}
