//! Figures for attribution results
//!
//! Both writers render fully in memory, encode into a temporary file next to
//! the destination and rename it into place, so `dest` either keeps its old
//! contents or receives the complete new image.

use std::collections::HashMap;
use std::fs::read;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use image::imageops::{self, FilterType};
use image::{ImageBuffer, ImageFormat, Luma, Rgb, RgbImage};
use log::{debug, info};
use ndarray::{Array2, Axis};
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use plotters::style::{register_font, FontStyle};
use thiserror::Error;

use medi_model::Tensor;

use crate::colormap::Colormap;
use crate::error::ExplainError;
use crate::shap::AttributionValues;

/// Side of the resized attribution and overlay images.
pub const DISPLAY_SIDE: u32 = 224;
pub const ORIGINAL_WEIGHT: f32 = 0.6;
pub const HEAT_WEIGHT: f32 = 0.4;

const FIG_W: u32 = 1200;
const FIG_H: u32 = 400;
const PANEL_W: i32 = 400;
const SIDE: i32 = 300;
const TOP: i32 = 60;
const BAR_W: i32 = 16;
const FONT_FAMILY: &str = "sans-serif";

#[derive(Error, Debug)]
pub enum VizError {
    #[error("cannot extract attribution values: {0}")]
    Extract(#[from] ExplainError),
    #[error("attribution slice has unsupported shape {0:?}")]
    Shape(Vec<usize>),
    #[error("rendering failed: {0}")]
    Render(String),
    #[error("font error: {0}")]
    Font(String),
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn render_err(e: impl std::fmt::Display) -> VizError {
    VizError::Render(e.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelOrder {
    #[default]
    Rgb,
    Bgr,
}

/// The image an attribution was computed for, as it should be displayed.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pixels: RgbImage,
    order: ChannelOrder,
}

impl SourceImage {
    pub fn new(pixels: RgbImage, order: ChannelOrder) -> Self {
        Self { pixels, order }
    }

    pub fn rgb(pixels: RgbImage) -> Self {
        Self::new(pixels, ChannelOrder::Rgb)
    }

    /// Pixels in RGB order.
    pub fn to_rgb(&self) -> RgbImage {
        let mut out = self.pixels.clone();
        if self.order == ChannelOrder::Bgr {
            for p in out.pixels_mut() {
                p.0.swap(0, 2);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct FigureOptions {
    /// TTF/OTF file for titles and colorbar labels in place of the bundled
    /// DejaVu Sans.
    pub font: Option<PathBuf>,
}

static BUNDLED_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

/// Which face is registered under `FONT_FAMILY`, plus every font file read so
/// far. Files are leaked once per path; switching back reuses the bytes.
#[derive(Default)]
struct FontRegistry {
    active: Option<Option<PathBuf>>,
    loaded: HashMap<PathBuf, &'static [u8]>,
}

static FONTS: OnceLock<Mutex<FontRegistry>> = OnceLock::new();

fn ensure_font(custom: Option<&Path>) -> Result<(), VizError> {
    let slot = FONTS.get_or_init(|| Mutex::new(FontRegistry::default()));
    let mut fonts = slot
        .lock()
        .map_err(|_| VizError::Font("font registry lock poisoned".into()))?;
    if fonts.active.as_ref().map(|f| f.as_deref()) == Some(custom) {
        return Ok(());
    }
    let bytes = match custom {
        None => BUNDLED_FONT,
        Some(path) => match fonts.loaded.get(path).copied() {
            Some(bytes) => bytes,
            None => {
                let bytes: &'static [u8] = Box::leak(read(path)?.into_boxed_slice());
                fonts.loaded.insert(path.to_path_buf(), bytes);
                bytes
            }
        },
    };
    let name = custom.map_or_else(|| "bundled DejaVu Sans".to_string(), |p| p.display().to_string());
    register_font(FONT_FAMILY, FontStyle::Normal, bytes)
        .map_err(|_| VizError::Font(format!("{name}: not a TrueType/OpenType font")))?;
    info!("registered figure font {name}");
    fonts.active = Some(custom.map(Path::to_path_buf));
    Ok(())
}

/// Min-max scale into `[0, 1]`; a flat map becomes all zeros.
pub fn normalize_min_max(map: &Array2<f32>) -> Array2<f32> {
    if map.is_empty() {
        return map.clone();
    }
    let min = map.iter().copied().fold(f32::INFINITY, f32::min);
    let max = map.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min + 1e-8;
    map.mapv(|v| (v - min) / range)
}

/// `[h, w]` passes through, `[h, w, c]` is reduced by summed magnitudes.
pub fn collapse_channels(slice: Tensor) -> Result<Array2<f32>, VizError> {
    match slice.ndim() {
        2 => slice
            .into_dimensionality()
            .map_err(|_| VizError::Shape(Vec::new())),
        3 => Ok(slice
            .mapv(f32::abs)
            .sum_axis(Axis(2))
            .into_dimensionality()
            .map_err(|_| VizError::Shape(Vec::new()))?),
        _ => Err(VizError::Shape(slice.shape().to_vec())),
    }
}

/// Normalized 2-D attribution for `class`.
pub fn class_map(values: &AttributionValues, class: usize) -> Result<Array2<f32>, VizError> {
    let map = collapse_channels(values.for_class(class)?)?;
    if map.is_empty() {
        return Err(VizError::Shape(map.shape().to_vec()));
    }
    Ok(normalize_min_max(&map))
}

/// Bilinear resize of a scalar map to `side` x `side`.
pub fn resize_map(map: &Array2<f32>, side: u32) -> Result<Array2<f32>, VizError> {
    let (h, w) = map.dim();
    let buf: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_raw(w as u32, h as u32, map.iter().copied().collect())
            .ok_or_else(|| VizError::Shape(vec![h, w]))?;
    let resized = imageops::resize(&buf, side, side, FilterType::Triangle);
    Array2::from_shape_vec((side as usize, side as usize), resized.into_raw())
        .map_err(|_| VizError::Shape(vec![side as usize, side as usize]))
}

fn colorize(map: &Array2<f32>, cmap: Colormap) -> RgbImage {
    let (h, w) = map.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| Rgb(cmap.rgb(map[[y as usize, x as usize]])))
}

/// `ORIGINAL_WEIGHT * base + HEAT_WEIGHT * heat`, per channel, saturating.
fn blend(base: &RgbImage, heat: &RgbImage) -> RgbImage {
    RgbImage::from_fn(base.width(), base.height(), |x, y| {
        let (b, h) = (base.get_pixel(x, y).0, heat.get_pixel(x, y).0);
        Rgb(std::array::from_fn(|k| {
            (ORIGINAL_WEIGHT * b[k] as f32 + HEAT_WEIGHT * h[k] as f32)
                .round()
                .clamp(0.0, 255.0) as u8
        }))
    })
}

fn overlay(map: &Array2<f32>, source: &SourceImage, cmap: Colormap) -> Result<RgbImage, VizError> {
    let heat = colorize(&resize_map(map, DISPLAY_SIDE)?, cmap);
    let base = imageops::resize(&source.to_rgb(), DISPLAY_SIDE, DISPLAY_SIDE, FilterType::Triangle);
    Ok(blend(&base, &heat))
}

/// Grad-CAM overlay: JET-colored map over the original, written as JPEG.
pub fn render_heatmap_overlay(
    map: &Array2<f32>,
    source: &SourceImage,
    dest: &Path,
) -> Result<(), VizError> {
    if map.is_empty() {
        return Err(VizError::Shape(map.shape().to_vec()));
    }
    let img = overlay(map, source, Colormap::Jet)?;
    write_atomically(&img, dest, ImageFormat::Jpeg)?;
    debug!("wrote heatmap overlay {}", dest.display());
    Ok(())
}

/// Three panels: original, attribution heatmap with colorbar, overlay.
pub fn compose_shap_figure(
    values: &AttributionValues,
    source: &SourceImage,
    class_index: usize,
    label: Option<&str>,
    dest: &Path,
    options: &FigureOptions,
) -> Result<(), VizError> {
    let map = class_map(values, class_index)?;
    let blended = overlay(&map, source, Colormap::RdBuR)?;
    let heat = colorize(&map, Colormap::RdBuR);
    let original = imageops::resize(&source.to_rgb(), SIDE as u32, SIDE as u32, FilterType::Triangle);
    ensure_font(options.font.as_deref())?;
    let title = match label {
        Some(l) => format!("SHAP: {l}"),
        None => format!("SHAP: Class {class_index}"),
    };

    let mut buf = vec![0u8; (FIG_W * FIG_H * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buf, (FIG_W, FIG_H)).into_drawing_area();
        root.fill(&WHITE).map_err(render_err)?;

        let left = (PANEL_W - SIDE) / 2;
        blit(&root, &original, (left, TOP))?;

        let heat_left = PANEL_W + 30;
        blit(&root, &heat, (heat_left, TOP))?;
        let bar_left = heat_left + SIDE + 16;
        draw_colorbar(&root, (bar_left, TOP))?;

        blit(&root, &blended, (2 * PANEL_W + left, TOP))?;

        caption(&root, "Original Image", 20.0, (PANEL_W / 2, 20))?;
        caption(&root, &title, 20.0, (PANEL_W + PANEL_W / 2, 20))?;
        caption(&root, "SHAP Overlay", 20.0, (2 * PANEL_W + PANEL_W / 2, 20))?;
        for (tick, y) in [("1.0", TOP), ("0.5", TOP + SIDE / 2), ("0.0", TOP + SIDE)] {
            let style = TextStyle::from((FONT_FAMILY, 12.0).into_font())
                .color(&BLACK)
                .pos(Pos::new(HPos::Left, VPos::Center));
            root.draw_text(tick, &style, (bar_left + BAR_W + 6, y))
                .map_err(render_err)?;
        }
        let style = TextStyle::from((FONT_FAMILY, 12.0).into_font())
            .color(&BLACK)
            .pos(Pos::new(HPos::Center, VPos::Top));
        root.draw_text("SHAP Value", &style, (bar_left + BAR_W / 2, TOP + SIDE + 8))
            .map_err(render_err)?;
        root.present().map_err(render_err)?;
    }

    let figure = RgbImage::from_raw(FIG_W, FIG_H, buf)
        .ok_or_else(|| VizError::Render("figure buffer has the wrong size".into()))?;
    write_atomically(&figure, dest, ImageFormat::Png)?;
    debug!("wrote attribution figure {}", dest.display());
    Ok(())
}

type Canvas<'a> = DrawingArea<BitMapBackend<'a>, plotters::coord::Shift>;

/// Draw `img` scaled (nearest) into a `SIDE` x `SIDE` square at `origin`.
fn blit(root: &Canvas<'_>, img: &RgbImage, origin: (i32, i32)) -> Result<(), VizError> {
    let (w, h) = img.dimensions();
    for y in 0..SIDE {
        for x in 0..SIDE {
            let sx = (x as u32 * w / SIDE as u32).min(w.saturating_sub(1));
            let sy = (y as u32 * h / SIDE as u32).min(h.saturating_sub(1));
            let [r, g, b] = img.get_pixel(sx, sy).0;
            root.draw_pixel((origin.0 + x, origin.1 + y), &RGBColor(r, g, b))
                .map_err(render_err)?;
        }
    }
    Ok(())
}

fn draw_colorbar(root: &Canvas<'_>, origin: (i32, i32)) -> Result<(), VizError> {
    for y in 0..SIDE {
        let t = 1.0 - y as f32 / (SIDE - 1) as f32;
        let [r, g, b] = Colormap::RdBuR.rgb(t);
        root.draw(&Rectangle::new(
            [(origin.0, origin.1 + y), (origin.0 + BAR_W, origin.1 + y + 1)],
            RGBColor(r, g, b).filled(),
        ))
        .map_err(render_err)?;
    }
    root.draw(&Rectangle::new(
        [origin, (origin.0 + BAR_W, origin.1 + SIDE)],
        BLACK.stroke_width(1),
    ))
    .map_err(render_err)
}

fn caption(root: &Canvas<'_>, text: &str, size: f64, at: (i32, i32)) -> Result<(), VizError> {
    let style = TextStyle::from((FONT_FAMILY, size).into_font())
        .color(&BLACK)
        .pos(Pos::new(HPos::Center, VPos::Top));
    root.draw_text(text, &style, at).map_err(render_err)
}

fn write_atomically(img: &RgbImage, dest: &Path, format: ImageFormat) -> Result<(), VizError> {
    let dir = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    img.write_to(tmp.as_file_mut(), format)?;
    tmp.as_file_mut().flush()?;
    tmp.persist(dest).map_err(|e| VizError::Io(e.error))?;
    Ok(())
}
