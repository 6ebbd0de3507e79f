//! Perturbation-based feature attribution
//!
//! Pixels are "removed" by replacing them with a box-blurred copy of the
//! image. [`PartitionExplainer`] starts from the whole image and keeps
//! splitting the region with the largest attribution in two, giving each half
//! a symmetric Owen-style share of its parent's value, until the evaluation
//! budget runs out. Attributions therefore always add up to
//! `f(image) - f(blurred image)` for every class.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::{debug, info, warn};
use ndarray::{s, stack, Array1, Array2, Array3, ArrayView3, Axis, Ix4};

use medi_model::{Model, Tensor};

use crate::error::ExplainError;

/// Anything that maps an image batch `[n, h, w, c]` to probabilities `[n, k]`.
pub trait Predict {
    fn predict(&self, batch: &Tensor) -> Result<Array2<f32>, ExplainError>;
}

impl<F> Predict for F
where
    F: Fn(&Tensor) -> Result<Array2<f32>, ExplainError>,
{
    fn predict(&self, batch: &Tensor) -> Result<Array2<f32>, ExplainError> {
        self(batch)
    }
}

/// Model output as a probability matrix with at least two columns.
///
/// A single sigmoid column `p` becomes `[1 - p, p]`; wider outputs pass
/// through unchanged.
pub struct ProbabilityView<'m> {
    model: &'m Model,
}

impl<'m> ProbabilityView<'m> {
    pub fn new(model: &'m Model) -> Self {
        Self { model }
    }
}

impl Predict for ProbabilityView<'_> {
    fn predict(&self, batch: &Tensor) -> Result<Array2<f32>, ExplainError> {
        let y = self.model.predict(batch)?;
        let y = y
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| ExplainError::Shape(e.to_string()))?;
        Ok(two_column(y))
    }
}

/// `[n, 1]` becomes `[n, 2]` as `[1 - p, p]`; other widths are returned as is.
pub fn two_column(y: Array2<f32>) -> Array2<f32> {
    if y.ncols() != 1 {
        return y;
    }
    let p = y.column(0);
    let mut out = Array2::zeros((y.nrows(), 2));
    out.column_mut(0).assign(&p.mapv(|v| 1.0 - v));
    out.column_mut(1).assign(&p);
    out
}

/// Replaces masked pixels with a blurred copy of the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageMasker {
    kernel: [usize; 2],
}

impl ImageMasker {
    /// Box blur of `kh` rows by `kw` columns.
    pub fn blur(kh: usize, kw: usize) -> Self {
        Self {
            kernel: [kh.max(1), kw.max(1)],
        }
    }

    /// Fully masked version of `image` (`[h, w, c]`).
    ///
    /// The window is anchored at its centre and truncated at the borders.
    pub fn background(&self, image: ArrayView3<f32>) -> Array3<f32> {
        let [kh, kw] = self.kernel;
        let rows = box_pass(image, Axis(0), kh);
        box_pass(rows.view(), Axis(1), kw)
    }
}

impl Default for ImageMasker {
    fn default() -> Self {
        Self::blur(10, 10)
    }
}

fn box_pass(x: ArrayView3<f32>, axis: Axis, k: usize) -> Array3<f32> {
    let len = x.len_of(axis);
    let before = k / 2;
    let after = k - 1 - before;
    let mut out = Array3::zeros(x.raw_dim());
    for (mut dst, src) in out
        .lanes_mut(axis)
        .into_iter()
        .zip(x.lanes(axis).into_iter())
    {
        let mut prefix = Vec::with_capacity(len + 1);
        prefix.push(0.0f32);
        for v in src.iter() {
            prefix.push(prefix[prefix.len() - 1] + v);
        }
        for i in 0..len {
            let lo = i.saturating_sub(before);
            let hi = (i + after + 1).min(len);
            dst[i] = (prefix[hi] - prefix[lo]) / (hi - lo) as f32;
        }
    }
    out
}

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub top: usize,
    pub left: usize,
    pub height: usize,
    pub width: usize,
}

impl Region {
    fn area(&self) -> usize {
        self.height * self.width
    }

    /// Halves along the longer side, `None` for a single pixel.
    fn split(&self) -> Option<(Region, Region)> {
        if self.height >= self.width && self.height > 1 {
            let h = self.height / 2;
            Some((
                Region { height: h, ..*self },
                Region {
                    top: self.top + h,
                    height: self.height - h,
                    ..*self
                },
            ))
        } else if self.width > 1 {
            let w = self.width / 2;
            Some((
                Region { width: w, ..*self },
                Region {
                    left: self.left + w,
                    width: self.width - w,
                    ..*self
                },
            ))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    region: Region,
    /// Attribution assigned to the region, per class.
    value: Array1<f32>,
    /// Prediction with only this region unmasked.
    output: Array1<f32>,
}

struct Pending {
    priority: f32,
    seq: usize,
    node: Node,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .total_cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Attribution output in the shape `[1, h, w, c, k]`, plus `f(background)`.
#[derive(Debug, Clone)]
pub struct Explanation {
    pub values: Tensor,
    pub base_values: Array1<f32>,
}

/// Hierarchical region-splitting explainer with a hard evaluation budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionExplainer {
    /// Upper bound on the number of images sent through the model.
    pub max_evals: usize,
    /// Upper bound on images per forward pass.
    pub batch_size: usize,
}

impl Default for PartitionExplainer {
    fn default() -> Self {
        Self {
            max_evals: 50,
            batch_size: 100,
        }
    }
}

impl PartitionExplainer {
    pub fn new(max_evals: usize, batch_size: usize) -> Self {
        Self {
            max_evals,
            batch_size,
        }
    }

    fn validate(&self) -> Result<(), ExplainError> {
        if self.max_evals < 2 {
            return Err(ExplainError::Config(format!(
                "max_evals must be at least 2, got {}",
                self.max_evals
            )));
        }
        if self.batch_size < 2 {
            return Err(ExplainError::Config(format!(
                "batch_size must be at least 2, got {}",
                self.batch_size
            )));
        }
        Ok(())
    }

    /// Explain the single sample in `input` (`[1, h, w, c]`).
    pub fn explain(
        &self,
        f: &impl Predict,
        masker: &ImageMasker,
        input: &Tensor,
    ) -> Result<Explanation, ExplainError> {
        self.validate()?;
        let batch = input
            .view()
            .into_dimensionality::<Ix4>()
            .map_err(|_| ExplainError::Shape(format!("input {:?} is not [1, h, w, c]", input.shape())))?;
        if batch.shape()[0] != 1 {
            return Err(ExplainError::Shape(format!(
                "expected a single sample, got batch of {}",
                batch.shape()[0]
            )));
        }
        let image = batch.index_axis(Axis(0), 0);
        let (h, w, c) = image.dim();
        if h == 0 || w == 0 || c == 0 {
            return Err(ExplainError::Shape(format!("empty image {:?}", image.shape())));
        }
        let background = masker.background(image);

        let ends = stack(Axis(0), &[image, background.view()])
            .map_err(|e| ExplainError::Shape(e.to_string()))?;
        let ends = f.predict(&ends.into_dyn())?;
        if ends.nrows() != 2 || ends.ncols() == 0 {
            return Err(ExplainError::Shape(format!(
                "expected [2, k] predictions, got {:?}",
                ends.shape()
            )));
        }
        let full = ends.row(0).to_owned();
        let base = ends.row(1).to_owned();
        let classes = base.len();
        let mut evals = 2;

        let mut seq = 0;
        let mut queue = BinaryHeap::new();
        let mut leaves = Vec::new();
        let root = Node {
            region: Region {
                top: 0,
                left: 0,
                height: h,
                width: w,
            },
            value: &full - &base,
            output: full,
        };
        queue.push(pending(root, &mut seq));

        while evals + 2 <= self.max_evals {
            let mut round = Vec::new();
            while round.len() * 2 + 2 <= self.batch_size
                && evals + round.len() * 2 + 2 <= self.max_evals
            {
                let Some(next) = queue.pop() else { break };
                match next.node.region.split() {
                    Some(halves) => round.push((next.node, halves)),
                    None => leaves.push(next.node),
                }
            }
            if round.is_empty() {
                break;
            }

            let mut masked = Vec::with_capacity(round.len() * 2);
            for (_, (left, right)) in &round {
                masked.push(reveal(image, &background, left));
                masked.push(reveal(image, &background, right));
            }
            let views: Vec<_> = masked.iter().map(|m| m.view()).collect();
            let outputs = f.predict(
                &stack(Axis(0), &views)
                    .map_err(|e| ExplainError::Shape(e.to_string()))?
                    .into_dyn(),
            )?;
            if outputs.dim() != (masked.len(), classes) {
                return Err(ExplainError::Shape(format!(
                    "expected [{}, {classes}] predictions, got {:?}",
                    masked.len(),
                    outputs.shape()
                )));
            }
            evals += masked.len();
            debug!("partition: split {} regions, {evals} evals used", round.len());

            for (i, (parent, (left, right))) in round.into_iter().enumerate() {
                let f_left = outputs.row(2 * i).to_owned();
                let f_right = outputs.row(2 * i + 1).to_owned();
                let (v_left, v_right) = owen_split(&parent, &f_left, &f_right, &base);
                queue.push(pending(
                    Node {
                        region: left,
                        value: v_left,
                        output: f_left,
                    },
                    &mut seq,
                ));
                queue.push(pending(
                    Node {
                        region: right,
                        value: v_right,
                        output: f_right,
                    },
                    &mut seq,
                ));
            }
        }
        leaves.extend(queue.into_iter().map(|p| p.node));
        info!(
            "partition: {} regions after {evals}/{} evals",
            leaves.len(),
            self.max_evals
        );

        let mut values = ndarray::Array5::<f32>::zeros((1, h, w, c, classes));
        for leaf in &leaves {
            let r = leaf.region;
            let share = &leaf.value / (r.area() * c) as f32;
            values
                .slice_mut(s![0, r.top..r.top + r.height, r.left..r.left + r.width, .., ..])
                .assign(&share);
        }
        Ok(Explanation {
            values: values.into_dyn(),
            base_values: base,
        })
    }
}

fn pending(node: Node, seq: &mut usize) -> Pending {
    let priority = node.value.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    *seq += 1;
    Pending {
        priority,
        seq: *seq,
        node,
    }
}

/// Children values that sum exactly to the parent's value.
fn owen_split(
    parent: &Node,
    f_left: &Array1<f32>,
    f_right: &Array1<f32>,
    base: &Array1<f32>,
) -> (Array1<f32>, Array1<f32>) {
    let left = ((f_left - base) + (&parent.output - f_right)) * 0.5;
    let right = ((f_right - base) + (&parent.output - f_left)) * 0.5;
    let drift = (&parent.value - &(&parent.output - base)) * 0.5;
    (left + &drift, right + &drift)
}

/// Background everywhere except `region`, which keeps the original pixels.
fn reveal(image: ArrayView3<f32>, background: &Array3<f32>, region: &Region) -> Array3<f32> {
    let mut out = background.clone();
    let rows = region.top..region.top + region.height;
    let cols = region.left..region.left + region.width;
    out.slice_mut(s![rows.clone(), cols.clone(), ..])
        .assign(&image.slice(s![rows, cols, ..]));
    out
}

/// Attribution values in any of the layouts explainers hand back.
#[derive(Debug, Clone)]
pub enum AttributionValues {
    /// One array per class, each with a leading batch axis.
    PerClass(Vec<Tensor>),
    /// Object form: `values` with a leading batch axis and classes last.
    Explanation(Explanation),
    /// Bare array: leading batch axis, classes last when rank > 3 after batch.
    Raw(Tensor),
}

impl AttributionValues {
    /// Per-pixel values for `class` of the first sample: `[h, w]` or `[h, w, c]`.
    pub fn for_class(&self, class: usize) -> Result<Tensor, ExplainError> {
        match self {
            AttributionValues::PerClass(list) => {
                let per_class = list.get(class).ok_or_else(|| {
                    ExplainError::Shape(format!("class {class} not in {} value arrays", list.len()))
                })?;
                first_sample(per_class)
            }
            AttributionValues::Explanation(e) => class_last(first_sample(&e.values)?, class),
            AttributionValues::Raw(values) => class_last(first_sample(values)?, class),
        }
    }
}

fn first_sample(values: &Tensor) -> Result<Tensor, ExplainError> {
    if values.ndim() < 2 || values.shape()[0] == 0 {
        return Err(ExplainError::Shape(format!(
            "values {:?} have no batch axis",
            values.shape()
        )));
    }
    Ok(values.index_axis(Axis(0), 0).to_owned())
}

fn class_last(sample: Tensor, class: usize) -> Result<Tensor, ExplainError> {
    if sample.ndim() <= 3 {
        return Ok(sample);
    }
    let last = Axis(sample.ndim() - 1);
    if class >= sample.len_of(last) {
        return Err(ExplainError::Shape(format!(
            "class {class} out of range for values {:?}",
            sample.shape()
        )));
    }
    Ok(sample.index_axis(last, class).to_owned())
}

/// Attribution values plus the prediction on the fully masked image.
#[derive(Debug, Clone)]
pub struct FeatureAttribution {
    pub values: AttributionValues,
    pub expected_value: Array1<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShapConfig {
    pub max_evals: usize,
    pub batch_size: usize,
    pub blur: [usize; 2],
}

impl Default for ShapConfig {
    fn default() -> Self {
        Self {
            max_evals: 50,
            batch_size: 100,
            blur: [10, 10],
        }
    }
}

/// Blur-masked partition attribution for `input`, or `None` when the
/// explainer could not run. Failures are logged, never returned.
pub fn compute_shap(model: &Model, input: &Tensor, config: &ShapConfig) -> Option<FeatureAttribution> {
    let explainer = PartitionExplainer::new(config.max_evals, config.batch_size);
    let masker = ImageMasker::blur(config.blur[0], config.blur[1]);
    match explainer.explain(&ProbabilityView::new(model), &masker, input) {
        Ok(explanation) => {
            let expected_value = explanation.base_values.clone();
            Some(FeatureAttribution {
                values: AttributionValues::Explanation(explanation),
                expected_value,
            })
        }
        Err(e) => {
            warn!("shap: attribution unavailable: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{flat_model, input, CLASSES, SIDE};
    use approx::assert_abs_diff_eq;
    use medi_model::{tensor_from_vec, Dense, Layer, Op};
    use ndarray::IxDyn;
    use std::cell::RefCell;

    #[test]
    fn single_column_becomes_complementary_pair() {
        let y = Array2::from_shape_vec((3, 1), vec![0.0, 0.25, 0.9]).unwrap();
        let p = two_column(y);
        assert_eq!(p.dim(), (3, 2));
        for row in p.rows() {
            assert_abs_diff_eq!(row[0] + row[1], 1.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(p[[1, 1]], 0.25);
    }

    #[test]
    fn binary_model_is_viewed_as_two_classes() {
        let model = Model::new(vec![
            Layer::new("flatten", Op::Flatten),
            Layer::new(
                "out",
                Op::Dense(
                    Dense::new(1, vec![0.3, -0.2, 0.1, 0.4])
                        .with_activation(medi_model::Activation::Sigmoid),
                ),
            ),
        ]);
        let x = tensor_from_vec(&[2, 2, 2, 1], vec![0.1, 0.2, 0.3, 0.4, 0.9, 0.8, 0.7, 0.6]).unwrap();
        let p = ProbabilityView::new(&model).predict(&x).unwrap();
        assert_eq!(p.dim(), (2, 2));
        for row in p.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn blur_of_constant_image_is_constant() {
        let img = Array3::from_elem((5, 7, 3), 0.4f32);
        let bg = ImageMasker::blur(3, 3).background(img.view());
        assert!(bg.iter().all(|v| (v - 0.4).abs() < 1e-6));
    }

    #[test]
    fn blur_averages_neighbourhood() {
        let mut img = Array3::zeros((3, 3, 1));
        img[[1, 1, 0]] = 9.0f32;
        let bg = ImageMasker::blur(3, 3).background(img.view());
        assert_abs_diff_eq!(bg[[1, 1, 0]], 1.0, epsilon = 1e-6);
        // Corner windows are truncated to 2x2.
        assert_abs_diff_eq!(bg[[0, 0, 0]], 9.0 / 4.0, epsilon = 1e-6);
    }

    #[test]
    fn region_splits_along_longer_side() {
        let r = Region {
            top: 0,
            left: 0,
            height: 3,
            width: 8,
        };
        let (a, b) = r.split().unwrap();
        assert_eq!((a.width, b.width, b.left), (4, 4, 4));
        let single = Region {
            top: 2,
            left: 2,
            height: 1,
            width: 1,
        };
        assert!(single.split().is_none());
    }

    #[test]
    fn values_add_up_to_prediction_gap() {
        let model = flat_model(false);
        let x = input();
        let view = ProbabilityView::new(&model);
        let masker = ImageMasker::blur(3, 3);
        let explanation = PartitionExplainer::new(30, 8).explain(&view, &masker, &x).unwrap();
        assert_eq!(explanation.values.shape(), &[1, SIDE, SIDE, 3, CLASSES]);

        let full = view.predict(&x).unwrap();
        let blurred = masker.background(x.index_axis(Axis(0), 0).into_dimensionality().unwrap());
        let base = view.predict(&blurred.insert_axis(Axis(0)).into_dyn()).unwrap();
        for k in 0..CLASSES {
            let total: f32 = explanation.values.index_axis(Axis(4), k).sum();
            assert_abs_diff_eq!(total, full[[0, k]] - base[[0, k]], epsilon = 1e-4);
            assert_abs_diff_eq!(explanation.base_values[k], base[[0, k]], epsilon = 1e-6);
        }
    }

    #[test]
    fn evaluation_budget_and_batch_size_are_respected() {
        let model = flat_model(false);
        let view = ProbabilityView::new(&model);
        let calls = RefCell::new(Vec::new());
        let counting = |batch: &Tensor| {
            calls.borrow_mut().push(batch.shape()[0]);
            view.predict(batch)
        };
        PartitionExplainer::new(21, 6)
            .explain(&counting, &ImageMasker::default(), &input())
            .unwrap();
        let calls = calls.into_inner();
        assert!(calls.iter().sum::<usize>() <= 21, "{calls:?}");
        assert!(calls.iter().all(|&n| n <= 6), "{calls:?}");
        assert!(calls.len() > 1);
    }

    #[test]
    fn tiny_budget_is_a_config_error() {
        let model = flat_model(false);
        let err = PartitionExplainer::new(1, 100)
            .explain(&ProbabilityView::new(&model), &ImageMasker::default(), &input())
            .unwrap_err();
        assert!(matches!(err, ExplainError::Config(_)));
    }

    #[test]
    fn compute_shap_reports_unavailable_on_bad_input() {
        let model = flat_model(false);
        let x = tensor_from_vec(&[1, 3], vec![0.0; 3]).unwrap();
        assert!(compute_shap(&model, &x, &ShapConfig::default()).is_none());
    }

    #[test]
    fn class_slices_agree_across_layouts() {
        let raw = Tensor::from_shape_fn(IxDyn(&[1, 2, 2, 3, 2]), |d| {
            (d[1] * 6 + d[2] * 3 + d[3]) as f32 - d[4] as f32
        });
        let per_class = (0..2)
            .map(|k| raw.index_axis(Axis(4), k).to_owned())
            .collect();
        let forms = [
            AttributionValues::PerClass(per_class),
            AttributionValues::Explanation(Explanation {
                values: raw.clone(),
                base_values: Array1::zeros(2),
            }),
            AttributionValues::Raw(raw),
        ];
        let slices: Vec<Tensor> = forms.iter().map(|f| f.for_class(1).unwrap()).collect();
        assert_eq!(slices[0].shape(), &[2, 2, 3]);
        assert_eq!(slices[0], slices[1]);
        assert_eq!(slices[1], slices[2]);
        assert!(forms[0].for_class(2).is_err());
        assert!(forms[2].for_class(2).is_err());
    }
}
