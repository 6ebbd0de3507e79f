mod common;

use approx::assert_abs_diff_eq;
use medi_explain::{compute_shap, AttributionValues, ShapConfig};
use ndarray::Axis;

use common::{backbone_model, image, setup_test_logger, SIDE};

#[test]
fn shap_on_nested_model_conserves_prediction_gap() {
    setup_test_logger();
    let model = backbone_model(false);
    let x = image();
    let config = ShapConfig {
        max_evals: 24,
        batch_size: 10,
        blur: [4, 4],
    };
    let attribution = compute_shap(&model, &x, &config).expect("attribution");
    let AttributionValues::Explanation(explanation) = &attribution.values else {
        panic!("explainer output should be an explanation");
    };
    assert_eq!(explanation.values.shape(), &[1, SIDE, SIDE, 3, 4]);
    assert_eq!(attribution.expected_value, explanation.base_values);

    let full = model.predict(&x).unwrap();
    for k in 0..4 {
        let total: f32 = explanation.values.index_axis(Axis(4), k).sum();
        assert_abs_diff_eq!(
            total + attribution.expected_value[k],
            full[[0, k]],
            epsilon = 1e-4
        );
    }
    let class = attribution.values.for_class(2).unwrap();
    assert_eq!(class.shape(), &[SIDE, SIDE, 3]);
}

#[test]
fn batch_of_two_is_rejected() {
    let model = backbone_model(false);
    let x = ndarray::concatenate(Axis(0), &[image().view(), image().view()]).unwrap();
    assert!(compute_shap(&model, &x, &ShapConfig::default()).is_none());
}
