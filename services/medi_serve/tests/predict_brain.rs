use std::path::Path;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use image::{Rgb, RgbImage};
use medi_model::{Activation, Conv2d, Dense, Layer, Model, Op};
use medi_serve::{app, PredictionService, ServeConfig};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

const BOUNDARY: &str = "medi-test-boundary";

fn weights(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| ((i as f32) * 0.37 + phase).sin() * 0.3).collect()
}

/// One strided conv, global pooling and a 4-way softmax head.
fn brain_model() -> Model {
    Model::new(vec![
        Layer::new(
            "conv2d",
            Op::Conv2d(
                Conv2d::new(4, [4, 4], weights(4 * 4 * 3 * 4, 0.2))
                    .with_strides(4)
                    .with_activation(Activation::Relu)
                    .with_bias(vec![0.1; 4]),
            ),
        ),
        Layer::new("gap", Op::GlobalAveragePool2d),
        Layer::new(
            "predictions",
            Op::Dense(Dense::new(4, weights(16, 1.0)).with_activation(Activation::Softmax)),
        ),
    ])
    .with_input_shape(vec![224, 224, 3])
}

fn router(model: Option<Model>, uploads: &Path) -> Router {
    let mut config = ServeConfig::with_uploads(uploads);
    config.shap.max_evals = 20;
    let service = PredictionService::new(model, config).expect("service");
    app(Arc::new(service))
}

fn scan_png() -> Vec<u8> {
    let img = RgbImage::from_fn(224, 224, |x, y| {
        let inside = (60..160).contains(&x) && (80..150).contains(&y);
        if inside {
            Rgb([220, 210, 200])
        } else {
            Rgb([(x / 4) as u8, (y / 4) as u8, 30])
        }
    });
    let mut out = std::io::Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png).expect("png");
    out.into_inner()
}

fn multipart(image: Option<&[u8]>, deep_scan: Option<&str>) -> Body {
    let mut body = Vec::new();
    if let Some(bytes) = image {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"scan.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    if let Some(flag) = deep_scan {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"deep_scan\"\r\n\r\n{flag}\r\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Body::from(body)
}

fn post(uri: &str, body: Body) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(body)
        .expect("request")
}

async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.oneshot(req).await.expect("response");
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn quick_scan_returns_prediction_and_heatmap() {
    let tmp = tempfile::tempdir().unwrap();
    let uploads = tmp.path().join("uploads");
    let app = router(Some(brain_model()), &uploads);

    let png = scan_png();
    let req = post("/predict/brain", multipart(Some(png.as_slice()), Some("false")));
    let (status, json) = send(app, req).await;
    assert_eq!(status, StatusCode::OK, "{json}");

    let labels: Vec<&str> = json["labels"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(labels, vec!["Glioma", "Meningioma", "Pituitary", "No Tumor"]);
    let total: f64 = json["values"].as_array().unwrap().iter().map(|v| v.as_f64().unwrap()).sum();
    assert!((total - 100.0).abs() < 0.05, "values sum to {total}");
    assert!(labels.contains(&json["prediction"].as_str().unwrap()));
    assert_eq!(json["heatmap"], "uploads/scan_heatmap.jpg");
    assert!(json["shap"].is_null());
    assert!(uploads.join("scan.png").exists());
    assert!(uploads.join("scan_heatmap.jpg").exists());
}

#[tokio::test]
async fn deep_scan_adds_a_persisted_shap_figure() {
    let tmp = tempfile::tempdir().unwrap();
    let uploads = tmp.path().join("uploads");
    let app = router(Some(brain_model()), &uploads);

    let png = scan_png();
    let req = post("/predict/brain", multipart(Some(png.as_slice()), None));
    let (status, json) = send(app.clone(), req).await;
    assert_eq!(status, StatusCode::OK, "{json}");
    assert_eq!(json["shap"], "uploads/scan_shap.png");
    assert!(uploads.join("scan_shap.png").exists());

    let resp = app
        .oneshot(
            Request::builder()
                .uri("/uploads/scan_shap.png")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn missing_model_is_a_server_error() {
    let tmp = tempfile::tempdir().unwrap();
    let app = router(None, &tmp.path().join("uploads"));
    let png = scan_png();
    let req = post("/predict/brain", multipart(Some(png.as_slice()), Some("true")));
    let (status, json) = send(app, req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let detail = json["detail"].as_str().unwrap();
    assert!(detail.contains("model not loaded"), "{detail}");
}

#[tokio::test]
async fn missing_image_field_is_a_bad_request() {
    let tmp = tempfile::tempdir().unwrap();
    let app = router(Some(brain_model()), &tmp.path().join("uploads"));
    let req = post("/predict/brain", multipart(None, Some("false")));
    let (status, json) = send(app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["detail"].as_str().unwrap().contains("image"));
}

#[tokio::test]
async fn undecodable_image_is_a_server_error() {
    let tmp = tempfile::tempdir().unwrap();
    let app = router(Some(brain_model()), &tmp.path().join("uploads"));
    let (status, json) = send(
        app,
        post("/predict/brain", multipart(Some(&b"not a png"[..]), Some("false"))),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json["detail"].as_str().is_some());
}

#[tokio::test]
async fn placeholder_endpoints_return_fixed_values() {
    let tmp = tempfile::tempdir().unwrap();
    let app = router(None, &tmp.path().join("uploads"));
    let png = scan_png();

    let req = post("/predict/chest", multipart(Some(png.as_slice()), None));
    let (status, chest) = send(app.clone(), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chest["prediction"], "Normal");
    assert_eq!(chest["values"], serde_json::json!([80.1, 12.4, 7.5]));
    assert!(chest["heatmap"].is_null());

    let req = post("/predict/skin", multipart(Some(png.as_slice()), None));
    let (status, skin) = send(app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(skin["labels"], serde_json::json!(["Benign", "Malignant"]));
    assert_eq!(skin["status"], "Federated global model training in progress");
}

#[tokio::test]
async fn root_reports_model_status() {
    let tmp = tempfile::tempdir().unwrap();
    let app = router(None, &tmp.path().join("uploads"));
    let req = Request::builder().uri("/").body(Body::empty()).unwrap();
    let (status, json) = send(app.clone(), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "running");
    assert_eq!(json["model_loaded"], false);

    let resp = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
