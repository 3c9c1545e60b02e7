use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use image::{ImageBuffer, ImageFormat, Rgb, RgbImage};
use linc_detect::{
    config::{Device, ModelSpec, DEFAULT_MODEL},
    detection::{DetectionResult, NamedImage},
    models::{filter_detections, ModelRegistry, ObjectDetector},
    web::{create_app, AppState},
    Config, DetectError, Result,
};
use ndarray::array;
use serde_json::Value;
use std::io::Cursor;
use parking_lot::Mutex;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tower::ServiceExt;

const BOUNDARY: &str = "linc-test-boundary";

/// Every image yields the same two raw detections, scored 0.9 and 0.4.
struct FakeDetector {
    name: &'static str,
    labels: Vec<String>,
}

impl ObjectDetector for FakeDetector {
    fn name(&self) -> &str {
        self.name
    }

    fn label_names(&self) -> &[String] {
        &self.labels
    }

    fn detect(&self, images: &[NamedImage], conf: f32) -> Result<Vec<DetectionResult>> {
        let boxes = array![[10.0f32, 20.0, 110.0, 220.0], [0.0, 0.0, 5.0, 5.0]];
        images
            .iter()
            .map(|image| {
                let kept = filter_detections(boxes.view(), &[1, 2], &[0.9, 0.4], conf, &self.labels)?;
                Ok(DetectionResult::new(image.name.clone(), kept))
            })
            .collect()
    }
}

/// Fails every batch, as a broken session would.
struct FailingDetector;

impl ObjectDetector for FailingDetector {
    fn name(&self) -> &str {
        DEFAULT_MODEL
    }

    fn label_names(&self) -> &[String] {
        &[]
    }

    fn detect(&self, _images: &[NamedImage], _conf: f32) -> Result<Vec<DetectionResult>> {
        Err(DetectError::Inference("session run failed".to_string()))
    }
}

/// Signals when a batch starts, then blocks until released.
struct BlockingDetector {
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl ObjectDetector for BlockingDetector {
    fn name(&self) -> &str {
        DEFAULT_MODEL
    }

    fn label_names(&self) -> &[String] {
        &[]
    }

    fn detect(&self, images: &[NamedImage], _conf: f32) -> Result<Vec<DetectionResult>> {
        let _ = self.started.lock().send(());
        let _ = self.release.lock().recv();
        Ok(images
            .iter()
            .map(|image| DetectionResult::new(image.name.clone(), vec![]))
            .collect())
    }
}

fn test_state() -> AppState {
    state_with(Arc::new(FakeDetector {
        name: DEFAULT_MODEL,
        labels: vec!["cv-front".to_string(), "cv-dl".to_string()],
    }))
}

fn state_with(default: Arc<dyn ObjectDetector>) -> AppState {
    let config = Config::new(
        "127.0.0.1:0".to_string(),
        vec![ModelSpec::new(DEFAULT_MODEL, "unused.onnx")],
        Device::Cpu,
        0.5,
        2,
        1,
        false,
    )
    .unwrap();

    let mut registry = ModelRegistry::empty();
    registry.insert(default);
    registry.insert(Arc::new(FakeDetector {
        name: "lion",
        labels: vec!["lion".to_string()],
    }));

    AppState::new(config, registry)
}

fn app() -> Router {
    create_app(test_state())
}

fn png_bytes() -> Vec<u8> {
    let img: RgbImage = ImageBuffer::from_pixel(8, 8, Rgb([120, 80, 40]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn multipart(files: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (field, file_name, data) in files {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                    field, file_name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", field).as_bytes(),
            ),
        }
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn upload_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
        Value::String(String::from_utf8_lossy(&bytes).into_owned())
    });
    (status, value)
}

#[tokio::test]
async fn detect_uses_default_confidence() {
    let png = png_bytes();
    let body = multipart(&[("file", Some("lions.png"), &png)]);

    let (status, json) = send(app(), upload_request("/detect", body)).await;

    assert_eq!(status, StatusCode::OK);
    let results = json.as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0]["name"], "lions.png");
    assert!(results[0].get("path").is_none());

    let boxes = results[0]["boxes"].as_array().unwrap();
    assert_eq!(boxes.len(), 1);
    assert_eq!(boxes[0]["class"], 1);
    assert_eq!(boxes[0]["label"], "cv-front");
    assert_eq!(boxes[0]["ROI"], serde_json::json!([10.0, 20.0, 110.0, 220.0]));
}

#[tokio::test]
async fn conf_query_lowers_the_threshold() {
    let png = png_bytes();
    let body = multipart(&[("a", Some("a.jpg.png"), &png), ("b", Some("b.PNG"), &png)]);

    let (status, json) = send(app(), upload_request("/detect?conf=0.3", body)).await;

    assert_eq!(status, StatusCode::OK);
    let results = json.as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[1]["name"], "b.PNG");
    for result in results {
        assert_eq!(result["boxes"].as_array().unwrap().len(), 2);
    }
}

#[tokio::test]
async fn conf_form_field_is_honoured() {
    let png = png_bytes();
    let body = multipart(&[("conf", None, b"0.95"), ("file", Some("x.png"), &png)]);

    let (status, json) = send(app(), upload_request("/detect", body)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(json[0]["boxes"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn out_of_range_confidence_is_bad_request() {
    let png = png_bytes();
    let body = multipart(&[("file", Some("x.png"), &png)]);

    let (status, json) = send(app(), upload_request("/detect?conf=1.5", body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "INVALID_CONFIDENCE");
}

#[tokio::test]
async fn too_many_images_is_payload_too_large() {
    let png = png_bytes();
    let body = multipart(&[
        ("a", Some("a.png"), &png),
        ("b", Some("b.png"), &png),
        ("c", Some("c.png"), &png),
    ]);

    let (status, json) = send(app(), upload_request("/detect", body)).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json["error"]["code"], "TOO_MANY_IMAGES");
}

#[tokio::test]
async fn request_without_images_is_bad_request() {
    let body = multipart(&[]);

    let (status, json) = send(app(), upload_request("/detect", body)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn wrong_extension_is_unsupported_media_type() {
    let png = png_bytes();
    let body = multipart(&[("file", Some("lion.gif"), &png)]);

    let (status, json) = send(app(), upload_request("/detect", body)).await;

    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
    assert_eq!(json["error"]["code"], "UNSUPPORTED_FORMAT");
}

#[tokio::test]
async fn named_model_gets_its_own_endpoint() {
    let png = png_bytes();
    let body = multipart(&[("file", Some("mane.jpeg"), &png)]);

    let (status, json) = send(app(), upload_request("/detect_lion", body)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["boxes"][0]["label"], "lion");

    let (status, _) = send(app(), upload_request("/detect_whisker", multipart(&[]))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn classes_lists_label_names_by_index() {
    let (status, json) = send(app(), get("/classes")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, serde_json::json!({"1": "cv-front", "2": "cv-dl"}));

    let (status, json) = send(app(), get("/classes/lion")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, serde_json::json!({"1": "lion"}));

    let (status, json) = send(app(), get("/classes/tiger")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "UNKNOWN_MODEL");
}

#[tokio::test]
async fn async_detection_completes_task() {
    let app = app();
    let png = png_bytes();
    let body = multipart(&[("file", Some("lions.png"), &png)]);

    let (status, json) = send(app.clone(), upload_request("/detect_async", body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["status"], "created");
    let task_id = json["task_id"].as_str().unwrap().to_string();

    let mut record = Value::Null;
    for _ in 0..100 {
        let (status, json) = send(app.clone(), get(&format!("/task/{}", task_id))).await;
        assert_eq!(status, StatusCode::OK);
        if json["state"] == "completed" {
            record = json;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(record["state"], "completed");
    assert_eq!(record["result"][0]["name"], "lions.png");
    assert_eq!(record["result"][0]["boxes"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn async_detection_failure_is_recorded_on_the_task() {
    let app = create_app(state_with(Arc::new(FailingDetector)));
    let png = png_bytes();
    let body = multipart(&[("file", Some("lions.png"), &png)]);

    let (status, json) = send(app.clone(), upload_request("/detect_async", body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let task_id = json["task_id"].as_str().unwrap().to_string();

    let mut record = Value::Null;
    for _ in 0..100 {
        let (_, json) = send(app.clone(), get(&format!("/task/{}", task_id))).await;
        if json["state"] == "failed" {
            record = json;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(record["state"], "failed");
    let status = record["status"].as_str().unwrap();
    assert!(
        status.starts_with("Task failed - Error performing detection on the images: "),
        "unexpected status: {}",
        status
    );
    assert!(status.contains("session run failed"));
}

#[tokio::test]
async fn async_detection_validates_before_queueing() {
    let png = png_bytes();
    let body = multipart(&[("file", Some("x.png"), &png)]);

    let (status, _) = send(app(), upload_request("/detect_async?conf=-1", body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn async_detection_rejects_when_at_capacity() {
    let state = test_state();
    let _held = state.async_gate.try_acquire().unwrap();
    let app = create_app(state);

    let png = png_bytes();
    let body = multipart(&[("file", Some("x.png"), &png)]);
    let (status, json) = send(app, upload_request("/detect_async", body)).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"]["code"], "SERVICE_BUSY");
}

#[tokio::test]
async fn detect_rejects_when_at_capacity() {
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let app = create_app(state_with(Arc::new(BlockingDetector {
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    })));
    let png = png_bytes();

    let first = tokio::spawn(send(
        app.clone(),
        upload_request("/detect", multipart(&[("file", Some("a.png"), &png)])),
    ));
    tokio::task::spawn_blocking(move || started_rx.recv())
        .await
        .unwrap()
        .unwrap();

    let (status, json) = send(
        app.clone(),
        upload_request("/detect", multipart(&[("file", Some("b.png"), &png)])),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"]["code"], "SERVICE_BUSY");

    release_tx.send(()).unwrap();
    let (status, json) = first.await.unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json[0]["name"], "a.png");
}

#[tokio::test]
async fn oversized_body_without_length_is_payload_too_large() {
    // no Content-Length header, so the size limit can only cut the stream
    let big = vec![0u8; 11_000_000];
    let body = multipart(&[("file", Some("huge.png"), &big)]);

    let (status, json) = send(app(), upload_request("/detect", body)).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(json["error"]["code"], "PAYLOAD_TOO_LARGE");
}

#[tokio::test]
async fn conf_part_with_text_content_type_is_a_threshold() {
    let png = png_bytes();
    let mut body = format!(
        "--{b}\r\nContent-Disposition: form-data; name=\"conf\"\r\nContent-Type: text/plain\r\n\r\n0.95\r\n",
        b = BOUNDARY
    )
    .into_bytes();
    let rest = multipart(&[("file", Some("x.png"), &png)]);
    body.extend_from_slice(&rest);

    let (status, json) = send(app(), upload_request("/detect", body)).await;

    assert_eq!(status, StatusCode::OK);
    assert!(json[0]["boxes"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn non_multipart_body_gets_json_error() {
    let request = Request::builder()
        .method("POST")
        .uri("/detect")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();

    let (status, json) = send(app(), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let (status, _) = send(app(), get("/task/not-a-uuid")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, json) = send(app(), get(&format!("/task/{}", uuid::Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "TASK_NOT_FOUND");
}

#[tokio::test]
async fn liveness_endpoints_respond() {
    let (status, body) = send(app(), get("/linc_test")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("Hello World!".to_string()));

    let (status, json) = send(app(), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");

    let (status, json) = send(app(), get("/api/info")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["detect_endpoints"], serde_json::json!(["/detect", "/detect_lion"]));
}
