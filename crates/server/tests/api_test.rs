use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header::CONTENT_TYPE},
};
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use inference::{DecodedImage, Detector, LabelMap, RawDetection};
use serde_json::{Value, json};
use server::{AppState, SupervisorConfig, WorkerPool, router};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tower::ServiceExt;

const RICE_CLASSES: [&str; 7] = [
    "Broken",
    "Chalky",
    "Damaged",
    "Discolored",
    "Good",
    "Organic Foreign Matters",
    "Paddy",
];

/// Stands in for the model: emits a single Chalky grain on images at least
/// 64 pixels wide and nothing on smaller ones.
struct ScriptedDetector {
    labels: LabelMap,
    calls: Arc<AtomicUsize>,
}

impl Detector for ScriptedDetector {
    fn infer(&mut self, image: &DecodedImage) -> anyhow::Result<Vec<RawDetection>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if image.width() < 64 {
            return Ok(Vec::new());
        }
        Ok(vec![RawDetection {
            bbox: [10.0, 10.0, 50.0, 50.0],
            confidence: 0.91,
            class_index: 1,
        }])
    }

    fn labels(&self) -> &LabelMap {
        &self.labels
    }
}

struct TestApp {
    router: Router,
    calls: Arc<AtomicUsize>,
}

fn spawn_app() -> TestApp {
    let calls = Arc::new(AtomicUsize::new(0));
    let factory_calls = Arc::clone(&calls);

    let pool = WorkerPool::start(
        SupervisorConfig {
            workers: 1,
            timeout: Duration::from_secs(10),
            max_requests: 1000,
            max_requests_jitter: 50,
            backlog: 64,
        },
        move || {
            Ok(ScriptedDetector {
                labels: LabelMap::new(RICE_CLASSES)?,
                calls: Arc::clone(&factory_calls),
            })
        },
    )
    .expect("worker pool starts");

    let state = AppState::new(Arc::new(pool), 1024 * 1024);

    TestApp {
        router: router(state),
        calls,
    }
}

fn solid_jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = ImageBuffer::from_pixel(width, height, Rgb([230u8, 225, 210]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Jpeg)
        .unwrap();
    out.into_inner()
}

async fn post_predict(
    app: &TestApp,
    content_type: Option<&str>,
    body: Vec<u8>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method("POST").uri("/predict");
    if let Some(content_type) = content_type {
        request = request.header(CONTENT_TYPE, content_type);
    }
    let response = app
        .router
        .clone()
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_index_returns_welcome_text() {
    let app = spawn_app();
    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.starts_with("Welcome to the Rice Quality Detection API!"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_solid_color_image_has_no_detections() {
    let app = spawn_app();
    let (status, body) = post_predict(&app, Some("image/jpeg"), solid_jpeg(3, 3)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"detections": [], "bad_rice_detected": false}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chalky_grain_flags_bad_rice() {
    let app = spawn_app();
    let (status, body) = post_predict(&app, Some("image/jpeg"), solid_jpeg(128, 96)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "detections": [{"box": [10, 10, 50, 50], "confidence": 0.91, "label": "Chalky"}],
            "bad_rice_detected": true
        })
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_body_is_invalid_image() {
    let app = spawn_app();
    let (status, body) = post_predict(&app, Some("image/jpeg"), Vec::new()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Invalid image data"}));
    assert_eq!(app.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_garbage_body_never_reaches_detector() {
    let app = spawn_app();
    let (status, body) = post_predict(&app, Some("image/jpeg"), b"not-an-image".to_vec()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "Invalid image data"}));
    assert_eq!(app.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_content_type_is_415() {
    let app = spawn_app();

    for content_type in [Some("text/plain"), Some("image/png"), None] {
        let (status, body) = post_predict(&app, content_type, solid_jpeg(128, 96)).await;
        assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE, "{:?}", content_type);
        assert_eq!(
            body,
            json!({"error": "Unsupported Media Type. Expected image/jpeg"})
        );
    }
    assert_eq!(app.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_content_type_with_parameters_is_accepted() {
    let app = spawn_app();
    let (status, _) = post_predict(&app, Some("image/jpeg; q=0.9"), solid_jpeg(3, 3)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_identical_requests_give_identical_responses() {
    let app = spawn_app();
    let jpeg = solid_jpeg(128, 96);

    let first = post_predict(&app, Some("image/jpeg"), jpeg.clone()).await;
    let second = post_predict(&app, Some("image/jpeg"), jpeg).await;

    assert_eq!(first, second);
    assert_eq!(app.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_body_is_rejected() {
    let app = spawn_app();
    let (status, body) = post_predict(&app, Some("image/jpeg"), vec![0u8; 2 * 1024 * 1024]).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body, json!({"error": "Payload too large"}));
    assert_eq!(app.calls.load(Ordering::SeqCst), 0);
}
