use axum::body::Bytes;
use axum::http::StatusCode;
use inference::{DecodeError, DetectionRecord, Detector, NormalizeError, decode, normalize};
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const EXPECTED_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub detections: Vec<DetectionRecord>,
    pub bad_rice_detected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}

/// Request-scoped failures. The `Display` text is for server logs only;
/// clients get [`HandlerError::client_message`].
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("unsupported content type `{0}`")]
    UnsupportedMediaType(String),

    #[error("invalid image data: {0}")]
    InvalidImage(#[from] DecodeError),

    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),

    #[error("detection normalization failed: {0}")]
    Normalize(#[from] NormalizeError),
}

impl HandlerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            HandlerError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            HandlerError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            HandlerError::Inference(_) | HandlerError::Normalize(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn client_message(&self) -> &'static str {
        match self {
            HandlerError::UnsupportedMediaType(_) => "Unsupported Media Type. Expected image/jpeg",
            HandlerError::InvalidImage(_) => "Invalid image data",
            HandlerError::Inference(_) | HandlerError::Normalize(_) => "Internal server error",
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.client_message())
    }
}

/// Case-sensitive containment check, so parameters such as
/// `image/jpeg; charset=binary` are accepted.
pub fn accepts_content_type(content_type: &str) -> bool {
    content_type.contains(EXPECTED_CONTENT_TYPE)
}

/// A received `/predict` call.
#[derive(Debug, Clone)]
pub struct PredictRequest {
    pub content_type: String,
    pub body: Bytes,
    /// Time spent receiving the body before the request reached a worker.
    pub reception: Duration,
}

impl PredictRequest {
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
            reception: Duration::ZERO,
        }
    }
}

struct PredictMetrics {
    duration: Histogram<f64>,
    requests: Counter<u64>,
    detections: Counter<u64>,
    bad_rice: Counter<u64>,
}

impl PredictMetrics {
    fn new(meter_name: &'static str) -> Self {
        let meter = global::meter(meter_name);
        let latency_buckets = [
            0.01, 0.025, 0.05, 0.075, 0.1, 0.15, 0.2, 0.3, 0.5, 0.75, 1.0, 2.0, 5.0, 10.0, 30.0,
        ];
        Self {
            duration: meter
                .f64_histogram("predict_duration_seconds")
                .with_description("End-to-end /predict processing time (reception to response)")
                .with_unit("s")
                .with_boundaries(latency_buckets.to_vec())
                .build(),
            requests: meter
                .u64_counter("predict_requests_total")
                .with_description("Total /predict requests handled, by status")
                .build(),
            detections: meter
                .u64_counter("predict_detections_total")
                .with_description("Total detections returned")
                .build(),
            bad_rice: meter
                .u64_counter("predict_bad_rice_total")
                .with_description("Responses with bad_rice_detected = true")
                .build(),
        }
    }

    fn record_status(&self, status: StatusCode) {
        self.requests.add(
            1,
            &[opentelemetry::KeyValue::new(
                "status",
                i64::from(status.as_u16()),
            )],
        );
    }
}

/// Runs the decode, detect and normalize pipeline for one request at a time.
pub struct RequestHandler<D> {
    detector: D,
    metrics: PredictMetrics,
}

impl<D: Detector> RequestHandler<D> {
    pub fn new(detector: D) -> Self {
        Self {
            detector,
            metrics: PredictMetrics::new("rice-server"),
        }
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    #[tracing::instrument(
        name = "predict",
        skip_all,
        fields(content_type = %request.content_type, bytes = request.body.len())
    )]
    pub fn handle(&mut self, request: &PredictRequest) -> Result<InferenceResponse, HandlerError> {
        let result = self.run_pipeline(request);

        match &result {
            Ok(_) => self.metrics.record_status(StatusCode::OK),
            Err(e) => {
                let status = e.status_code();
                self.metrics.record_status(status);
                if status.is_server_error() {
                    tracing::error!(status = status.as_u16(), error = %e, "Prediction failed");
                } else {
                    tracing::warn!(status = status.as_u16(), error = %e, "Prediction rejected");
                }
            }
        }

        result
    }

    fn run_pipeline(
        &mut self,
        request: &PredictRequest,
    ) -> Result<InferenceResponse, HandlerError> {
        if !accepts_content_type(&request.content_type) {
            return Err(HandlerError::UnsupportedMediaType(
                request.content_type.clone(),
            ));
        }

        let started = Instant::now();

        let image = decode(&request.body)?;
        let reception_decode = request.reception + started.elapsed();

        let inference_started = Instant::now();
        let raw = self
            .detector
            .infer(&image)
            .map_err(HandlerError::Inference)?;
        let inference = inference_started.elapsed();

        let (detections, bad_rice_detected) = normalize(&raw, self.detector.labels())?;
        let total = request.reception + started.elapsed();

        self.metrics.duration.record(total.as_secs_f64(), &[]);
        self.metrics.detections.add(detections.len() as u64, &[]);
        if bad_rice_detected {
            self.metrics.bad_rice.add(1, &[]);
        }

        tracing::info!(
            reception_decode_seconds = reception_decode.as_secs_f64(),
            inference_seconds = inference.as_secs_f64(),
            total_seconds = total.as_secs_f64(),
            width = image.width(),
            height = image.height(),
            detections = detections.len(),
            bad_rice_detected,
            "Prediction complete"
        );

        Ok(InferenceResponse {
            detections,
            bad_rice_detected,
        })
    }
}
