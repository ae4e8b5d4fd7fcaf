use crate::handler::{ErrorResponse, HandlerError, PredictRequest, accepts_content_type};
use crate::supervisor::{PoolError, WorkerPool};
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http_body_util::LengthLimitError;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Instant;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub const WELCOME_MESSAGE: &str =
    "Welcome to the Rice Quality Detection API! Send a POST request to /predict with an image.";

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<WorkerPool>,
    pub max_body_bytes: usize,
    /// Counts `/predict` outcomes decided before a worker handled the request.
    rejected: Counter<u64>,
}

impl AppState {
    pub fn new(pool: Arc<WorkerPool>, max_body_bytes: usize) -> Self {
        let rejected = global::meter("rice-server")
            .u64_counter("predict_requests_total")
            .with_description("Total /predict requests handled, by status")
            .build();
        Self {
            pool,
            max_body_bytes,
            rejected,
        }
    }

    fn reject(&self, status: StatusCode, message: &str) -> Response {
        self.rejected
            .add(1, &[KeyValue::new("status", i64::from(status.as_u16()))]);
        error_response(status, message)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/predict", post(predict))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> &'static str {
    WELCOME_MESSAGE
}

async fn predict(State(state): State<AppState>, headers: HeaderMap, body: Body) -> Response {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    // Reject before reading the body; the worker re-checks as part of its pipeline.
    if !accepts_content_type(&content_type) {
        let rejection = HandlerError::UnsupportedMediaType(content_type);
        tracing::warn!(error = %rejection, "Prediction rejected");
        return state.reject(rejection.status_code(), rejection.client_message());
    }

    let reception_started = Instant::now();
    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(e) if exceeds_length_limit(&e) => {
            tracing::warn!(limit = state.max_body_bytes, "Request body too large");
            return state.reject(StatusCode::PAYLOAD_TOO_LARGE, "Payload too large");
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read request body");
            return state.reject(StatusCode::BAD_REQUEST, "Failed to read request body");
        }
    };

    let request = PredictRequest {
        content_type,
        body,
        reception: reception_started.elapsed(),
    };

    match state.pool.submit(request).await {
        Ok(Ok(response)) => (StatusCode::OK, Json(response)).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Request not served by a worker");
            state.reject(e.status_code(), e.client_message())
        }
    }
}

/// Whether a body read failed because the configured size limit was hit, as
/// opposed to a client disconnect or transport error.
fn exceeds_length_limit(error: &axum::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        error_response(self.status_code(), self.client_message())
    }
}

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        error_response(self.status_code(), self.client_message())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[tokio::test]
    async fn test_length_limit_error_is_detected() {
        let error = axum::body::to_bytes(Body::from(vec![0u8; 64]), 16)
            .await
            .unwrap_err();
        assert!(exceeds_length_limit(&error));
    }

    #[test]
    fn test_transport_error_is_not_a_length_limit() {
        let error = axum::Error::new(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "client went away",
        ));
        assert!(!exceeds_length_limit(&error));
    }
}
