//! HTTP routes and handlers

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use leafscan_classifiers::PredictorStatus;
use leafscan_core::PredictError;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let max_body_bytes = state.max_body_bytes;

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route(
            "/v1/predict",
            post(predict)
                .layer::<_, std::convert::Infallible>(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(max_body_bytes)),
        )
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Response {
    match state.predictor.status() {
        PredictorStatus::Ready { model, classes } => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "model": "ready",
                "name": model,
                "classes": classes,
            })),
        )
            .into_response(),
        PredictorStatus::Unavailable { reason } => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "degraded",
                "model": "unavailable",
                "reason": reason,
            })),
        )
            .into_response(),
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics_handle.render(),
    )
}

async fn predict(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let span = tracing::info_span!("predict", request_id = %request_id, bytes = body.len());

    let result = state
        .predictor
        .predict_bytes(body.to_vec())
        .instrument(span.clone())
        .await;

    let mut response = match result {
        Ok(diagnosis) => {
            span.in_scope(|| {
                info!(
                    disease = %diagnosis.disease_id,
                    confidence = diagnosis.confidence_score,
                    "Prediction served"
                )
            });
            (StatusCode::OK, Json(diagnosis)).into_response()
        }
        Err(e) => {
            span.in_scope(|| warn!(error = %e, "Prediction failed"));
            ApiError(e).into_response()
        }
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn fallback() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "not_found", "message": "No such route"})),
    )
}

/// Maps predictor failures to HTTP responses
pub struct ApiError(pub PredictError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            PredictError::ModelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PredictError::PreprocessingFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PredictError::InferenceFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        }));
        (self.status(), body).into_response()
    }
}
