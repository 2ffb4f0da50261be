use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::error::{AnalysisError, ErrorKind, StoreError};
use crate::metrics;
use crate::pipeline::{AnalysisOutcome, PipelineOrchestrator};
use crate::records::AnalysisRecord;

/// Multipart field carrying the photo
pub const IMAGE_FIELD: &str = "image";

/// Headroom on top of the image limit for multipart framing
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<PipelineOrchestrator>,
}

/// JSON body returned by the analysis endpoint
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeBody {
    NoConfidentDetection { returned: usize },
    Completed { record: AnalysisRecord },
    Failed(ErrorBody),
    Superseded,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl From<&AnalysisError> for ErrorBody {
    fn from(err: &AnalysisError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

pub fn status_for(outcome: &AnalysisOutcome) -> StatusCode {
    match outcome {
        AnalysisOutcome::Completed(_) | AnalysisOutcome::NoConfidentDetection { .. } => StatusCode::OK,
        AnalysisOutcome::Superseded => StatusCode::CONFLICT,
        AnalysisOutcome::Failed(err) => status_for_error(err),
    }
}

pub fn status_for_error(err: &AnalysisError) -> StatusCode {
    match err {
        AnalysisError::Validation(_) | AnalysisError::Store(StoreError::InvalidKey(_)) => StatusCode::BAD_REQUEST,
        AnalysisError::Classifier(_) | AnalysisError::Resolution(_) => StatusCode::BAD_GATEWAY,
        AnalysisError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<AnalysisOutcome> for OutcomeBody {
    fn from(outcome: AnalysisOutcome) -> Self {
        match outcome {
            AnalysisOutcome::NoConfidentDetection { returned } => OutcomeBody::NoConfidentDetection { returned },
            AnalysisOutcome::Completed(record) => OutcomeBody::Completed { record },
            AnalysisOutcome::Failed(err) => OutcomeBody::Failed(ErrorBody::from(&err)),
            AnalysisOutcome::Superseded => OutcomeBody::Superseded,
        }
    }
}

/// Build the HTTP router. Stored images under `images_dir` are served at `/images`.
pub fn create_server(pipeline: Arc<PipelineOrchestrator>, images_dir: PathBuf) -> Router {
    let body_limit = pipeline.resource_stats().limits.max_image_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/api/users/{user_id}/analyses", post(analyze_handler))
        .route("/api/users/{user_id}/history", get(history_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .nest_service("/images", ServeDir::new(images_dir))
        .with_state(ApiState { pipeline })
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn bad_request(message: String) -> Response {
    let body = ErrorBody {
        kind: ErrorKind::Validation,
        message,
        retryable: false,
    };
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// Submit one photo for analysis
///
/// # Request Format:
/// - multipart/form-data
/// - Field "image": the photo (any format the `image` crate can sniff)
async fn analyze_handler(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    mut multipart: Multipart,
) -> Response {
    let mut upload: Option<(String, Vec<u8>)> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_request(format!("Multipart error: {}", e)),
        };
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }

        let filename = field.file_name().unwrap_or("upload").to_string();
        match field.bytes().await {
            Ok(data) => upload = Some((filename, data.to_vec())),
            Err(e) => return bad_request(format!("Read error: {}", e)),
        }
    }

    let Some((filename, bytes)) = upload else {
        return bad_request(format!("Missing multipart field `{}`", IMAGE_FIELD));
    };

    let outcome = state.pipeline.analyze(&user_id, &bytes, &filename).await;
    let status = status_for(&outcome);
    (status, Json(OutcomeBody::from(outcome))).into_response()
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    date: Option<NaiveDate>,
}

async fn history_handler(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<AnalysisRecord>>, (StatusCode, Json<ErrorBody>)> {
    let date = params.date.unwrap_or_else(|| chrono::Utc::now().date_naive());

    state
        .pipeline
        .history(&user_id, date)
        .await
        .map(Json)
        .map_err(|e: StoreError| {
            tracing::error!(user_id = %user_id, "History query failed: {}", e);
            let err = AnalysisError::from(e);
            (status_for_error(&err), Json(ErrorBody::from(&err)))
        })
}

async fn health_handler(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let stats = state.pipeline.resource_stats();
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "analyses_in_flight": stats.analyses_in_flight,
        "max_concurrent_analyses": stats.limits.max_concurrent_analyses,
        "utilization_percent": stats.utilization_percent(),
        "nutrient_cache_hit_rate": metrics::nutrient_cache_hit_rate(),
    }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::export_metrics(),
    )
}
