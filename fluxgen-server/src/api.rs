//! REST endpoint: `GET /model` and `POST /generate` for a single loaded model.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use fluxgen_core::{GenerationRequest, GenerationResult, Generator};
use serde::{Deserialize, Serialize};

/// Response header carrying the resolved seed of a returned image.
pub const SEED_HEADER: &str = "x-seed-header";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ModelResponse {
    pub model: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn internal(message: impl ToString) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: impl ToString) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }
}

impl From<fluxgen_core::Error> for ApiError {
    fn from(err: fluxgen_core::Error) -> Self {
        if err.is_client_error() {
            Self::bad_request(err)
        } else {
            Self::internal(err)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("Error generating image: {}", self.message);
        }
        let body = ErrorResponse {
            error: ErrorBody {
                message: self.message,
                seed: None,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// Application state containing the preloaded model.
#[derive(Clone)]
struct AppState(Arc<Generator>);

async fn model_handler(State(state): State<AppState>) -> Json<ModelResponse> {
    Json(ModelResponse {
        model: state.0.model_name().to_string(),
    })
}

async fn generate_image_handler(
    State(state): State<AppState>,
    req: Result<Json<GenerationRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(req) = req.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let generator = state.0.clone();
    let result = tokio::task::spawn_blocking(move || generator.generate(&req))
        .await
        .map_err(ApiError::internal)??;

    Ok(match result {
        GenerationResult::Image(image) => (
            [
                (header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg")),
                (HeaderName::from_static(SEED_HEADER), HeaderValue::from(image.seed)),
            ],
            image.jpeg,
        )
            .into_response(),
        GenerationResult::Rejected { seed, message } => Json(ErrorResponse {
            error: ErrorBody {
                message,
                seed: Some(seed),
            },
        })
        .into_response(),
    })
}

pub fn router(generator: Arc<Generator>) -> Router {
    Router::new()
        .route("/model", get(model_handler))
        .route("/generate", post(generate_image_handler))
        .with_state(AppState(generator))
}
