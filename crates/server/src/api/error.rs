use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use gameforge_core::cache::CacheError;
use gameforge_core::fetch::FetchError;
use gameforge_core::lora::ComposeError;
use gameforge_core::model::ModelError;
use gameforge_core::pipeline::PipelineError;

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    Unauthorized,
    NotFound(String),
    /// A manifest-declared source could not deliver valid bytes.
    Upstream(String),
    /// Unexpected failure; details are logged, not returned.
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    message: String,
    r#type: &'static str,
    code: Option<&'static str>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, code, message) = match self {
            ApiError::InvalidRequest(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", None, msg)
            }
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                None,
                "Missing or invalid API key".to_string(),
            ),
            ApiError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                Some("not_found"),
                msg,
            ),
            ApiError::Upstream(msg) => (StatusCode::BAD_GATEWAY, "upstream_error", None, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server_error",
                    None,
                    "Internal server error".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                message,
                r#type: error_type,
                code,
            },
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Io(_) | FetchError::Task(_) => ApiError::Internal(err.to_string()),
            _ => ApiError::Upstream(err.to_string()),
        }
    }
}

impl From<CacheError> for ApiError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Fetch(e) => e.into(),
            CacheError::Model(_) | CacheError::Task(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ComposeError> for ApiError {
    fn from(err: ComposeError) -> Self {
        match err {
            ComposeError::UnknownDelta { .. } => ApiError::InvalidRequest(err.to_string()),
            ComposeError::Fetch(e) => e.into(),
            ComposeError::Model(_) | ComposeError::Tensor(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NoBackend(_) | PipelineError::BadInput(_) => {
                ApiError::InvalidRequest(err.to_string())
            }
            PipelineError::MissingTensor(_) | PipelineError::Tensor(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<ModelError> for ApiError {
    fn from(err: ModelError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Internal(err.to_string())
    }
}
