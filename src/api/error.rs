use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::models;

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// The error surface API handlers translate into the wire envelope
/// `{statusCode, message, name}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("too many requests, try again later")]
    RateLimited,
    #[error(transparent)]
    Internal(models::Error),
}

impl From<models::Error> for ApiError {
    fn from(err: models::Error) -> Self {
        match err {
            models::Error::NotFound(_) => ApiError::NotFound,
            models::Error::BadRequest(message) => ApiError::Validation(message),
            models::Error::Conflict => {
                ApiError::Validation("resource already exists".to_string())
            }
            other => ApiError::Internal(other),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound => "not_found",
            ApiError::Unauthorized => "unauthorized",
            ApiError::RateLimited => "rate_limited",
            ApiError::Internal(_) => "internal_server_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();

        // internal details stay in the log, not in the response
        let message = match &self {
            ApiError::Internal(err) => {
                error!("internal error: {err}");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(json!({
                "statusCode": status.as_u16(),
                "message": message,
                "name": self.name(),
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn model_errors_map_onto_the_taxonomy() {
        assert!(matches!(
            ApiError::from(models::Error::NotFound("email")),
            ApiError::NotFound
        ));
        assert!(matches!(
            ApiError::from(models::Error::BadRequest("bad address".to_string())),
            ApiError::Validation(_)
        ));
        assert!(matches!(
            ApiError::from(models::Error::Conflict),
            ApiError::Validation(_)
        ));
        assert!(matches!(
            ApiError::from(models::Error::Internal("boom".to_string())),
            ApiError::Internal(_)
        ));
    }

    #[tokio::test]
    async fn responses_use_the_wire_envelope() {
        let response = ApiError::RateLimited.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["statusCode"], 429);
        assert_eq!(parsed["name"], "rate_limited");
        assert!(parsed["message"].as_str().unwrap().contains("too many requests"));
    }
}
