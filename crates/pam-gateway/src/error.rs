//! HTTP mapping for core errors: `{"detail": "..."}` with the variant's status code.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use pam_core::PamError;

pub struct ApiError(pub PamError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<PamError> for ApiError {
    fn from(e: PamError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(target: "pam::gateway", error = %self.0, "Request failed");
        }
        let body = Json(serde_json::json!({ "detail": self.0.to_string() }));
        let mut res = (status, body).into_response();
        if let PamError::RateLimited { retry_after_secs, .. } = self.0 {
            res.headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
        }
        res
    }
}
