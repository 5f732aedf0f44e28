use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::extract::ApiJson;
use crate::AppState;

#[derive(Deserialize)]
pub struct ValidateRequest {
    code: String,
}

/// 200 with the report when the code is acceptable, 400 with the same report otherwise.
pub async fn validate(State(state): State<Arc<AppState>>, ApiJson(req): ApiJson<ValidateRequest>) -> Response {
    let report = state.sandbox.validate(&req.code);
    let status = if report.valid { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    (
        status,
        Json(serde_json::json!({
            "valid": report.valid,
            "violations": report.violations,
            "imports": report.imports,
            "allowed_modules": state.sandbox.allowed_modules(),
        })),
    )
        .into_response()
}
