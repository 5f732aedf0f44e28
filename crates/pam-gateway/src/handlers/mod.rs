pub mod developer;
pub mod pam;
pub mod sandbox;

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "app_name": state.config.app_name,
        "version": pam_core::version(),
    }))
}
