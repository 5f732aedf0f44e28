//! Request planning: edge answer for voice, then orchestrator and model choice.

use axum::{extract::State, Json};
use pam_core::{validation::validate_non_empty, EdgeResult, RoutingContext};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::extract::ApiJson;
use crate::AppState;

#[derive(Deserialize)]
pub struct RouteRequest {
    #[serde(flatten)]
    ctx: RoutingContext,
    #[serde(default)]
    utc_offset_minutes: Option<i32>,
}

pub async fn route(State(state): State<Arc<AppState>>, ApiJson(req): ApiJson<RouteRequest>) -> ApiResult<Json<Value>> {
    validate_non_empty("message", &req.ctx.message)?;

    let edge = if req.ctx.is_voice {
        let result = state.edge.process(&req.ctx.message, req.utc_offset_minutes);
        if result.handled {
            return Ok(Json(json!({ "handled_at_edge": true, "edge": result })));
        }
        Some(result)
    } else {
        None
    };

    let routing = state.router.route(&req.ctx);
    let orchestrator = state.orchestrator.select(&req.ctx, routing.complexity);
    tracing::info!(
        target: "pam::router",
        model = %routing.model,
        rule = routing.rule,
        orchestrator = %orchestrator.kind,
        "Request planned"
    );

    Ok(Json(json!({
        "handled_at_edge": false,
        "edge": edge,
        "orchestrator": orchestrator,
        "routing": routing,
    })))
}

#[derive(Deserialize)]
pub struct EdgeRequest {
    query: String,
    #[serde(default)]
    utc_offset_minutes: Option<i32>,
}

pub async fn edge(State(state): State<Arc<AppState>>, ApiJson(req): ApiJson<EdgeRequest>) -> Json<EdgeResult> {
    Json(state.edge.process(&req.query, req.utc_offset_minutes))
}

pub async fn stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "routing": state.router.stats(),
        "edge": state.edge.stats(),
    }))
}
