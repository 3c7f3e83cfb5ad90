use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Map, Value};

use crate::api::rest::AppState;
use crate::controller::environment_manager::ResourceAvailability;
use crate::shared::models::QuotaTier;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "docker_available": state.manager.runtime_available(),
        "version": env!("CARGO_PKG_VERSION"),
        "public_host": state.config.runtime.public_host,
    }))
}

pub async fn availability(State(state): State<Arc<AppState>>) -> Json<ResourceAvailability> {
    Json(state.manager.availability().await)
}

pub async fn list_quotas() -> Json<Value> {
    let mut quotas = Map::new();
    for tier in QuotaTier::ALL {
        quotas.insert(tier.to_string(), json!(tier.limits()));
    }
    Json(json!({ "quotas": quotas }))
}
