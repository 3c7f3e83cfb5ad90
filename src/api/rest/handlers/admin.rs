use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::api::rest::error::ApiResult;
use crate::api::rest::AppState;
use crate::controller::environment_manager::ReconcileReport;

pub async fn reconcile(State(state): State<Arc<AppState>>) -> ApiResult<Json<ReconcileReport>> {
    Ok(Json(state.manager.reconcile().await?))
}

pub async fn backup_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let archive = state.manager.backup(&user_id).await?;
    Ok(Json(json!({
        "user_id": user_id,
        "archive": archive.display().to_string(),
    })))
}
