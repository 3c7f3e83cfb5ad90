use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use crate::api::rest::error::ApiResult;
use crate::api::rest::AppState;

pub async fn get_user_resources(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let usage = state.manager.usage(&user_id).await?;
    let tier = state.manager.tracker().tier_of(&user_id);
    let environments = state.manager.list(Some(&user_id));

    Ok(Json(json!({
        "user_id": user_id,
        "tier": tier,
        "limits": tier.limits(),
        "usage": usage,
        "environments": environments,
    })))
}
