use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::rest::error::{ApiError, ApiResult};
use crate::api::rest::AppState;
use crate::controller::environment_manager::{
    AccessInfo, CleanupReport, CreatedEnvironment, DeletedEnvironment, RuntimeReport,
    TemplateEnvironment,
};
use crate::controller::{CreateEnvironment, LabError};
use crate::shared::models::{EnvironmentType, QuotaTier, Template};

fn default_env_type() -> String {
    EnvironmentType::PytorchJupyter.to_string()
}

fn default_quota() -> String {
    QuotaTier::Default.to_string()
}

#[derive(Debug, Deserialize, Default)]
pub struct UserQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RuntimeQuery {
    pub quota: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateEnvironmentBody {
    pub user_id: String,
    #[serde(default = "default_env_type", alias = "type")]
    pub env_type: String,
    #[serde(default = "default_quota")]
    pub quota: String,
    pub gpu_count: Option<u32>,
    pub memory_gb: Option<u32>,
    pub cpu_cores: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFromTemplateBody {
    pub user_id: String,
    pub template: String,
    #[serde(default = "default_quota")]
    pub quota: String,
}

#[derive(Debug, Deserialize, Default)]
struct UserBody {
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InstallPackagesBody {
    pub user_id: Option<String>,
    pub packages: Vec<String>,
}

fn require_user(user_id: &str) -> ApiResult<()> {
    if user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id is required".to_string()));
    }
    Ok(())
}

/// Lifecycle calls accept an empty body or `{"user_id": ...}`.
fn optional_user(body: &Bytes) -> ApiResult<Option<String>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let parsed: UserBody = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid request body: {}", e)))?;
    Ok(parsed.user_id.filter(|u| !u.trim().is_empty()))
}

pub async fn list_environments(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> Json<Value> {
    let environments = state.manager.list(query.user_id.as_deref());
    Json(json!({
        "count": environments.len(),
        "environments": environments,
    }))
}

pub async fn list_types() -> Json<Value> {
    let types: Vec<_> = EnvironmentType::ALL.iter().map(|t| t.profile()).collect();
    Json(json!({ "types": types }))
}

pub async fn list_templates() -> Json<Value> {
    let templates: Vec<_> = Template::ALL.iter().map(|t| t.profile()).collect();
    Json(json!({ "templates": templates }))
}

pub async fn create_environment(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateEnvironmentBody>,
) -> ApiResult<(StatusCode, Json<CreatedEnvironment>)> {
    require_user(&body.user_id)?;
    let created = state
        .manager
        .create(CreateEnvironment {
            user_id: body.user_id,
            env_type: body.env_type,
            quota: body.quota,
            gpu_count: body.gpu_count,
            memory_gb: body.memory_gb,
            cpu_cores: body.cpu_cores,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn create_from_template(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateFromTemplateBody>,
) -> ApiResult<(StatusCode, Json<TemplateEnvironment>)> {
    require_user(&body.user_id)?;
    let created = state
        .manager
        .create_from_template(&body.user_id, &body.template, &body.quota)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn start_environment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let user = optional_user(&body)?;
    let new_state = state.manager.start(&id, user.as_deref()).await?;
    Ok(Json(json!({ "container_id": id, "state": new_state })))
}

pub async fn stop_environment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let user = optional_user(&body)?;
    let new_state = state.manager.stop(&id, user.as_deref()).await?;
    Ok(Json(json!({ "container_id": id, "state": new_state })))
}

pub async fn restart_environment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let user = optional_user(&body)?;
    let new_state = state.manager.restart(&id, user.as_deref()).await?;
    Ok(Json(json!({ "container_id": id, "state": new_state })))
}

pub async fn pause_environment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let user = optional_user(&body)?;
    let new_state = state.manager.pause(&id, user.as_deref()).await?;
    Ok(Json(json!({ "container_id": id, "state": new_state })))
}

pub async fn resume_environment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let user = optional_user(&body)?;
    let new_state = state.manager.resume(&id, user.as_deref()).await?;
    Ok(Json(json!({ "container_id": id, "state": new_state })))
}

pub async fn delete_environment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UserQuery>,
) -> ApiResult<Json<DeletedEnvironment>> {
    let deleted = state.manager.delete(&id, query.user_id.as_deref()).await?;
    Ok(Json(deleted))
}

pub async fn get_access(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AccessInfo>> {
    Ok(Json(state.manager.access(&id).await?))
}

pub async fn get_runtime(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<RuntimeQuery>,
) -> ApiResult<Json<RuntimeReport>> {
    let tier = query
        .quota
        .as_deref()
        .map(str::parse::<QuotaTier>)
        .transpose()
        .map_err(LabError::from)?;
    Ok(Json(state.manager.check_runtime(&id, tier)?))
}

pub async fn install_packages(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<InstallPackagesBody>,
) -> ApiResult<Json<Value>> {
    if body.packages.iter().all(|p| p.trim().is_empty()) {
        return Err(ApiError::BadRequest("packages must not be empty".to_string()));
    }
    let packages = body.packages.clone();
    let output = state
        .manager
        .install_packages(&id, body.user_id.as_deref(), body.packages)
        .await?;
    Ok(Json(json!({
        "container_id": id,
        "packages": packages,
        "output": output,
    })))
}

pub async fn cleanup_environments(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<CleanupReport>> {
    Ok(Json(state.manager.cleanup().await?))
}
