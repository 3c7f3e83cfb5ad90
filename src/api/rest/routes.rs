use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::api::rest::{handlers, logging_middleware::request_logging_middleware, AppState};

pub fn create_router(state: Arc<AppState>) -> Router {
    let environment_routes = Router::new()
        .route("/environments", get(handlers::environments::list_environments))
        .route("/environments/types", get(handlers::environments::list_types))
        .route("/environments/templates", get(handlers::environments::list_templates))
        .route("/environments/create", post(handlers::environments::create_environment))
        .route(
            "/environments/create-from-template",
            post(handlers::environments::create_from_template),
        )
        .route(
            "/environments/cleanup",
            post(handlers::environments::cleanup_environments),
        )
        .route(
            "/environments/{id}",
            delete(handlers::environments::delete_environment),
        )
        .route(
            "/environments/{id}/start",
            post(handlers::environments::start_environment),
        )
        .route(
            "/environments/{id}/stop",
            post(handlers::environments::stop_environment),
        )
        .route(
            "/environments/{id}/restart",
            post(handlers::environments::restart_environment),
        )
        .route(
            "/environments/{id}/pause",
            post(handlers::environments::pause_environment),
        )
        .route(
            "/environments/{id}/resume",
            post(handlers::environments::resume_environment),
        )
        .route("/environments/{id}/access", get(handlers::environments::get_access))
        .route("/environments/{id}/runtime", get(handlers::environments::get_runtime))
        .route(
            "/environments/{id}/packages",
            post(handlers::environments::install_packages),
        );

    let resource_routes = Router::new()
        .route("/health", get(handlers::resources::health))
        .route("/resources/availability", get(handlers::resources::availability))
        .route("/quotas", get(handlers::resources::list_quotas))
        .route("/users/{user_id}/resources", get(handlers::users::get_user_resources));

    let admin_routes = Router::new()
        .route("/admin/reconcile", post(handlers::admin::reconcile))
        .route("/admin/backups/{user_id}", post(handlers::admin::backup_user));

    let api_routes = environment_routes
        .merge(resource_routes)
        .merge(admin_routes)
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(middleware::from_fn(request_logging_middleware))
        .layer(TraceLayer::new_for_http())
}
