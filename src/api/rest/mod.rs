pub mod api;
pub mod error;
pub mod handlers;
pub mod logging_middleware;
pub mod routes;
pub mod state;

pub use routes::create_router;
pub use state::AppState;
