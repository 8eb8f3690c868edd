// Agent Jobs - cancellable background jobs for conversational AI agents

pub mod agents;
pub mod config;
pub mod db;
pub mod llm;
pub mod middleware;
pub mod models;
pub mod queue;
pub mod routes;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use models::AppState;

pub fn create_router(state: AppState) -> axum::Router {
    routes::create_router(state)
}
