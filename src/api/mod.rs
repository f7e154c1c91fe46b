// src/api/mod.rs
// HTTP surface: chat endpoint, health, auth, and file endpoints that
// delegate straight to the file store with the caller's session id

pub mod handlers;

use crate::agent::Agent;
use crate::auth::AuthService;
use crate::config::SecurityConfig;
use crate::filestore::FileStore;
use crate::memory::MemoryIndexer;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    pub store: Arc<FileStore>,
    pub auth: Arc<AuthService>,
    pub indexer: Arc<MemoryIndexer>,
    pub security: SecurityConfig,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/chat", post(handlers::chat))
        .route("/api/chat/{conversation_id}/reset", post(handlers::reset_conversation))
        .route("/api/memory/status", get(handlers::memory_status))
        .route("/auth/login", post(handlers::login))
        .route("/auth/refresh", post(handlers::refresh))
        .route("/auth/me", get(handlers::me))
        .route("/auth/logout", post(handlers::logout))
        .route("/api/files/upload", post(handlers::upload_file))
        .route("/api/files", get(handlers::list_files))
        .route("/api/files/{file_ref}", get(handlers::fetch_file))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod api_tests;
