// src/api/handlers.rs
// Request handlers. User-visible failures ride a 200 with success=false;
// malformed requests get 4xx.

use super::AppState;
use crate::auth::{create_access_token, create_refresh_token, verify_token, TokenKind};
use crate::error::AgentError;
use crate::filestore::{FileCategory, StoreOptions};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    pub response: String,
    pub success: bool,
    pub tokens_used: u64,
    pub session_tokens: u64,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> impl IntoResponse {
    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "message must not be empty"})),
        )
            .into_response();
    }

    let result = state
        .agent
        .handle_message(&req.message, req.conversation_id)
        .await;

    Json(ChatResponse {
        conversation_id: result.conversation_id,
        response: result.response,
        success: result.success,
        tokens_used: result.tokens_used,
        session_tokens: result.session_tokens,
        timestamp: chrono::Utc::now().to_rfc3339(),
        error: result.error,
    })
    .into_response()
}

pub async fn reset_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
) -> impl IntoResponse {
    let existed = state.agent.reset_conversation(&conversation_id).await;
    Json(json!({"reset": existed}))
}

pub async fn memory_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.indexer.status().await {
        Ok(status) => Json(json!({"success": true, "index": status})).into_response(),
        Err(e) => Json(json!({"success": false, "error": e.to_string()})).into_response(),
    }
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> impl IntoResponse {
    match state.auth.login(&req.username, &req.password).await {
        Ok(user) => {
            let access = create_access_token(
                &user.id,
                &user.username,
                state.security.access_token_minutes,
            );
            let refresh = create_refresh_token(
                &user.id,
                &user.username,
                state.security.refresh_token_days,
            );
            match (access, refresh) {
                (Ok(access_token), Ok(refresh_token)) => Json(json!({
                    "success": true,
                    "access_token": access_token,
                    "refresh_token": refresh_token,
                    "user": user,
                }))
                .into_response(),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"success": false, "error": "token creation failed"})),
                )
                    .into_response(),
            }
        }
        Err(e) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "error": e.to_user_string()})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> impl IntoResponse {
    match verify_token(&req.refresh_token) {
        Ok(claims) if claims.kind == TokenKind::Refresh => {
            match create_access_token(
                &claims.sub,
                &claims.username,
                state.security.access_token_minutes,
            ) {
                Ok(access_token) => {
                    Json(json!({"success": true, "access_token": access_token})).into_response()
                }
                Err(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"success": false, "error": "token creation failed"})),
                )
                    .into_response(),
            }
        }
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "error": "invalid refresh token"})),
        )
            .into_response(),
    }
}

fn bearer_claims(headers: &HeaderMap) -> Option<crate::auth::Claims> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    verify_token(token).ok()
}

pub async fn me(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let Some(claims) = bearer_claims(&headers) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "error": "missing or invalid token"})),
        )
            .into_response();
    };
    if claims.kind != TokenKind::Access {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "error": "access token required"})),
        )
            .into_response();
    }
    match state.auth.get_user(&claims.username).await {
        Ok(Some(user)) => Json(json!({"success": true, "user": user})).into_response(),
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"success": false, "error": "user not found"})),
        )
            .into_response(),
    }
}

pub async fn logout() -> impl IntoResponse {
    // Tokens are stateless; the client drops them.
    Json(json!({"success": true}))
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    pub content_base64: String,
    pub conversation_id: String,
}

pub async fn upload_file(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> impl IntoResponse {
    let Ok(content) = base64::engine::general_purpose::STANDARD.decode(&req.content_base64) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "content_base64 is not valid base64"})),
        )
            .into_response();
    };

    let opts = StoreOptions {
        filename: Some(req.filename),
        session_id: Some(req.conversation_id),
        mime_type: None,
        metadata: None,
    };
    match state.store.store(&content, FileCategory::Upload, opts).await {
        Ok(file_ref) => Json(json!({
            "success": true,
            "file_ref": file_ref.to_ref_string(),
            "size_bytes": file_ref.size_bytes,
            "hash": file_ref.hash,
        }))
        .into_response(),
        Err(e @ AgentError::SizeExceeded { .. }) => (
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(json!({"success": false, "error": e.to_user_string()})),
        )
            .into_response(),
        Err(e) => Json(json!({"success": false, "error": e.to_user_string()})).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    #[serde(default)]
    pub category: Option<String>,
    pub conversation_id: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list_files(
    State(state): State<AppState>,
    Query(query): Query<ListFilesQuery>,
) -> impl IntoResponse {
    let category = match query.category.as_deref() {
        None => FileCategory::Upload,
        Some(raw) => match FileCategory::parse(raw) {
            Some(c) => c,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"success": false, "error": format!("unknown category: {}", raw)})),
                )
                    .into_response()
            }
        },
    };

    match state
        .store
        .list_files(category, Some(&query.conversation_id), query.limit)
        .await
    {
        Ok(files) => Json(json!({"success": true, "files": files})).into_response(),
        Err(e) => Json(json!({"success": false, "error": e.to_user_string()})).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct FetchFileQuery {
    pub conversation_id: String,
}

pub async fn fetch_file(
    State(state): State<AppState>,
    Path(file_ref): Path<String>,
    Query(query): Query<FetchFileQuery>,
) -> impl IntoResponse {
    let resolved = match state.store.resolve_ref(&file_ref).await {
        Ok(Some(r)) => r,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"success": false, "error": "file not found"})),
            )
                .into_response()
        }
        Err(e @ AgentError::PathViolation(_)) | Err(e @ AgentError::BadInput(_)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "error": e.to_user_string()})),
            )
                .into_response()
        }
        Err(e) => {
            return Json(json!({"success": false, "error": e.to_user_string()})).into_response()
        }
    };

    match state
        .store
        .retrieve_for_session(&resolved, &query.conversation_id)
        .await
    {
        Ok(Some(bytes)) => Json(json!({
            "success": true,
            "file_ref": resolved.to_ref_string(),
            "mime_type": resolved.mime_type,
            "content_base64": base64::engine::general_purpose::STANDARD.encode(bytes),
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "file not found"})),
        )
            .into_response(),
        Err(e @ AgentError::NotPermitted(_)) => (
            StatusCode::FORBIDDEN,
            Json(json!({"success": false, "error": e.to_user_string()})),
        )
            .into_response(),
        Err(e) => Json(json!({"success": false, "error": e.to_user_string()})).into_response(),
    }
}
