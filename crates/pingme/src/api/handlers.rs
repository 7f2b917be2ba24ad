//! HTTP request handlers.

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
};
use pingme_protocol::{ChatStatus, CreateChatRequest, MessageId, MessageView, UpdateChatRequest};
use serde::Serialize;
use tracing::instrument;

use crate::auth::CurrentUser;

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

fn parse_message_id(raw: &str) -> ApiResult<MessageId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request("Invalid ID"))
}

/// Send a message.
///
/// POST /chat
#[instrument(skip(state, user, payload), fields(user = user.username()))]
pub async fn create_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    payload: Result<Json<CreateChatRequest>, JsonRejection>,
) -> ApiResult<Json<MessageView>> {
    let Json(request) = payload?;
    let view = state.chat.create_outbound(&user, request).await?;
    Ok(Json(view))
}

/// List the caller's conversations, oldest first.
///
/// GET /chat
#[instrument(skip(state, user), fields(user = user.username()))]
pub async fn list_chats(
    State(state): State<AppState>,
    user: CurrentUser,
) -> ApiResult<Json<Vec<MessageView>>> {
    let views = state.chat.list_conversations(&user).await?;
    Ok(Json(views))
}

/// Edit a message the caller sent.
///
/// PUT /chat/{id}
#[instrument(skip(state, user, payload), fields(user = user.username()))]
pub async fn update_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    payload: Result<Json<UpdateChatRequest>, JsonRejection>,
) -> ApiResult<Json<ChatStatus>> {
    let id = parse_message_id(&id)?;
    let Json(request) = payload?;
    let status = state.chat.update_message(&user, &id, request.body).await?;
    Ok(Json(status))
}

/// Delete a message the caller sent.
///
/// DELETE /chat/{id}
#[instrument(skip(state, user), fields(user = user.username()))]
pub async fn delete_chat(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ChatStatus>> {
    let id = parse_message_id(&id)?;
    let status = state.chat.delete_message(&user, &id).await?;
    Ok(Json(status))
}
