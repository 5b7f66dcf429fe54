//! Room management and history handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

use crate::db::{MessageRepository, RoomRepository, UserRepository};
use crate::web::dto::{
    ChatCreatedResponse, CreateChatRequest, HistoryQuery, MessageResponse, ParticipantResponse,
    RoomResponse, ValidatedJson,
};
use crate::web::error::ApiError;
use crate::web::middleware::AuthUser;

use super::AppState;

/// Create a direct chat between the caller and another user.
///
/// POST /api/chat/chats
pub async fn create_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    ValidatedJson(req): ValidatedJson<CreateChatRequest>,
) -> Result<Json<ChatCreatedResponse>, ApiError> {
    let users = UserRepository::new(state.db.pool());
    users.ensure(&identity.user_id, &identity.username).await?;

    if req.user_id == identity.user_id {
        return Err(ApiError::bad_request("Cannot create a chat with yourself"));
    }
    if !users.exists(&req.user_id).await? {
        return Err(ApiError::bad_request("Both users must be registered"));
    }

    let room = RoomRepository::new(state.db.pool())
        .create("", &[identity.user_id.as_str(), req.user_id.as_str()])
        .await?;

    tracing::info!(
        room_id = %room.id,
        user_id = %identity.user_id,
        peer_id = %req.user_id,
        "Chat created"
    );

    Ok(Json(ChatCreatedResponse::new(room.id)))
}

/// List the caller's rooms with their participants.
///
/// GET /api/chat/chats
pub async fn list_chats(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
) -> Result<Json<Vec<RoomResponse>>, ApiError> {
    UserRepository::new(state.db.pool())
        .ensure(&identity.user_id, &identity.username)
        .await?;

    let repo = RoomRepository::new(state.db.pool());
    let rooms = repo.list_for_user(&identity.user_id).await?;

    let mut listed = Vec::with_capacity(rooms.len());
    for room in rooms {
        let participants = repo.participants(&room.id).await?;
        listed.push((room, participants));
    }

    // One concurrent batch of profile lookups for every participant listed.
    let ids: Vec<&str> = listed
        .iter()
        .flat_map(|(_, participants)| participants.iter().map(|p| p.id.as_str()))
        .collect();
    let mut pictures = state.profiles.pictures(&ids).await.into_iter();

    let response = listed
        .into_iter()
        .map(|(room, participants)| RoomResponse {
            id: room.id,
            name: room.name,
            participants: participants
                .into_iter()
                .map(|p| ParticipantResponse {
                    id: p.id,
                    username: p.username,
                    picture: pictures.next().flatten(),
                })
                .collect(),
        })
        .collect();

    Ok(Json(response))
}

/// Get the most recent messages of a room, newest first.
///
/// GET /api/chat/chats/:room_id/messages?limit=50
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageResponse>>, ApiError> {
    let rooms = RoomRepository::new(state.db.pool());
    if !rooms.is_participant(&room_id, &identity.user_id).await? {
        if rooms.get_by_id(&room_id).await?.is_none() {
            return Err(ApiError::not_found("Chat not found"));
        }
        return Err(ApiError::forbidden("Not a participant of this chat"));
    }

    let chat = state.relay.config();
    let limit = query.effective_limit(chat.default_history_limit, chat.max_history_limit);

    let messages = MessageRepository::new(state.db.pool())
        .list_recent(&room_id, limit)
        .await?;
    if messages.is_empty() {
        return Err(ApiError::not_found("No messages found"));
    }

    Ok(Json(messages.into_iter().map(MessageResponse::from).collect()))
}
