//! Authentication handlers.

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::db::UserRepository;
use crate::web::dto::MeResponse;
use crate::web::error::ApiError;
use crate::web::middleware::AuthUser;

use super::AppState;

/// Get the current user.
///
/// GET /api/auth/me
///
/// The first authenticated request of an identity creates its user row.
pub async fn me(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
) -> Result<Json<MeResponse>, ApiError> {
    let user = UserRepository::new(state.db.pool())
        .ensure(&identity.user_id, &identity.username)
        .await?;

    Ok(Json(MeResponse::new(&identity, user.created_at)))
}
