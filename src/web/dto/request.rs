//! Request DTOs for the REST API.

use serde::Deserialize;
use validator::Validate;

use super::validation::no_control_chars;

/// Create a direct chat with another user.
#[derive(Debug, Deserialize, Validate)]
pub struct CreateChatRequest {
    /// The other participant's identity.
    #[serde(rename = "userId")]
    #[validate(
        length(min = 1, max = 255, message = "userId must not be empty"),
        custom(function = "no_control_chars")
    )]
    pub user_id: String,
}

/// Query string of the history endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

impl HistoryQuery {
    /// The effective page size: `default` when absent, clamped to `[1, max]`.
    pub fn effective_limit(&self, default: u32, max: u32) -> u32 {
        self.limit.unwrap_or(default).clamp(1, max.max(1))
    }
}
