//! Client for the external profile service.
//!
//! Room listings show each participant's picture. Pictures come from
//! `GET {base_url}/{user_id}`, which answers JSON with a `picture` field.
//! Every failure (no base URL, network error, non-200, bad JSON) yields `None`.

use std::time::Duration;

use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::ProfileConfig;
use crate::{RelayError, Result};

/// User agent string for profile lookups.
const USER_AGENT: &str = "chatrelay/0.1 (profile lookup)";

#[derive(Debug, Deserialize)]
struct ProfileResponse {
    #[serde(default)]
    picture: Option<String>,
}

/// Profile service client.
#[derive(Debug, Clone)]
pub struct ProfileClient {
    client: Client,
    base_url: Option<Url>,
}

impl ProfileClient {
    /// Create a client from the configuration.
    pub fn new(config: &ProfileConfig) -> Result<Self> {
        let base_url = match &config.base_url {
            Some(raw) if !raw.is_empty() => {
                let url = Url::parse(raw)
                    .map_err(|e| RelayError::Config(format!("invalid profile.base_url: {e}")))?;
                if url.cannot_be_a_base() {
                    return Err(RelayError::Config(format!(
                        "profile.base_url cannot be a base URL: {raw}"
                    )));
                }
                Some(url)
            }
            _ => None,
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RelayError::Profile(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, base_url })
    }

    /// A client that never looks anything up.
    pub fn disabled() -> Self {
        Self {
            client: Client::new(),
            base_url: None,
        }
    }

    fn profile_url(&self, user_id: &str) -> Option<Url> {
        let mut url = self.base_url.clone()?;
        url.path_segments_mut().ok()?.pop_if_empty().push(user_id);
        Some(url)
    }

    /// Fetch one user's picture.
    pub async fn picture(&self, user_id: &str) -> Option<String> {
        let url = self.profile_url(user_id)?;

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(%user_id, error = %e, "Profile lookup failed");
                return None;
            }
        };
        if response.status() != StatusCode::OK {
            debug!(%user_id, status = %response.status(), "Profile lookup returned non-200");
            return None;
        }

        match response.json::<ProfileResponse>().await {
            Ok(profile) => profile.picture,
            Err(e) => {
                debug!(%user_id, error = %e, "Profile response was not understood");
                None
            }
        }
    }

    /// Fetch several pictures concurrently, in input order.
    pub async fn pictures(&self, user_ids: &[&str]) -> Vec<Option<String>> {
        join_all(user_ids.iter().map(|id| self.picture(id))).await
    }
}
