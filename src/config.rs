//! Configuration module for the chat relay.

use serde::Deserialize;
use std::path::Path;

use crate::{RelayError, Result};

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file (`:memory:` for a throwaway database).
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/chat.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file. Empty disables file logging.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/chatrelay.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Identity token verification configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Signature algorithm: "RS256" (issuer public key) or "HS256" (shared secret).
    #[serde(default = "default_auth_algorithm")]
    pub algorithm: String,
    /// Issuer public key in PEM form.
    #[serde(default)]
    pub public_key: String,
    /// Path to a PEM file holding the issuer public key. Used when `public_key` is empty.
    #[serde(default)]
    pub public_key_path: String,
    /// Shared secret for HS256.
    #[serde(default)]
    pub secret: String,
    /// Expected audience. Audience is not checked when unset.
    #[serde(default)]
    pub audience: Option<String>,
    /// Expected issuer. Issuer is not checked when unset.
    #[serde(default)]
    pub issuer: Option<String>,
}

fn default_auth_algorithm() -> String {
    "RS256".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            algorithm: default_auth_algorithm(),
            public_key: String::new(),
            public_key_path: String::new(),
            secret: String::new(),
            audience: None,
            issuer: None,
        }
    }
}

impl AuthConfig {
    /// Resolve the PEM public key, reading `public_key_path` if needed.
    pub fn resolve_public_key(&self) -> Result<String> {
        if !self.public_key.is_empty() {
            return Ok(self.public_key.clone());
        }
        if self.public_key_path.is_empty() {
            return Err(RelayError::Config(
                "auth.public_key or auth.public_key_path must be set for RS256".to_string(),
            ));
        }
        Ok(std::fs::read_to_string(&self.public_key_path)?)
    }
}

/// Which broker implementation backs the room channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// In-process broker. Only one relay process can share it.
    Memory,
    /// Networked broker reached over TCP.
    Tcp,
}

/// Pub/sub broker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Broker implementation.
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,
    /// Broker address ("host:port") for the TCP broker.
    #[serde(default = "default_broker_address")]
    pub address: String,
    /// Run an embedded broker server on `address` in this process.
    #[serde(default)]
    pub serve: bool,
    /// Resubscribe attempts before a room is marked degraded.
    #[serde(default = "default_resubscribe_attempts")]
    pub resubscribe_attempts: u32,
    /// Initial resubscribe backoff in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Maximum resubscribe backoff in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Fail the first connection of a room when the initial subscribe fails,
    /// instead of admitting it into a degraded room.
    #[serde(default)]
    pub fail_fast: bool,
    /// Per-channel buffer of the in-memory broker.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_broker_kind() -> BrokerKind {
    BrokerKind::Memory
}

fn default_broker_address() -> String {
    "127.0.0.1:6380".to_string()
}

fn default_resubscribe_attempts() -> u32 {
    5
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    5000
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            address: default_broker_address(),
            serve: false,
            resubscribe_attempts: default_resubscribe_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            fail_fast: false,
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Chat behaviour configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
    /// Maximum message length in characters.
    #[serde(default = "default_max_message_length")]
    pub max_message_length: usize,
    /// History page size when the request does not give one.
    #[serde(default = "default_history_limit")]
    pub default_history_limit: u32,
    /// Upper bound for the history page size.
    #[serde(default = "default_max_history_limit")]
    pub max_history_limit: u32,
}

fn default_max_message_length() -> usize {
    4000
}

fn default_history_limit() -> u32 {
    50
}

fn default_max_history_limit() -> u32 {
    500
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_message_length: default_max_message_length(),
            default_history_limit: default_history_limit(),
            max_history_limit: default_max_history_limit(),
        }
    }
}

/// External profile service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfileConfig {
    /// Base URL; the user id is appended as the last path segment.
    /// Pictures are not fetched when unset.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_profile_timeout")]
    pub timeout_secs: u64,
}

fn default_profile_timeout() -> u64 {
    3
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: default_profile_timeout(),
        }
    }
}

/// Web API configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebConfig {
    /// CORS allowed origins. Empty allows any origin without credentials.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Token verification.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Pub/sub broker.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Chat limits.
    #[serde(default)]
    pub chat: ChatConfig,
    /// Profile service.
    #[serde(default)]
    pub profile: ProfileConfig,
    /// Web API.
    #[serde(default)]
    pub web: WebConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(RelayError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| RelayError::Validation(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `RELAY_AUTH_PUBLIC_KEY`: issuer public key (PEM)
    /// - `RELAY_AUTH_SECRET`: HS256 shared secret
    /// - `RELAY_BROKER_ADDRESS`: TCP broker address
    /// - `RELAY_DATABASE_PATH`: SQLite database path
    pub fn apply_env_overrides(&mut self) {
        fn non_empty(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }

        if let Some(key) = non_empty("RELAY_AUTH_PUBLIC_KEY") {
            self.auth.public_key = key;
        }
        if let Some(secret) = non_empty("RELAY_AUTH_SECRET") {
            self.auth.secret = secret;
        }
        if let Some(address) = non_empty("RELAY_BROKER_ADDRESS") {
            self.broker.address = address;
        }
        if let Some(path) = non_empty("RELAY_DATABASE_PATH") {
            self.database.path = path;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        match self.auth.algorithm.to_uppercase().as_str() {
            "RS256" => {
                if self.auth.public_key.is_empty() && self.auth.public_key_path.is_empty() {
                    return Err(RelayError::Validation(
                        "auth.algorithm is RS256 but no public key is configured. \
                         Set auth.public_key, auth.public_key_path or RELAY_AUTH_PUBLIC_KEY."
                            .to_string(),
                    ));
                }
            }
            "HS256" => {
                if self.auth.secret.is_empty() {
                    return Err(RelayError::Validation(
                        "auth.algorithm is HS256 but auth.secret is not set".to_string(),
                    ));
                }
            }
            other => {
                return Err(RelayError::Validation(format!(
                    "unsupported auth.algorithm: {other}"
                )));
            }
        }

        if (self.broker.kind == BrokerKind::Tcp || self.broker.serve)
            && self.broker.address.is_empty()
        {
            return Err(RelayError::Validation(
                "broker.address must be set for the TCP broker".to_string(),
            ));
        }

        if self.broker.resubscribe_attempts == 0 {
            return Err(RelayError::Validation(
                "broker.resubscribe_attempts must be at least 1".to_string(),
            ));
        }

        if self.chat.max_history_limit == 0 {
            return Err(RelayError::Validation(
                "chat.max_history_limit must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.database.path, "data/chat.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.auth.algorithm, "RS256");
        assert!(config.auth.audience.is_none());
        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.broker.resubscribe_attempts, 5);
        assert!(!config.broker.fail_fast);
        assert_eq!(config.chat.default_history_limit, 50);
        assert!(config.profile.base_url.is_none());
        assert!(config.web.cors_origins.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 9000

[database]
path = "custom/chat.db"

[logging]
level = "debug"
file = ""

[auth]
algorithm = "HS256"
secret = "dev-secret"
audience = "chat_client"

[broker]
kind = "tcp"
address = "broker:6380"
serve = true
resubscribe_attempts = 3
initial_backoff_ms = 50
max_backoff_ms = 400
fail_fast = true

[chat]
max_message_length = 200
default_history_limit = 20
max_history_limit = 100

[profile]
base_url = "http://user_service:8000/admin/api/users/users"
timeout_secs = 1

[web]
cors_origins = ["http://localhost:5173"]
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.path, "custom/chat.db");
        assert_eq!(config.logging.file, "");
        assert_eq!(config.auth.algorithm, "HS256");
        assert_eq!(config.auth.audience.as_deref(), Some("chat_client"));
        assert_eq!(config.broker.kind, BrokerKind::Tcp);
        assert!(config.broker.serve);
        assert_eq!(config.broker.max_backoff_ms, 400);
        assert!(config.broker.fail_fast);
        assert_eq!(config.chat.max_message_length, 200);
        assert_eq!(
            config.profile.base_url.as_deref(),
            Some("http://user_service:8000/admin/api/users/users")
        );
        assert_eq!(config.web.cors_origins.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.broker.channel_capacity, 1024);
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = Config::parse("this is not valid toml [[[");
        match result {
            Err(RelayError::Validation(msg)) => assert!(msg.contains("config parse error")),
            other => panic!("Expected Validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load("nonexistent.toml");
        assert!(matches!(result, Err(RelayError::Io(_))));
    }

    #[test]
    fn test_validate_requires_public_key_for_rs256() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("public key"));
    }

    #[test]
    fn test_validate_requires_secret_for_hs256() {
        let mut config = Config::default();
        config.auth.algorithm = "HS256".to_string();
        assert!(config.validate().is_err());

        config.auth.secret = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_algorithm() {
        let mut config = Config::default();
        config.auth.algorithm = "none".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_resubscribe_attempts() {
        let mut config = Config::default();
        config.auth.algorithm = "HS256".to_string();
        config.auth.secret = "secret".to_string();
        config.broker.resubscribe_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_env_overrides_broker_address() {
        let original = std::env::var("RELAY_BROKER_ADDRESS").ok();

        std::env::set_var("RELAY_BROKER_ADDRESS", "10.0.0.5:6380");
        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.broker.address, "10.0.0.5:6380");

        if let Some(val) = original {
            std::env::set_var("RELAY_BROKER_ADDRESS", val);
        } else {
            std::env::remove_var("RELAY_BROKER_ADDRESS");
        }
    }

    #[test]
    fn test_resolve_public_key_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("issuer.pem");
        std::fs::write(&path, "-----BEGIN PUBLIC KEY-----\nabc\n-----END PUBLIC KEY-----\n")
            .unwrap();

        let config = AuthConfig {
            public_key_path: path.to_string_lossy().into_owned(),
            ..AuthConfig::default()
        };
        let pem = config.resolve_public_key().unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn test_resolve_public_key_missing() {
        let config = AuthConfig::default();
        assert!(matches!(
            config.resolve_public_key(),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn test_example_config_is_valid() {
        let config = Config::parse(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Tcp);
        assert!(config.broker.serve);
        assert_eq!(config.chat.default_history_limit, 50);
        assert!(config.profile.base_url.is_none());
        assert!(config.validate().is_ok());
    }
}
