//! chatrelay - real-time chat relay
//!
//! Clients hold WebSocket connections to rooms. Every message is persisted,
//! published on the room's broker channel and delivered to each connection of
//! that room on every relay process sharing the broker.

pub mod auth;
pub mod broker;
pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod profile;
pub mod web;

pub use auth::{Identity, TokenVerifier};
pub use broker::{Broker, BrokerError};
pub use chat::{ChatRelay, ConnectionRegistry};
pub use config::Config;
pub use db::Database;
pub use error::{RelayError, Result};
