//! Session storage traits and types for per-agent conversation logs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Author of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(role: &str) -> Option<Self> {
        match role {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single persisted turn half. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Assigned by the store; strictly increasing per store instance.
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only conversation log for one agent namespace.
///
/// Sessions are implicit: the first `save_message` for an id creates one,
/// and it lives until `clear_session`.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append a message stamped with the current time.
    async fn save_message(&self, session_id: &str, role: Role, content: &str) -> Result<Message>;

    /// Up to `limit` most recent messages, oldest first.
    ///
    /// Read failures are logged and yield an empty history; a missing
    /// context never blocks a turn.
    async fn load_context(&self, session_id: &str, limit: usize) -> Vec<Message>;

    /// Remove every message of the session. Clearing an unknown session is a no-op.
    async fn clear_session(&self, session_id: &str) -> Result<()>;

    /// Once the session holds more than `2 * keep_recent` messages, delete
    /// all but the newest `keep_recent`. Returns the number of rows deleted.
    async fn prune(&self, session_id: &str, keep_recent: usize) -> Result<usize>;

    /// Number of stored messages for the session.
    async fn message_count(&self, session_id: &str) -> Result<usize>;

    /// The name of this session store implementation.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        for role in [Role::User, Role::Assistant] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("system"), None);
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(Role::User.to_string(), "user");
    }
}
