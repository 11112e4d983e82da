//! In-memory session store implementation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::traits::{Message, Role, SessionStore};

#[derive(Default)]
struct Inner {
    next_id: i64,
    sessions: HashMap<String, Vec<Message>>,
}

/// A process-lifetime session store backed by a mutex-protected hash map.
pub struct InMemorySessionStore {
    inner: Mutex<Inner>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save_message(&self, session_id: &str, role: Role, content: &str) -> Result<Message> {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let message = Message {
            id: inner.next_id,
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
        };
        inner
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn load_context(&self, session_id: &str, limit: usize) -> Vec<Message> {
        let inner = self.inner.lock();
        let Some(messages) = inner.sessions.get(session_id) else {
            return Vec::new();
        };
        let start = messages.len().saturating_sub(limit);
        messages[start..].to_vec()
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.inner.lock().sessions.remove(session_id);
        Ok(())
    }

    async fn prune(&self, session_id: &str, keep_recent: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        let Some(messages) = inner.sessions.get_mut(session_id) else {
            return Ok(0);
        };
        if messages.len() <= keep_recent.saturating_mul(2) {
            return Ok(0);
        }
        let excess = messages.len() - keep_recent;
        messages.drain(..excess);
        Ok(excess)
    }

    async fn message_count(&self, session_id: &str) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .sessions
            .get(session_id)
            .map_or(0, Vec::len))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(store: &InMemorySessionStore, session_id: &str, count: usize) {
        for i in 0..count {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .save_message(session_id, role, &format!("m{}", i + 1))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn save_then_load_returns_message() {
        let store = InMemorySessionStore::new();
        let saved = store.save_message("s1", Role::User, "hello").await.unwrap();

        let context = store.load_context("s1", 5).await;
        assert_eq!(context, vec![saved]);
    }

    #[tokio::test]
    async fn load_context_is_chronological_and_bounded() {
        let store = InMemorySessionStore::new();
        seed(&store, "s1", 10).await;

        let context = store.load_context("s1", 3).await;
        let contents: Vec<&str> = context.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m8", "m9", "m10"]);
        assert!(context.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let store = InMemorySessionStore::new();
        seed(&store, "a", 2).await;
        seed(&store, "b", 1).await;

        assert_eq!(store.message_count("a").await.unwrap(), 2);
        assert_eq!(store.message_count("b").await.unwrap(), 1);
        assert!(store.load_context("missing", 5).await.is_empty());
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let store = InMemorySessionStore::new();
        seed(&store, "s1", 4).await;

        store.clear_session("s1").await.unwrap();
        store.clear_session("s1").await.unwrap();
        assert!(store.load_context("s1", 5).await.is_empty());
    }

    #[tokio::test]
    async fn prune_only_past_twice_keep() {
        let store = InMemorySessionStore::new();
        seed(&store, "s1", 6).await;
        assert_eq!(store.prune("s1", 3).await.unwrap(), 0);

        seed(&store, "s1", 1).await;
        assert_eq!(store.prune("s1", 3).await.unwrap(), 4);
        assert_eq!(store.message_count("s1").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn ids_keep_increasing_after_clear() {
        let store = InMemorySessionStore::new();
        let first = store.save_message("s1", Role::User, "a").await.unwrap();
        store.clear_session("s1").await.unwrap();
        let second = store.save_message("s1", Role::User, "b").await.unwrap();
        assert!(second.id > first.id);
    }
}
