//! SQLite-backed session store. One database file per agent namespace.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task;

use super::traits::{Message, Role, SessionStore};

pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

type RawRow = (i64, String, String, String, String);

impl SqliteSessionStore {
    /// Open (or create) `<dir>/sessions.db`.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| {
            format!("Failed to create session db directory: {}", dir.display())
        })?;

        let db_path = dir.join("sessions.db");
        let conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open sessions DB: {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )
        .context("Failed to configure sessions DB pragmas")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_conversations_session
                ON conversations(session_id, id);",
        )
        .context("Failed to initialize sessions DB schema")
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        task::spawn_blocking(move || f(&conn.lock()))
            .await
            .context("Session store task failed")?
    }
}

fn query_recent(conn: &Connection, session_id: &str, limit: usize) -> Result<Vec<Message>> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = conn
        .prepare(
            "SELECT id, session_id, role, content, timestamp FROM conversations
             WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
        )
        .context("Failed to prepare context query")?;
    let rows = stmt
        .query_map(params![session_id, limit], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })
        .context("Failed to query session context")?
        .collect::<rusqlite::Result<Vec<RawRow>>>()
        .context("Failed to read session context rows")?;

    let mut messages = rows
        .into_iter()
        .map(decode_row)
        .collect::<Result<Vec<_>>>()?;
    messages.reverse();
    Ok(messages)
}

fn count_messages(conn: &Connection, session_id: &str) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM conversations WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )
    .context("Failed to count session messages")
}

fn decode_row((id, session_id, role, content, timestamp): RawRow) -> Result<Message> {
    let role = Role::parse(&role).with_context(|| format!("Unknown role '{role}' in row {id}"))?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .with_context(|| format!("Invalid timestamp in row {id}"))?
        .with_timezone(&Utc);
    Ok(Message {
        id,
        session_id,
        role,
        content,
        timestamp,
    })
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save_message(&self, session_id: &str, role: Role, content: &str) -> Result<Message> {
        let session_id = session_id.to_string();
        let content = content.to_string();
        self.with_conn(move |conn| {
            let timestamp = Utc::now();
            conn.execute(
                "INSERT INTO conversations (session_id, role, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4)",
                params![session_id, role.as_str(), content, timestamp.to_rfc3339()],
            )
            .context("Failed to insert session message")?;
            Ok(Message {
                id: conn.last_insert_rowid(),
                session_id,
                role,
                content,
                timestamp,
            })
        })
        .await
    }

    async fn load_context(&self, session_id: &str, limit: usize) -> Vec<Message> {
        if limit == 0 {
            return Vec::new();
        }
        let owned = session_id.to_string();
        match self
            .with_conn(move |conn| query_recent(conn, &owned, limit))
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(
                    session_id,
                    db = %self.db_path.display(),
                    error = %format!("{e:#}"),
                    "Failed to load session context; continuing without history"
                );
                Vec::new()
            }
        }
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM conversations WHERE session_id = ?1",
                params![session_id],
            )
            .context("Failed to clear session")?;
            Ok(())
        })
        .await
    }

    async fn prune(&self, session_id: &str, keep_recent: usize) -> Result<usize> {
        let keep = i64::try_from(keep_recent).unwrap_or(i64::MAX);
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            if count_messages(conn, &session_id)? <= keep.saturating_mul(2) {
                return Ok(0);
            }
            conn.execute(
                "DELETE FROM conversations WHERE session_id = ?1 AND id NOT IN (
                    SELECT id FROM conversations WHERE session_id = ?1
                    ORDER BY id DESC LIMIT ?2
                 )",
                params![session_id, keep],
            )
            .context("Failed to prune session messages")
        })
        .await
    }

    async fn message_count(&self, session_id: &str) -> Result<usize> {
        let session_id = session_id.to_string();
        let count = self
            .with_conn(move |conn| count_messages(conn, &session_id))
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SqliteSessionStore) {
        let tmp = TempDir::new().unwrap();
        let store = SqliteSessionStore::open(&tmp.path().join("paper_writer")).unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn creates_database_file() {
        let (tmp, store) = store();
        assert_eq!(
            store.db_path(),
            tmp.path().join("paper_writer").join("sessions.db")
        );
        assert!(store.db_path().exists());
        assert_eq!(store.name(), "sqlite");
    }

    #[tokio::test]
    async fn save_then_load_round_trip() {
        let (_tmp, store) = store();
        let saved = store
            .save_message("s1", Role::User, "hello there")
            .await
            .unwrap();

        let context = store.load_context("s1", 5).await;
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].id, saved.id);
        assert_eq!(context[0].role, Role::User);
        assert_eq!(context[0].content, "hello there");
        assert_eq!(context[0].timestamp, saved.timestamp);
    }

    #[tokio::test]
    async fn load_context_orders_oldest_first() {
        let (_tmp, store) = store();
        store.save_message("s1", Role::User, "m1").await.unwrap();
        store.save_message("s1", Role::Assistant, "m2").await.unwrap();
        store.save_message("s1", Role::User, "m3").await.unwrap();

        let contents: Vec<String> = store
            .load_context("s1", 5)
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn load_context_keeps_most_recent() {
        let (_tmp, store) = store();
        for i in 1..=10 {
            store
                .save_message("s1", Role::User, &format!("m{i}"))
                .await
                .unwrap();
        }

        let contents: Vec<String> = store
            .load_context("s1", 3)
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m8", "m9", "m10"]);
        assert!(store.load_context("s1", 0).await.is_empty());
    }

    #[tokio::test]
    async fn clear_session_is_idempotent_and_scoped() {
        let (_tmp, store) = store();
        store.save_message("s1", Role::User, "a").await.unwrap();
        store.save_message("s2", Role::User, "b").await.unwrap();

        store.clear_session("s1").await.unwrap();
        store.clear_session("s1").await.unwrap();

        assert!(store.load_context("s1", 5).await.is_empty());
        assert_eq!(store.message_count("s2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn prune_keeps_newest_once_over_threshold() {
        let (_tmp, store) = store();
        for i in 1..=4 {
            store
                .save_message("s1", Role::User, &format!("m{i}"))
                .await
                .unwrap();
        }
        assert_eq!(store.prune("s1", 2).await.unwrap(), 0);

        store.save_message("s1", Role::User, "m5").await.unwrap();
        assert_eq!(store.prune("s1", 2).await.unwrap(), 3);

        let contents: Vec<String> = store
            .load_context("s1", 10)
            .await
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m4", "m5"]);
    }

    #[tokio::test]
    async fn history_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("shopper");
        {
            let store = SqliteSessionStore::open(&dir).unwrap();
            store.save_message("s1", Role::User, "persisted").await.unwrap();
        }
        let reopened = SqliteSessionStore::open(&dir).unwrap();
        let context = reopened.load_context("s1", 5).await;
        assert_eq!(context.len(), 1);
        assert_eq!(context[0].content, "persisted");
    }

    #[tokio::test]
    async fn read_failure_degrades_to_empty_context() {
        let (_tmp, store) = store();
        store.save_message("s1", Role::User, "hello").await.unwrap();
        store
            .conn
            .lock()
            .execute_batch("DROP TABLE conversations")
            .unwrap();

        assert!(store.load_context("s1", 5).await.is_empty());
        assert!(store.message_count("s1").await.is_err());
        assert!(store.save_message("s1", Role::User, "again").await.is_err());
    }
}
