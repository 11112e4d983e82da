//! Session management: durable per-agent conversation logs.

pub mod in_memory;
pub mod sqlite;
pub mod traits;

pub use in_memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;
pub use traits::{Message, Role, SessionStore};

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::MemoryConfig;

/// Storage backend for every agent namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// `<root>/<agent>/sessions.db`
    Sqlite { root: PathBuf },
    Memory,
}

impl StoreBackend {
    pub fn from_config(config: &MemoryConfig, workspace_dir: &Path) -> Self {
        match config.backend.trim().to_ascii_lowercase().as_str() {
            "memory" => Self::Memory,
            _ => Self::Sqlite {
                root: workspace_dir.join("memory"),
            },
        }
    }
}

/// Hands out one store per agent namespace, created on first use and cached.
pub struct SessionStores {
    backend: StoreBackend,
    stores: Mutex<HashMap<String, Arc<dyn SessionStore>>>,
}

impl SessionStores {
    pub fn new(backend: StoreBackend) -> Self {
        Self {
            backend,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreBackend::Memory)
    }

    /// Use `store` for `agent` instead of opening one from the backend.
    pub fn with_store(self, agent: &str, store: Arc<dyn SessionStore>) -> Self {
        self.stores.lock().insert(agent.to_string(), store);
        self
    }

    /// The store for `agent`, opening it if this is the first request.
    pub fn for_agent(&self, agent: &str) -> Result<Arc<dyn SessionStore>> {
        if let Some(store) = self.stores.lock().get(agent) {
            return Ok(Arc::clone(store));
        }

        // Opened without the map lock held; a concurrent opener may win the insert.
        let opened: Arc<dyn SessionStore> = match &self.backend {
            StoreBackend::Sqlite { root } => Arc::new(SqliteSessionStore::open(&root.join(agent))?),
            StoreBackend::Memory => Arc::new(InMemorySessionStore::new()),
        };

        let mut stores = self.stores.lock();
        let store = stores
            .entry(agent.to_string())
            .or_insert_with(|| {
                tracing::debug!(agent, backend = opened.name(), "Opened session store");
                Arc::clone(&opened)
            });
        Ok(Arc::clone(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn same_agent_shares_store() {
        let stores = SessionStores::in_memory();
        let a = stores.for_agent("paper_writer").unwrap();
        a.save_message("s1", Role::User, "hi").await.unwrap();

        let again = stores.for_agent("paper_writer").unwrap();
        assert_eq!(again.message_count("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn agents_are_isolated() {
        let stores = SessionStores::in_memory();
        stores
            .for_agent("paper_writer")
            .unwrap()
            .save_message("s1", Role::User, "hi")
            .await
            .unwrap();

        let shopper = stores.for_agent("shopper").unwrap();
        assert_eq!(shopper.message_count("s1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_store_is_used_for_its_agent() {
        let injected = Arc::new(InMemorySessionStore::new());
        injected.save_message("s1", Role::User, "seeded").await.unwrap();
        let stores = SessionStores::in_memory()
            .with_store("shopper", Arc::clone(&injected) as Arc<dyn SessionStore>);

        let shopper = stores.for_agent("shopper").unwrap();
        assert_eq!(shopper.message_count("s1").await.unwrap(), 1);
        let writer = stores.for_agent("paper_writer").unwrap();
        assert_eq!(writer.message_count("s1").await.unwrap(), 0);
    }

    #[test]
    fn sqlite_backend_creates_file_per_agent() {
        let tmp = TempDir::new().unwrap();
        let stores = SessionStores::new(StoreBackend::Sqlite {
            root: tmp.path().to_path_buf(),
        });
        stores.for_agent("paper_writer").unwrap();
        stores.for_agent("shopper").unwrap();

        assert!(tmp.path().join("paper_writer/sessions.db").exists());
        assert!(tmp.path().join("shopper/sessions.db").exists());
    }

    #[test]
    fn backend_from_config() {
        let mut config = MemoryConfig::default();
        assert_eq!(
            StoreBackend::from_config(&config, Path::new("/ws")),
            StoreBackend::Sqlite {
                root: PathBuf::from("/ws/memory")
            }
        );
        config.backend = "Memory".into();
        assert_eq!(
            StoreBackend::from_config(&config, Path::new("/ws")),
            StoreBackend::Memory
        );
    }
}
