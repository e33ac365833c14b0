use anyhow::anyhow;
use rusqlite::{Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// SQLite-backed key-value store for plugin state.
///
/// Values are JSON documents addressed by `(namespace, key)`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(database_url: &str) -> anyhow::Result<Self> {
        if let Some(parent) = std::path::Path::new(database_url).parent() {
            if !parent.as_os_str().is_empty() && database_url != ":memory:" {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(database_url)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> anyhow::Result<Self> {
        let db = Self::new(":memory:")?;
        db.execute_init()?;
        Ok(db)
    }

    pub fn execute_init(&self) -> anyhow::Result<()> {
        info!("Database: Initializing schema...");
        let sql = "
            CREATE TABLE IF NOT EXISTS plugin_state (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at DATETIME DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (namespace, key)
            );
        ";
        let conn = self.lock()?;
        conn.execute_batch(sql)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    /// Runs synchronous database work on the blocking thread pool.
    pub async fn run_blocking<F, R>(&self, f: F) -> anyhow::Result<R>
    where
        F: FnOnce(&Database) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    pub fn get_value(&self, namespace: &str, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM plugin_state WHERE namespace = ?1 AND key = ?2",
                (namespace, key),
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_value(&self, namespace: &str, key: &str, value: &str) -> anyhow::Result<()> {
        self.set_values(namespace, &[(key, value.to_string())])
    }

    /// Writes several keys of one namespace in a single transaction.
    pub fn set_values(&self, namespace: &str, entries: &[(&str, String)]) -> anyhow::Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for (key, value) in entries {
            tx.execute(
                "INSERT INTO plugin_state (namespace, key, value, updated_at)
                 VALUES (?1, ?2, ?3, CURRENT_TIMESTAMP)
                 ON CONFLICT(namespace, key) DO UPDATE SET value = ?3, updated_at = CURRENT_TIMESTAMP",
                (namespace, *key, value.as_str()),
            )?;
        }
        tx.commit()?;
        debug!(
            "Database: Wrote {} key(s) in namespace {}",
            entries.len(),
            namespace
        );
        Ok(())
    }

    pub fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> anyhow::Result<Option<T>> {
        match self.get_value(namespace, key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn set_json<T: serde::Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> anyhow::Result<()> {
        self.set_value(namespace, key, &serde_json::to_string(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_init_and_roundtrip() {
        let db = Database::in_memory().unwrap();

        assert_eq!(db.get_value("ns", "missing").unwrap(), None);

        db.set_value("ns", "key", "first").unwrap();
        db.set_value("ns", "key", "second").unwrap();
        assert_eq!(db.get_value("ns", "key").unwrap().as_deref(), Some("second"));

        // Namespaces do not leak into each other
        assert_eq!(db.get_value("other", "key").unwrap(), None);
    }

    #[test]
    fn test_set_values_is_transactional_per_call() {
        let db = Database::in_memory().unwrap();
        db.set_values("ns", &[("a", "1".to_string()), ("b", "2".to_string())])
            .unwrap();

        assert_eq!(db.get_value("ns", "a").unwrap().as_deref(), Some("1"));
        assert_eq!(db.get_value("ns", "b").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_json_helpers() {
        let db = Database::in_memory().unwrap();
        db.set_json("ns", "channels", &vec![1u64, 2, 3]).unwrap();
        let channels: Vec<u64> = db.get_json("ns", "channels").unwrap().unwrap();
        assert_eq!(channels, vec![1, 2, 3]);

        let missing: Option<Vec<u64>> = db.get_json("ns", "nothing").unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let db = Database::in_memory().unwrap();
        db.run_blocking(|db| db.set_value("ns", "k", "v")).await.unwrap();
        let value = db
            .run_blocking(|db| db.get_value("ns", "k"))
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("v"));
    }
}
