//! SQLite-backed key/value store.

use super::traits::{KeyValueStore, NamespaceUsage, StorageUsage};
use crate::error::{CoreError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Open a SQLite connection with the pragmas every table in this crate expects.
///
/// Creates the parent directory if needed.
pub(crate) fn open_connection(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Io {
                message: format!("Failed to create state directory: {}", e),
                path: Some(parent.to_path_buf()),
                source: Some(e),
            })?;
        }
    }

    let conn = Connection::open(db_path).map_err(|e| CoreError::Database {
        message: format!("Failed to open state database: {}", e),
        source: Some(e),
    })?;

    // WAL lets the CLI read while a long-running process writes
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
        .map_err(|e| CoreError::Database {
            message: format!("Failed to set pragmas: {}", e),
            source: Some(e),
        })?;

    Ok(conn)
}

pub(crate) fn lock_conn(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| CoreError::Database {
        message: format!("Failed to lock database: {}", e),
        source: None,
    })
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Durable key/value store on a single SQLite file.
///
/// Thread-safe via an internal mutex on the connection.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    quota_bytes: Option<u64>,
}

impl SqliteStore {
    /// Open (or create) a store at the specified database path.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = open_connection(db_path.as_ref())?;
        Self::from_connection(conn, None)
    }

    /// Open a store that rejects writes beyond `quota_bytes` of total value size.
    pub fn open_with_quota(db_path: impl AsRef<Path>, quota_bytes: u64) -> Result<Self> {
        let conn = open_connection(db_path.as_ref())?;
        Self::from_connection(conn, Some(quota_bytes))
    }

    /// A private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, None)
    }

    fn from_connection(conn: Connection, quota_bytes: Option<u64>) -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            quota_bytes,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = lock_conn(&self.conn)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );

            CREATE TABLE IF NOT EXISTS kv_namespaces (
                namespace TEXT PRIMARY KEY,
                entry_count INTEGER DEFAULT 0,
                total_size_bytes INTEGER DEFAULT 0,
                last_modified TEXT
            );
            "#,
        )
        .map_err(|e| CoreError::Database {
            message: format!("Failed to initialize storage schema: {}", e),
            source: Some(e),
        })?;

        Ok(())
    }

    /// Refresh the namespace metadata row after a modification.
    fn update_namespace_meta(&self, conn: &Connection, namespace: &str) -> Result<()> {
        let now = format_timestamp(Utc::now());

        let (count, size): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM kv_entries WHERE namespace = ?1",
                params![namespace],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap_or((0, 0));

        conn.execute(
            r#"
            INSERT INTO kv_namespaces (namespace, entry_count, total_size_bytes, last_modified)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(namespace) DO UPDATE SET
                entry_count = ?2,
                total_size_bytes = ?3,
                last_modified = ?4
            "#,
            params![namespace, count, size, now],
        )
        .map_err(|e| CoreError::Database {
            message: format!("Failed to update namespace metadata: {}", e),
            source: Some(e),
        })?;

        Ok(())
    }

    fn check_quota(&self, conn: &Connection, namespace: &str, key: &str, new_size: u64) -> Result<()> {
        let Some(quota) = self.quota_bytes else {
            return Ok(());
        };

        let total: i64 = conn
            .query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM kv_entries", [], |row| {
                row.get(0)
            })?;
        let existing: i64 = conn
            .query_row(
                "SELECT size_bytes FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let used = (total - existing).max(0) as u64;
        if used + new_size > quota {
            return Err(CoreError::QuotaExceeded {
                namespace: namespace.to_string(),
                needed: new_size,
                available: quota.saturating_sub(used),
            });
        }
        Ok(())
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let conn = lock_conn(&self.conn)?;

        conn.query_row(
            "SELECT value FROM kv_entries WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| CoreError::Database {
            message: format!("Failed to read '{}/{}': {}", namespace, key, e),
            source: Some(e),
        })
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let conn = lock_conn(&self.conn)?;
        let size_bytes = value.len() as u64;

        self.check_quota(&conn, namespace, key, size_bytes)?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO kv_entries (namespace, key, value, size_bytes, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![namespace, key, value, size_bytes as i64, format_timestamp(Utc::now())],
        )
        .map_err(|e| CoreError::Database {
            message: format!("Failed to write '{}/{}': {}", namespace, key, e),
            source: Some(e),
        })?;

        self.update_namespace_meta(&conn, namespace)
    }

    fn remove(&self, namespace: &str, key: &str) -> Result<bool> {
        let conn = lock_conn(&self.conn)?;

        let deleted = conn
            .execute(
                "DELETE FROM kv_entries WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
            )
            .map_err(|e| CoreError::Database {
                message: format!("Failed to remove '{}/{}': {}", namespace, key, e),
                source: Some(e),
            })?;

        if deleted > 0 {
            self.update_namespace_meta(&conn, namespace)?;
        }

        Ok(deleted > 0)
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let conn = lock_conn(&self.conn)?;

        let mut stmt = conn.prepare("SELECT key FROM kv_entries WHERE namespace = ?1")?;
        let keys = stmt
            .query_map(params![namespace], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(keys)
    }

    fn clear(&self, namespace: &str) -> Result<usize> {
        let conn = lock_conn(&self.conn)?;

        let deleted = conn
            .execute("DELETE FROM kv_entries WHERE namespace = ?1", params![namespace])
            .map_err(|e| CoreError::Database {
                message: format!("Failed to clear namespace: {}", e),
                source: Some(e),
            })?;

        conn.execute(
            "DELETE FROM kv_namespaces WHERE namespace = ?1",
            params![namespace],
        )
        .ok();

        debug!("Cleared {} entries from namespace '{}'", deleted, namespace);

        Ok(deleted)
    }

    fn usage(&self) -> Result<StorageUsage> {
        let conn = lock_conn(&self.conn)?;

        let (total_entries, total_size): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM kv_entries",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap_or((0, 0));

        let mut stmt = conn.prepare(
            r#"
            SELECT namespace, entry_count, total_size_bytes, last_modified
            FROM kv_namespaces
            ORDER BY namespace
            "#,
        )?;

        let namespaces: Vec<NamespaceUsage> = stmt
            .query_map([], |row| {
                let entry_count: i64 = row.get(1)?;
                let total_size_bytes: i64 = row.get(2)?;
                let last_modified: Option<String> = row.get(3)?;
                Ok(NamespaceUsage {
                    namespace: row.get(0)?,
                    entry_count: entry_count as usize,
                    total_size_bytes: total_size_bytes as u64,
                    last_modified: last_modified.as_deref().and_then(parse_timestamp),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        Ok(StorageUsage {
            total_entries: total_entries as usize,
            total_size_bytes: total_size as u64,
            quota_bytes: self.quota_bytes,
            namespaces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, SqliteStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::open(temp_dir.path().join("state.sqlite")).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_set_and_get() {
        let (_temp, store) = create_test_store();

        store.set("cache", "key1", "hello world").unwrap();

        assert_eq!(store.get("cache", "key1").unwrap().as_deref(), Some("hello world"));
        assert_eq!(store.get("cache", "missing").unwrap(), None);
    }

    #[test]
    fn test_namespace_isolation() {
        let (_temp, store) = create_test_store();

        store.set("cache", "shared", "v1").unwrap();
        store.set("offline", "shared", "v2").unwrap();

        assert_eq!(store.get("cache", "shared").unwrap().as_deref(), Some("v1"));
        assert_eq!(store.get("offline", "shared").unwrap().as_deref(), Some("v2"));

        assert_eq!(store.clear("cache").unwrap(), 1);
        assert_eq!(store.get("offline", "shared").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn test_remove_and_keys() {
        let (_temp, store) = create_test_store();

        store.set("cache", "a", "1").unwrap();
        store.set("cache", "b", "2").unwrap();

        assert!(store.remove("cache", "a").unwrap());
        assert!(!store.remove("cache", "a").unwrap());

        assert_eq!(store.keys("cache").unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn test_persists_across_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("state.sqlite");

        SqliteStore::open(&path).unwrap().set("cache", "k", "v").unwrap();

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.get("cache", "k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_quota_rejects_overflow() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteStore::open_with_quota(temp_dir.path().join("q.sqlite"), 10).unwrap();

        store.set("cache", "a", "12345").unwrap();
        // Overwriting the same key only counts the replacement size
        store.set("cache", "a", "1234567890").unwrap();

        let err = store.set("cache", "b", "x").unwrap_err();
        assert!(matches!(err, CoreError::QuotaExceeded { available: 0, .. }));
    }

    #[test]
    fn test_usage() {
        let (_temp, store) = create_test_store();

        store.set("cache", "k1", "12345").unwrap();
        store.set("cache", "k2", "67890").unwrap();
        store.set("offline", "k1", "abcde").unwrap();

        let usage = store.usage().unwrap();
        assert_eq!(usage.total_entries, 3);
        assert_eq!(usage.total_size_bytes, 15);
        assert_eq!(usage.namespaces.len(), 2);
        assert_eq!(usage.quota_bytes, None);
    }
}
