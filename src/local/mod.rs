//! Device-scoped key/value storage.
//!
//! Values are JSON strings in the `kv` table. Reads are forgiving: a row that
//! cannot be read or parsed is treated as absent so a corrupted entry never
//! blocks the rest of the application.

use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StorageError;
use crate::state::DbPool;

pub const KEY_USERS: &str = "users";
pub const KEY_PENDING_USERS: &str = "pendingUsers";
pub const KEY_CURRENT_USER: &str = "currentUser";
pub const KEY_OUTBOX: &str = "outbox";

/// Key holding the feed of one page.
pub fn posts_key(page: &str) -> String {
    format!("posts_{}", page)
}

#[derive(Clone)]
pub struct LocalStore {
    pool: DbPool,
}

impl LocalStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    /// Read and decode a value, treating any failure as absence.
    pub fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.get(key) {
            Ok(raw) => decode(key, raw),
            Err(e) => {
                tracing::warn!("Local read of {} failed, treating as empty: {}", key, e);
                None
            }
        }
    }

    pub fn write<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        self.set(key, &json)
    }

    /// Run a read-modify-write over one or more keys in a single
    /// `BEGIN IMMEDIATE` transaction. Nothing is written if `f` fails.
    pub fn transact<R>(
        &self,
        f: impl FnOnce(&mut LocalTxn<'_>) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut txn = LocalTxn { tx: &tx };
        let result = f(&mut txn)?;
        tx.commit()?;
        Ok(result)
    }
}

pub struct LocalTxn<'a> {
    tx: &'a Transaction<'a>,
}

impl LocalTxn<'_> {
    pub fn read<T: DeserializeOwned>(&mut self, key: &str) -> Option<T> {
        let raw: Result<Option<String>, rusqlite::Error> = self
            .tx
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional();
        match raw {
            Ok(raw) => decode(key, raw),
            Err(e) => {
                tracing::warn!("Local read of {} failed, treating as empty: {}", key, e);
                None
            }
        }
    }

    pub fn write<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), StorageError> {
        let json = serde_json::to_string(value)?;
        self.tx.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               updated_at = excluded.updated_at",
            params![key, json],
        )?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: Option<String>) -> Option<T> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Discarding unreadable local value {}: {}", key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn store() -> LocalStore {
        let pool = db::memory_pool().unwrap();
        db::run_migrations(&pool).unwrap();
        LocalStore::new(pool)
    }

    #[test]
    fn set_get_delete_round() {
        let store = store();
        assert_eq!(store.get("k").unwrap(), None);
        store.set("k", "\"v1\"").unwrap();
        store.set("k", "\"v2\"").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("\"v2\""));
        store.delete("k").unwrap();
        assert_eq!(store.get("k").unwrap(), None);
    }

    #[test]
    fn corrupt_value_reads_as_absent() {
        let store = store();
        store.set("posts_daily", "{not json").unwrap();
        let posts: Option<Vec<String>> = store.read("posts_daily");
        assert!(posts.is_none());
    }

    #[test]
    fn failed_transaction_writes_nothing() {
        let store = store();
        store.write("a", &1u32).unwrap();
        let result: Result<(), StorageError> = store.transact(|txn| {
            txn.write("a", &2u32)?;
            txn.write("b", &3u32)?;
            Err(StorageError::Conflict("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.read::<u32>("a"), Some(1));
        assert_eq!(store.read::<u32>("b"), None);
    }

    #[test]
    fn transaction_sees_its_own_writes() {
        let store = store();
        let seen = store
            .transact(|txn| {
                txn.write("counter", &41u32)?;
                let n: u32 = txn.read("counter").unwrap_or(0);
                txn.write("counter", &(n + 1))?;
                Ok(n + 1)
            })
            .unwrap();
        assert_eq!(seen, 42);
        assert_eq!(store.read::<u32>("counter"), Some(42));
    }

    #[test]
    fn posts_key_is_page_scoped() {
        assert_eq!(posts_key("daily"), "posts_daily");
    }
}
