use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use super::{BatchOp, Document, DocumentStore, Query, SnapshotStream, UpdateOp};
use crate::error::StorageError;
use crate::state::DbPool;

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Document store over the `documents` table. Every committed write
/// broadcasts the touched collection so live queries can re-run.
#[derive(Clone)]
pub struct SqliteDocumentStore {
    pool: DbPool,
    changes: broadcast::Sender<String>,
}

impl SqliteDocumentStore {
    pub fn new(pool: DbPool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { pool, changes }
    }

    fn notify(&self, collection: &str) {
        // No receivers just means nobody is watching.
        let _ = self.changes.send(collection.to_string());
    }

    fn load_collection(&self, collection: &str) -> Result<Vec<Document>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, body FROM documents WHERE collection = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![collection], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut docs = Vec::with_capacity(rows.len());
        for (id, body) in rows {
            match serde_json::from_str(&body) {
                Ok(data) => docs.push(Document { id, data }),
                Err(e) => tracing::warn!("Skipping unreadable document {}/{}: {}", collection, id, e),
            }
        }
        Ok(docs)
    }

    fn run_query(&self, query: &Query) -> Result<Vec<Document>, StorageError> {
        let docs = self.load_collection(&query.collection)?;
        Ok(query.apply(docs))
    }
}

fn read_body(conn: &Connection, collection: &str, id: &str) -> Result<Option<Value>, StorageError> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    match body {
        Some(body) => Ok(Some(serde_json::from_str(&body)?)),
        None => Ok(None),
    }
}

fn write_body(conn: &Connection, collection: &str, id: &str, data: &Value) -> Result<(), StorageError> {
    let body = serde_json::to_string(data)?;
    conn.execute(
        "INSERT INTO documents (collection, id, body) VALUES (?1, ?2, ?3)
         ON CONFLICT(collection, id) DO UPDATE SET
           body = excluded.body,
           updated_at = datetime('now')",
        params![collection, id, body],
    )?;
    Ok(())
}

fn apply_update(
    conn: &Connection,
    collection: &str,
    id: &str,
    ops: &[UpdateOp],
) -> Result<(), StorageError> {
    let mut data =
        read_body(conn, collection, id)?.ok_or_else(|| StorageError::not_found(collection, id))?;
    for op in ops {
        op.apply(&mut data)?;
    }
    write_body(conn, collection, id, &data)
}

fn exists(conn: &Connection, collection: &str, id: &str) -> Result<bool, StorageError> {
    let found: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM documents WHERE collection = ?1 AND id = ?2",
        params![collection, id],
        |row| row.get(0),
    )?;
    Ok(found)
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn insert(&self, collection: &str, data: Value) -> Result<String, StorageError> {
        if !data.is_object() {
            return Err(StorageError::Conflict("document body must be an object".into()));
        }
        let id = uuid::Uuid::now_v7().to_string();
        {
            let conn = self.pool.get()?;
            write_body(&conn, collection, &id, &data)?;
        }
        self.notify(collection);
        Ok(id)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError> {
        let conn = self.pool.get()?;
        let data = read_body(&conn, collection, id)?;
        Ok(data.map(|data| Document {
            id: id.to_string(),
            data,
        }))
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        ops: Vec<UpdateOp>,
    ) -> Result<(), StorageError> {
        {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            apply_update(&tx, collection, id, &ops)?;
            tx.commit()?;
        }
        self.notify(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError> {
        let removed = {
            let conn = self.pool.get()?;
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )?
        };
        if removed == 0 {
            return Err(StorageError::not_found(collection, id));
        }
        self.notify(collection);
        Ok(())
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StorageError> {
        self.run_query(query)
    }

    async fn subscribe(&self, query: Query) -> Result<SnapshotStream, StorageError> {
        let mut changes = self.changes.subscribe();
        let initial = self.run_query(&query)?;
        let store = self.clone();
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(collection) if collection != query.collection => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let snapshot = store.run_query(&query);
                        let failed = snapshot.is_err();
                        if tx.send(snapshot).await.is_err() || failed {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn commit(&self, batch: Vec<BatchOp>) -> Result<(), StorageError> {
        {
            let mut conn = self.pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for op in &batch {
                match op {
                    BatchOp::Set {
                        collection,
                        id,
                        data,
                    } => write_body(&tx, collection, id, data)?,
                    BatchOp::Update {
                        collection,
                        id,
                        ops,
                    } => apply_update(&tx, collection, id, ops)?,
                    BatchOp::Delete { collection, id } => {
                        tx.execute(
                            "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                            params![collection, id],
                        )?;
                    }
                    BatchOp::AssertExists { collection, id } => {
                        if !exists(&tx, collection, id)? {
                            return Err(StorageError::Conflict(format!(
                                "{}/{} does not exist",
                                collection, id
                            )));
                        }
                    }
                    BatchOp::AssertAbsent { collection, id } => {
                        if exists(&tx, collection, id)? {
                            return Err(StorageError::Conflict(format!(
                                "{}/{} already exists",
                                collection, id
                            )));
                        }
                    }
                }
            }
            tx.commit()?;
        }

        let mut touched: Vec<&str> = batch.iter().map(|op| op.collection()).collect();
        touched.sort_unstable();
        touched.dedup();
        for collection in touched {
            self.notify(collection);
        }
        Ok(())
    }
}
