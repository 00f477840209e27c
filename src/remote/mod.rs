//! Hosted document store: schemaless JSON documents grouped in collections.
//!
//! `SqliteDocumentStore` is what `umuw serve` hosts; `HttpDocumentStore` is
//! the client the shim uses to reach it.

mod http;
mod sqlite;

use std::cmp::Ordering;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StorageError;

pub use self::http::HttpDocumentStore;
pub use self::sqlite::SqliteDocumentStore;

pub const COLLECTION_POSTS: &str = "posts";
pub const COLLECTION_USERS: &str = "users";
pub const COLLECTION_PENDING_USERS: &str = "pendingUsers";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }
}

/// Equality filter on a top-level field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            descending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.filters
            .iter()
            .all(|f| doc.field(&f.field) == Some(&f.value))
    }

    /// Filter, order and truncate documents of this query's collection.
    pub fn apply(&self, docs: Vec<Document>) -> Vec<Document> {
        let mut docs: Vec<Document> = docs.into_iter().filter(|d| self.matches(d)).collect();
        if let Some(order) = &self.order_by {
            docs.sort_by(|a, b| {
                let ord = compare_values(a.field(&order.field), b.field(&order.field));
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(limit) = self.limit {
            docs.truncate(limit);
        }
        docs
    }
}

/// Total order over optional JSON scalars: missing < null < bool < number < string.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Field-level mutation applied by `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum UpdateOp {
    Set { field: String, value: Value },
    /// Append each value not already present in the array field.
    ArrayUnion { field: String, values: Vec<Value> },
}

impl UpdateOp {
    pub fn apply(&self, data: &mut Value) -> Result<(), StorageError> {
        let object = as_object(data)?;
        match self {
            UpdateOp::Set { field, value } => {
                object.insert(field.clone(), value.clone());
            }
            UpdateOp::ArrayUnion { field, values } => {
                let entry = object
                    .entry(field.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if entry.is_null() {
                    *entry = Value::Array(Vec::new());
                }
                let array = entry.as_array_mut().ok_or_else(|| {
                    StorageError::Conflict(format!("field {} is not an array", field))
                })?;
                for value in values {
                    if !array.contains(value) {
                        array.push(value.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

fn as_object(data: &mut Value) -> Result<&mut Map<String, Value>, StorageError> {
    data.as_object_mut()
        .ok_or_else(|| StorageError::Conflict("document body is not an object".into()))
}

/// One step of an atomic batched write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum BatchOp {
    Set {
        collection: String,
        id: String,
        data: Value,
    },
    Update {
        collection: String,
        id: String,
        ops: Vec<UpdateOp>,
    },
    Delete {
        collection: String,
        id: String,
    },
    /// Abort the batch with a conflict unless the document exists.
    AssertExists { collection: String, id: String },
    /// Abort the batch with a conflict if the document exists.
    AssertAbsent { collection: String, id: String },
}

impl BatchOp {
    pub fn collection(&self) -> &str {
        match self {
            BatchOp::Set { collection, .. }
            | BatchOp::Update { collection, .. }
            | BatchOp::Delete { collection, .. }
            | BatchOp::AssertExists { collection, .. }
            | BatchOp::AssertAbsent { collection, .. } => collection,
        }
    }
}

pub type SnapshotStream =
    Pin<Box<dyn Stream<Item = Result<Vec<Document>, StorageError>> + Send + 'static>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a document under a store-assigned id.
    async fn insert(&self, collection: &str, data: Value) -> Result<String, StorageError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError>;

    /// Apply field operations atomically. Missing documents are `NotFound`.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        ops: Vec<UpdateOp>,
    ) -> Result<(), StorageError>;

    /// Idempotent delete.
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StorageError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StorageError>;

    /// Live query: yields the current result, then again after every change
    /// to the collection, until the stream is dropped.
    async fn subscribe(&self, query: Query) -> Result<SnapshotStream, StorageError>;

    /// Apply every op or none of them.
    async fn commit(&self, batch: Vec<BatchOp>) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, data: Value) -> Document {
        Document {
            id: id.to_string(),
            data,
        }
    }

    #[test]
    fn query_filters_and_orders_descending() {
        let docs = vec![
            doc("a", json!({"page": "daily", "date": 10})),
            doc("b", json!({"page": "music", "date": 50})),
            doc("c", json!({"page": "daily", "date": 30})),
        ];
        let query = Query::collection("posts")
            .where_eq("page", "daily")
            .order_by("date", true);
        let ids: Vec<String> = query.apply(docs).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[test]
    fn query_limit_truncates_after_ordering() {
        let docs = vec![
            doc("a", json!({"n": 1})),
            doc("b", json!({"n": 3})),
            doc("c", json!({"n": 2})),
        ];
        let query = Query::collection("x").order_by("n", false).limit(2);
        let ids: Vec<String> = query.apply(docs).into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn missing_fields_sort_first() {
        assert_eq!(
            compare_values(None, Some(&json!(1))),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn array_union_skips_existing_values() {
        let mut data = json!({"comments": [{"text": "one"}]});
        UpdateOp::ArrayUnion {
            field: "comments".into(),
            values: vec![json!({"text": "one"}), json!({"text": "two"})],
        }
        .apply(&mut data)
        .unwrap();
        assert_eq!(data["comments"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn array_union_creates_missing_field() {
        let mut data = json!({"page": "daily"});
        UpdateOp::ArrayUnion {
            field: "comments".into(),
            values: vec![json!("x")],
        }
        .apply(&mut data)
        .unwrap();
        assert_eq!(data["comments"], json!(["x"]));
    }

    #[test]
    fn array_union_on_scalar_conflicts() {
        let mut data = json!({"comments": 3});
        let result = UpdateOp::ArrayUnion {
            field: "comments".into(),
            values: vec![json!("x")],
        }
        .apply(&mut data);
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[test]
    fn batch_op_wire_format_is_tagged() {
        let op = BatchOp::AssertAbsent {
            collection: "users".into(),
            id: "alice".into(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "assertAbsent");
        assert_eq!(op.collection(), "users");
    }
}
