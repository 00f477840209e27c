use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{BackendKind, PostStream, StorageBackend};
use crate::db::models::{Comment, PendingRegistration, Post, User};
use crate::error::StorageError;
use crate::remote::{
    BatchOp, Document, DocumentStore, Query, UpdateOp, COLLECTION_PENDING_USERS, COLLECTION_POSTS,
    COLLECTION_USERS,
};
use crate::storage::{BlobStore, MediaUpload};

/// Backend over a hosted document store.
///
/// Posts live in one `posts` collection filtered by `page`; users and pending
/// registrations are keyed by username so uniqueness is a document-id check.
pub struct RemoteBackend {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
}

impl RemoteBackend {
    pub fn new(documents: Arc<dyn DocumentStore>, blobs: Arc<dyn BlobStore>) -> Self {
        Self { documents, blobs }
    }

    fn feed_query(page: &str) -> Query {
        Query::collection(COLLECTION_POSTS)
            .where_eq("page", page)
            .order_by("date", true)
    }
}

fn to_post(doc: Document) -> Option<Post> {
    let id = doc.id;
    match serde_json::from_value::<Post>(doc.data) {
        Ok(mut post) => {
            post.id = Some(id);
            Some(post)
        }
        Err(e) => {
            tracing::warn!("Skipping malformed post {}: {}", id, e);
            None
        }
    }
}

fn to_posts(docs: Vec<Document>) -> Vec<Post> {
    docs.into_iter().filter_map(to_post).collect()
}

fn decode<T: DeserializeOwned>(doc: Document) -> Option<T> {
    match serde_json::from_value(doc.data) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("Skipping malformed document {}: {}", doc.id, e);
            None
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, StorageError> {
    Ok(serde_json::to_value(value)?)
}

/// A failed precondition on a pending entry means another decision won.
fn pending_gone(username: &str) -> impl FnOnce(StorageError) -> StorageError + '_ {
    move |e| match e {
        StorageError::Conflict(_) => StorageError::not_found(COLLECTION_PENDING_USERS, username),
        other => other,
    }
}

#[async_trait]
impl StorageBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn list_posts(&self, page: &str) -> Result<Vec<Post>, StorageError> {
        let docs = self.documents.query(&Self::feed_query(page)).await?;
        Ok(to_posts(docs))
    }

    async fn subscribe_posts(&self, page: &str) -> Result<PostStream, StorageError> {
        let snapshots = self.documents.subscribe(Self::feed_query(page)).await?;
        Ok(Box::pin(snapshots.map(|snapshot| snapshot.map(to_posts))))
    }

    async fn create_post(&self, mut post: Post) -> Result<Post, StorageError> {
        post.id = None;
        let id = self
            .documents
            .insert(COLLECTION_POSTS, encode(&post)?)
            .await?;
        post.id = Some(id);
        Ok(post)
    }

    async fn append_comment(
        &self,
        _page: &str,
        post_id: &str,
        comment: Comment,
    ) -> Result<(), StorageError> {
        let op = UpdateOp::ArrayUnion {
            field: "comments".into(),
            values: vec![encode(&comment)?],
        };
        self.documents
            .update(COLLECTION_POSTS, post_id, vec![op])
            .await
    }

    async fn delete_post(&self, _page: &str, post_id: &str) -> Result<(), StorageError> {
        self.documents.delete(COLLECTION_POSTS, post_id).await
    }

    async fn store_media(&self, upload: &MediaUpload) -> Result<String, StorageError> {
        self.blobs.put(upload).await
    }

    async fn find_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        let doc = self.documents.get(COLLECTION_USERS, username).await?;
        Ok(doc.and_then(decode))
    }

    async fn find_pending(
        &self,
        username: &str,
    ) -> Result<Option<PendingRegistration>, StorageError> {
        let doc = self
            .documents
            .get(COLLECTION_PENDING_USERS, username)
            .await?;
        Ok(doc.and_then(decode))
    }

    async fn list_users(&self) -> Result<Vec<User>, StorageError> {
        let docs = self
            .documents
            .query(&Query::collection(COLLECTION_USERS).order_by("username", false))
            .await?;
        Ok(docs.into_iter().filter_map(decode).collect())
    }

    async fn list_pending(&self) -> Result<Vec<PendingRegistration>, StorageError> {
        let docs = self
            .documents
            .query(&Query::collection(COLLECTION_PENDING_USERS).order_by("requestedAt", false))
            .await?;
        Ok(docs.into_iter().filter_map(decode).collect())
    }

    async fn add_pending(&self, registration: PendingRegistration) -> Result<(), StorageError> {
        let username = registration.username.clone();
        self.documents
            .commit(vec![
                BatchOp::AssertAbsent {
                    collection: COLLECTION_USERS.into(),
                    id: username.clone(),
                },
                BatchOp::AssertAbsent {
                    collection: COLLECTION_PENDING_USERS.into(),
                    id: username.clone(),
                },
                BatchOp::Set {
                    collection: COLLECTION_PENDING_USERS.into(),
                    id: username,
                    data: encode(&registration)?,
                },
            ])
            .await
    }

    async fn approve(&self, username: &str) -> Result<User, StorageError> {
        let pending = self
            .find_pending(username)
            .await?
            .ok_or_else(|| StorageError::not_found(COLLECTION_PENDING_USERS, username))?;
        let user = pending.approve();

        self.documents
            .commit(vec![
                BatchOp::AssertExists {
                    collection: COLLECTION_PENDING_USERS.into(),
                    id: username.into(),
                },
                BatchOp::Set {
                    collection: COLLECTION_USERS.into(),
                    id: username.into(),
                    data: encode(&user)?,
                },
                BatchOp::Delete {
                    collection: COLLECTION_PENDING_USERS.into(),
                    id: username.into(),
                },
            ])
            .await
            .map_err(pending_gone(username))?;
        Ok(user)
    }

    async fn reject(&self, username: &str) -> Result<(), StorageError> {
        self.documents
            .commit(vec![
                BatchOp::AssertExists {
                    collection: COLLECTION_PENDING_USERS.into(),
                    id: username.into(),
                },
                BatchOp::Delete {
                    collection: COLLECTION_PENDING_USERS.into(),
                    id: username.into(),
                },
            ])
            .await
            .map_err(pending_gone(username))
    }

    async fn seed_user(&self, user: User) -> Result<(), StorageError> {
        let result = self
            .documents
            .commit(vec![
                BatchOp::AssertAbsent {
                    collection: COLLECTION_USERS.into(),
                    id: user.username.clone(),
                },
                BatchOp::Set {
                    collection: COLLECTION_USERS.into(),
                    id: user.username.clone(),
                    data: encode(&user)?,
                },
            ])
            .await;
        match result {
            Err(StorageError::Conflict(_)) => Ok(()),
            other => other,
        }
    }
}
