//! Writes taken on the local path that still have to reach the remote store.

use serde::{Deserialize, Serialize};

use crate::db::models::{feed_order, Comment, PendingRegistration, Post};
use crate::error::StorageError;
use crate::local::{LocalStore, KEY_OUTBOX};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PendingWrite {
    #[serde(rename_all = "camelCase")]
    CreatePost { post: Post },
    #[serde(rename_all = "camelCase")]
    AppendComment {
        page: String,
        post_id: String,
        comment: Comment,
    },
    #[serde(rename_all = "camelCase")]
    Register { registration: PendingRegistration },
}

impl PendingWrite {
    /// True when the write creates or targets the given post.
    fn concerns_post(&self, id: &str) -> bool {
        match self {
            PendingWrite::CreatePost { post } => post.id() == Some(id),
            PendingWrite::AppendComment { post_id, .. } => post_id == id,
            PendingWrite::Register { .. } => false,
        }
    }

    pub fn repoint(&mut self, from: &str, to: &str) {
        match self {
            PendingWrite::CreatePost { post } if post.id() == Some(from) => {
                post.id = Some(to.to_string());
            }
            PendingWrite::AppendComment { post_id, .. } if post_id == from => {
                *post_id = to.to_string();
            }
            _ => {}
        }
    }
}

/// FIFO queue stored under the local `outbox` key.
#[derive(Clone)]
pub struct Outbox {
    store: LocalStore,
}

impl Outbox {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn pending(&self) -> Vec<PendingWrite> {
        self.store.read(KEY_OUTBOX).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    pub fn push(&self, write: PendingWrite) -> Result<(), StorageError> {
        self.store.transact(|txn| {
            let mut writes: Vec<PendingWrite> = txn.read(KEY_OUTBOX).unwrap_or_default();
            writes.push(write);
            txn.write(KEY_OUTBOX, &writes)
        })
    }

    /// Drop a write that has been delivered, optionally moving later writes
    /// from a local post id to the id the remote assigned.
    pub fn complete(
        &self,
        write: &PendingWrite,
        repoint: Option<(&str, &str)>,
    ) -> Result<(), StorageError> {
        self.store.transact(|txn| {
            let mut writes: Vec<PendingWrite> = txn.read(KEY_OUTBOX).unwrap_or_default();
            if let Some(index) = writes.iter().position(|w| w == write) {
                writes.remove(index);
            }
            if let Some((from, to)) = repoint {
                for w in writes.iter_mut() {
                    w.repoint(from, to);
                }
            }
            txn.write(KEY_OUTBOX, &writes)
        })
    }

    /// Forget everything queued for a deleted post. Returns whether anything
    /// was queued.
    pub fn discard_post(&self, post_id: &str) -> Result<bool, StorageError> {
        self.store.transact(|txn| {
            let mut writes: Vec<PendingWrite> = txn.read(KEY_OUTBOX).unwrap_or_default();
            let before = writes.len();
            writes.retain(|w| !w.concerns_post(post_id));
            if writes.len() == before {
                return Ok(false);
            }
            txn.write(KEY_OUTBOX, &writes)?;
            Ok(true)
        })
    }
}

/// Lay queued writes over a remote snapshot so nothing the user wrote while
/// offline disappears from the feed before it has been delivered.
pub fn overlay(page: &str, mut posts: Vec<Post>, pending: &[PendingWrite]) -> Vec<Post> {
    for write in pending {
        match write {
            PendingWrite::CreatePost { post } if post.page == page => {
                if !posts.iter().any(|p| p.id == post.id) {
                    posts.push(post.clone());
                }
            }
            PendingWrite::AppendComment {
                page: target_page,
                post_id,
                comment,
            } if target_page == page => {
                if let Some(target) = posts.iter_mut().find(|p| p.id() == Some(post_id.as_str())) {
                    if !target.comments.contains(comment) {
                        target.comments.push(comment.clone());
                    }
                }
            }
            _ => {}
        }
    }
    feed_order(page, posts)
}
