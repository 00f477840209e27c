//! The two places data can live, behind one capability set.

mod local;
mod remote;

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::db::models::{Comment, PendingRegistration, Post, User};
use crate::error::StorageError;
use crate::storage::MediaUpload;

pub use self::local::LocalBackend;
pub use self::remote::RemoteBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Remote,
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Remote => write!(f, "remote"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

pub type PostStream = Pin<Box<dyn Stream<Item = Result<Vec<Post>, StorageError>> + Send + 'static>>;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Posts of one page, newest first, each with a comment list.
    async fn list_posts(&self, page: &str) -> Result<Vec<Post>, StorageError>;

    /// Live feed of one page; a fresh list after every change.
    async fn subscribe_posts(&self, page: &str) -> Result<PostStream, StorageError>;

    /// Persist a post, returning it with its assigned id.
    async fn create_post(&self, post: Post) -> Result<Post, StorageError>;

    /// Append to a post's comments without touching existing entries.
    async fn append_comment(
        &self,
        page: &str,
        post_id: &str,
        comment: Comment,
    ) -> Result<(), StorageError>;

    async fn delete_post(&self, page: &str, post_id: &str) -> Result<(), StorageError>;

    /// Turn an attachment into a reference that can be stored in a record.
    async fn store_media(&self, upload: &MediaUpload) -> Result<String, StorageError>;

    async fn find_user(&self, username: &str) -> Result<Option<User>, StorageError>;

    async fn find_pending(
        &self,
        username: &str,
    ) -> Result<Option<PendingRegistration>, StorageError>;

    async fn list_users(&self) -> Result<Vec<User>, StorageError>;

    async fn list_pending(&self) -> Result<Vec<PendingRegistration>, StorageError>;

    /// Insert a registration. `Conflict` if the name is used by a user or
    /// another pending registration.
    async fn add_pending(&self, registration: PendingRegistration) -> Result<(), StorageError>;

    /// Move a pending registration to the users set in one atomic step.
    /// `NotFound` if it is no longer pending.
    async fn approve(&self, username: &str) -> Result<User, StorageError>;

    /// Drop a pending registration. `NotFound` if it is no longer pending.
    async fn reject(&self, username: &str) -> Result<(), StorageError>;

    /// Insert `user` unless a user with that name already exists.
    async fn seed_user(&self, user: User) -> Result<(), StorageError>;
}

/// Which backend serves the next operation.
///
/// Once the remote has failed a read the set stays local for its lifetime.
pub struct Backends {
    local: Arc<LocalBackend>,
    remote: Option<Arc<dyn StorageBackend>>,
    downgraded: AtomicBool,
}

impl Backends {
    pub fn new(local: Arc<LocalBackend>, remote: Option<Arc<dyn StorageBackend>>) -> Self {
        Self {
            local,
            remote,
            downgraded: AtomicBool::new(false),
        }
    }

    pub fn local_only(local: Arc<LocalBackend>) -> Self {
        Self::new(local, None)
    }

    pub fn local(&self) -> &Arc<LocalBackend> {
        &self.local
    }

    /// The remote backend, unless absent or downgraded.
    pub fn remote(&self) -> Option<&Arc<dyn StorageBackend>> {
        if self.downgraded.load(Ordering::SeqCst) {
            None
        } else {
            self.remote.as_ref()
        }
    }

    /// The configured remote, downgraded or not.
    pub fn configured_remote(&self) -> Option<&Arc<dyn StorageBackend>> {
        self.remote.as_ref()
    }

    /// Where admin decisions go: the configured remote if there is one,
    /// even after a downgrade.
    pub fn authority(&self) -> &dyn StorageBackend {
        match self.remote.as_ref() {
            Some(remote) => remote.as_ref(),
            None => self.local.as_ref(),
        }
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn active(&self) -> &dyn StorageBackend {
        match self.remote() {
            Some(remote) => remote.as_ref(),
            None => self.local.as_ref(),
        }
    }

    pub fn mode(&self) -> BackendKind {
        self.active().kind()
    }

    pub fn is_downgraded(&self) -> bool {
        self.downgraded.load(Ordering::SeqCst)
    }

    /// Switch to local storage for the rest of this context's lifetime.
    pub fn downgrade(&self, cause: &StorageError) {
        if self.remote.is_some() && !self.downgraded.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                "Remote store failed ({}), continuing with local storage only",
                cause
            );
        }
    }
}
