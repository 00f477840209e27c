use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;

use super::{BackendKind, PostStream, StorageBackend};
use crate::db::models::{feed_order, local_post_id, Comment, PendingRegistration, Post, User};
use crate::error::StorageError;
use crate::local::{posts_key, LocalStore, KEY_PENDING_USERS, KEY_USERS};
use crate::storage::MediaUpload;

/// Backend over the device's key/value store.
///
/// Each page's feed is one JSON array under `posts_<page>`, newest first.
pub struct LocalBackend {
    store: LocalStore,
    changes: broadcast::Sender<String>,
}

impl LocalBackend {
    pub fn new(store: LocalStore) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self { store, changes }
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    fn read_posts(&self, page: &str) -> Vec<Post> {
        self.store.read(&posts_key(page)).unwrap_or_default()
    }

    /// Overwrite a page's feed, e.g. with a mirrored remote snapshot.
    pub fn replace_posts(&self, page: &str, posts: &[Post]) -> Result<(), StorageError> {
        self.store.write(&posts_key(page), &posts)?;
        self.notify(page);
        Ok(())
    }

    /// Repoint a cached post at the id the remote store assigned to it.
    pub fn rename_post(&self, page: &str, from: &str, to: &str) -> Result<(), StorageError> {
        let key = posts_key(page);
        let renamed = self.store.transact(|txn| {
            let mut posts: Vec<Post> = txn.read(&key).unwrap_or_default();
            let Some(post) = posts.iter_mut().find(|p| p.id() == Some(from)) else {
                return Ok(false);
            };
            post.id = Some(to.to_string());
            txn.write(&key, &posts)?;
            Ok(true)
        })?;
        if renamed {
            self.notify(page);
        }
        Ok(())
    }

    fn notify(&self, page: &str) {
        let _ = self.changes.send(page.to_string());
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn list_posts(&self, page: &str) -> Result<Vec<Post>, StorageError> {
        // The key is already page scoped; ordering still has to hold for
        // arrays written by older clients.
        let mut posts = self.read_posts(page);
        posts.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(posts)
    }

    async fn subscribe_posts(&self, page: &str) -> Result<PostStream, StorageError> {
        let mut changes = self.changes.subscribe();
        let store = self.store.clone();
        let page = page.to_string();
        let (tx, rx) = mpsc::channel(16);

        let read = move |store: &LocalStore, page: &str| -> Vec<Post> {
            let posts: Vec<Post> = store.read(&posts_key(page)).unwrap_or_default();
            feed_order(page, posts)
        };
        let initial = read(&store, &page);

        tokio::spawn(async move {
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(changed) if changed != page => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if tx.send(Ok(read(&store, &page))).await.is_err() {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn create_post(&self, mut post: Post) -> Result<Post, StorageError> {
        if post.id.is_none() {
            post.id = Some(local_post_id());
        }
        let key = posts_key(&post.page);
        let stored = post.clone();
        self.store.transact(|txn| {
            let mut posts: Vec<Post> = txn.read(&key).unwrap_or_default();
            posts.retain(|p| p.id != stored.id);
            posts.insert(0, stored);
            txn.write(&key, &posts)
        })?;
        self.notify(&post.page);
        Ok(post)
    }

    async fn append_comment(
        &self,
        page: &str,
        post_id: &str,
        comment: Comment,
    ) -> Result<(), StorageError> {
        let key = posts_key(page);
        self.store.transact(|txn| {
            let mut posts: Vec<Post> = txn.read(&key).unwrap_or_default();
            let post = posts
                .iter_mut()
                .find(|p| p.id() == Some(post_id))
                .ok_or_else(|| StorageError::not_found(key.clone(), post_id))?;
            if !post.comments.contains(&comment) {
                post.comments.push(comment);
            }
            txn.write(&key, &posts)
        })?;
        self.notify(page);
        Ok(())
    }

    async fn delete_post(&self, page: &str, post_id: &str) -> Result<(), StorageError> {
        let key = posts_key(page);
        self.store.transact(|txn| {
            let mut posts: Vec<Post> = txn.read(&key).unwrap_or_default();
            let before = posts.len();
            posts.retain(|p| p.id() != Some(post_id));
            if posts.len() == before {
                return Err(StorageError::not_found(key.clone(), post_id));
            }
            txn.write(&key, &posts)
        })?;
        self.notify(page);
        Ok(())
    }

    async fn store_media(&self, upload: &MediaUpload) -> Result<String, StorageError> {
        Ok(upload.to_data_uri())
    }

    async fn find_user(&self, username: &str) -> Result<Option<User>, StorageError> {
        let users: Vec<User> = self.store.read(KEY_USERS).unwrap_or_default();
        Ok(users.into_iter().find(|u| u.username == username))
    }

    async fn find_pending(
        &self,
        username: &str,
    ) -> Result<Option<PendingRegistration>, StorageError> {
        let pending: Vec<PendingRegistration> =
            self.store.read(KEY_PENDING_USERS).unwrap_or_default();
        Ok(pending.into_iter().find(|p| p.username == username))
    }

    async fn list_users(&self) -> Result<Vec<User>, StorageError> {
        Ok(self.store.read(KEY_USERS).unwrap_or_default())
    }

    async fn list_pending(&self) -> Result<Vec<PendingRegistration>, StorageError> {
        Ok(self.store.read(KEY_PENDING_USERS).unwrap_or_default())
    }

    async fn add_pending(&self, registration: PendingRegistration) -> Result<(), StorageError> {
        self.store.transact(|txn| {
            let users: Vec<User> = txn.read(KEY_USERS).unwrap_or_default();
            let mut pending: Vec<PendingRegistration> =
                txn.read(KEY_PENDING_USERS).unwrap_or_default();
            let taken = users.iter().any(|u| u.username == registration.username)
                || pending.iter().any(|p| p.username == registration.username);
            if taken {
                return Err(StorageError::Conflict(format!(
                    "username {} is taken",
                    registration.username
                )));
            }
            pending.push(registration);
            txn.write(KEY_PENDING_USERS, &pending)
        })
    }

    async fn approve(&self, username: &str) -> Result<User, StorageError> {
        self.store.transact(|txn| {
            let mut pending: Vec<PendingRegistration> =
                txn.read(KEY_PENDING_USERS).unwrap_or_default();
            let index = pending
                .iter()
                .position(|p| p.username == username)
                .ok_or_else(|| StorageError::not_found(KEY_PENDING_USERS, username))?;
            let user = pending.remove(index).approve();

            let mut users: Vec<User> = txn.read(KEY_USERS).unwrap_or_default();
            users.retain(|u| u.username != username);
            users.push(user.clone());

            txn.write(KEY_PENDING_USERS, &pending)?;
            txn.write(KEY_USERS, &users)?;
            Ok(user)
        })
    }

    async fn reject(&self, username: &str) -> Result<(), StorageError> {
        self.store.transact(|txn| {
            let mut pending: Vec<PendingRegistration> =
                txn.read(KEY_PENDING_USERS).unwrap_or_default();
            let before = pending.len();
            pending.retain(|p| p.username != username);
            if pending.len() == before {
                return Err(StorageError::not_found(KEY_PENDING_USERS, username));
            }
            txn.write(KEY_PENDING_USERS, &pending)
        })
    }

    async fn seed_user(&self, user: User) -> Result<(), StorageError> {
        self.store.transact(|txn| {
            let mut users: Vec<User> = txn.read(KEY_USERS).unwrap_or_default();
            if users.iter().any(|u| u.username == user.username) {
                return Ok(());
            }
            users.push(user);
            txn.write(KEY_USERS, &users)
        })
    }
}
