//! Reconciliation between the remote store, the device cache and the view.
//!
//! Every user action goes through [`Reconciler`]. It tries the remote backend
//! first, falls back to local storage without losing input, and keeps one
//! in-memory feed per page that is re-rendered whenever it changes.

mod outbox;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::task::JoinHandle;

use crate::backend::{Backends, StorageBackend};
use crate::db::models::{self, feed_order, is_local_id, Comment, Post, Session, ANONYMOUS};
use crate::error::{AppError, AppResult, StorageError};
use crate::render::Render;
use crate::storage::{MediaUpload, StoredMedia};

pub use self::outbox::{overlay, Outbox, PendingWrite};

/// Content of a post or comment as entered by the user.
#[derive(Debug, Clone, Default)]
pub struct Draft {
    pub text: Option<String>,
    pub media: Option<MediaUpload>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            media: None,
        }
    }

    pub fn with_media(mut self, media: MediaUpload) -> Self {
        self.media = Some(media);
        self
    }

    /// Trim the text and drop it when nothing is left.
    fn normalized(mut self) -> Self {
        self.text = self
            .text
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        self
    }

    fn is_empty(&self) -> bool {
        self.text.is_none() && self.media.is_none()
    }
}

pub struct Reconciler {
    backends: Arc<Backends>,
    outbox: Outbox,
    renderer: Arc<dyn Render>,
    views: Mutex<HashMap<String, Vec<Post>>>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
    replaying: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub fn new(backends: Arc<Backends>, outbox: Outbox, renderer: Arc<dyn Render>) -> Self {
        Self {
            backends,
            outbox,
            renderer,
            views: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            replaying: tokio::sync::Mutex::new(()),
        }
    }

    pub fn backends(&self) -> &Arc<Backends> {
        &self.backends
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    /// The feed currently shown for `page`, if it has been listed or watched.
    pub fn view(&self, page: &str) -> Option<Vec<Post>> {
        self.views.lock().ok()?.get(page).cloned()
    }

    /// Pages that have a view.
    pub fn pages(&self) -> Vec<String> {
        match self.views.lock() {
            Ok(views) => {
                let mut pages: Vec<String> = views.keys().cloned().collect();
                pages.sort();
                pages
            }
            Err(_) => Vec::new(),
        }
    }

    fn show(&self, page: &str, posts: Vec<Post>) {
        self.renderer.render(page, &posts);
        if let Ok(mut views) = self.views.lock() {
            views.insert(page.to_string(), posts);
        }
    }

    /// Accept a remote snapshot: overlay undelivered writes, mirror the result
    /// into the device cache and show it.
    fn absorb(&self, page: &str, snapshot: Vec<Post>) -> Vec<Post> {
        let posts = overlay(page, snapshot, &self.outbox.pending());
        if let Err(e) = self.backends.local().replace_posts(page, &posts) {
            tracing::warn!("Could not mirror {} feed locally: {}", page, e);
        }
        self.show(page, posts.clone());
        posts
    }

    async fn show_local(&self, page: &str) -> AppResult<Vec<Post>> {
        let posts = self.backends.local().list_posts(page).await?;
        let posts = feed_order(page, posts);
        self.show(page, posts.clone());
        Ok(posts)
    }

    fn queue(&self, write: PendingWrite) -> AppResult<()> {
        if self.backends.has_remote() {
            self.outbox.push(write)?;
        }
        Ok(())
    }

    pub async fn list_posts(&self, page: &str) -> AppResult<Vec<Post>> {
        if let Some(remote) = self.backends.remote().cloned() {
            if let Err(e) = self.replay_outbox().await {
                tracing::warn!("Outbox replay failed: {}", e);
            }
            match remote.list_posts(page).await {
                Ok(snapshot) => return Ok(self.absorb(page, snapshot)),
                Err(e) => self.backends.downgrade(&e),
            }
        }
        self.show_local(page).await
    }

    /// Re-list every page that currently has a view.
    pub async fn refresh_all(&self) -> AppResult<()> {
        for page in self.pages() {
            self.list_posts(&page).await?;
        }
        Ok(())
    }

    /// Follow a page live until [`Reconciler::shutdown`]. Each snapshot
    /// replaces the view.
    pub fn watch(self: &Arc<Self>, page: &str) {
        let this = Arc::clone(self);
        let page = page.to_string();
        let handle = tokio::spawn(async move { this.follow(page).await });
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.push(handle);
        }
    }

    async fn follow(&self, page: String) {
        if let Some(remote) = self.backends.remote().cloned() {
            let failure = match remote.subscribe_posts(&page).await {
                Ok(mut snapshots) => loop {
                    match snapshots.next().await {
                        Some(Ok(posts)) => {
                            self.absorb(&page, posts);
                        }
                        Some(Err(e)) => break e,
                        None => break StorageError::Unavailable("subscription ended".into()),
                    }
                },
                Err(e) => e,
            };
            self.backends.downgrade(&failure);
        }

        let mut snapshots = match self.backends.local().subscribe_posts(&page).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                tracing::error!("Cannot follow local feed {}: {}", page, e);
                return;
            }
        };
        while let Some(snapshot) = snapshots.next().await {
            match snapshot {
                Ok(posts) => self.show(&page, feed_order(&page, posts)),
                Err(e) => tracing::warn!("Local feed {} update failed: {}", page, e),
            }
        }
    }

    /// Convert an attachment into a reference: an upload URL when the remote
    /// takes it, an inline data URI otherwise.
    async fn attach(&self, media: Option<&MediaUpload>) -> Option<StoredMedia> {
        let upload = media?;
        let url = match self.backends.remote() {
            Some(remote) => match remote.store_media(upload).await {
                Ok(url) => url,
                Err(e) => {
                    tracing::warn!("Media upload failed, embedding inline: {}", e);
                    upload.to_data_uri()
                }
            },
            None => upload.to_data_uri(),
        };
        Some(StoredMedia {
            url,
            mime_type: upload.mime_type.clone(),
        })
    }

    pub async fn create_post(
        &self,
        page: &str,
        session: Option<&Session>,
        draft: Draft,
    ) -> AppResult<Post> {
        let session = session
            .filter(|s| s.approved)
            .ok_or(AppError::Unauthorized)?;
        let draft = draft.normalized();
        if draft.is_empty() {
            return Err(AppError::EmptyContent);
        }

        let media = self.attach(draft.media.as_ref()).await;
        let post = Post {
            id: None,
            page: page.to_string(),
            username: session.username.clone(),
            text: draft.text,
            media: media.as_ref().map(|m| m.url.clone()),
            media_type: media.map(|m| m.mime_type),
            date: models::now(),
            comments: Vec::new(),
        };

        if let Some(remote) = self.backends.remote().cloned() {
            match remote.create_post(post.clone()).await {
                Ok(created) => {
                    tracing::info!("Post {:?} created on {}", created.id, page);
                    return Ok(created);
                }
                Err(e) => tracing::warn!("Remote insert failed, keeping post locally: {}", e),
            }
        }

        let stored = self.backends.local().create_post(post).await?;
        self.queue(PendingWrite::CreatePost {
            post: stored.clone(),
        })?;
        self.show_local(page).await?;
        Ok(stored)
    }

    /// Anyone may comment; without a session the author is `anonymous`.
    pub async fn add_comment(
        &self,
        page: &str,
        post_id: &str,
        session: Option<&Session>,
        draft: Draft,
    ) -> AppResult<Comment> {
        let draft = draft.normalized();
        if draft.is_empty() {
            return Err(AppError::EmptyContent);
        }

        let media = self.attach(draft.media.as_ref()).await;
        let comment = Comment {
            username: session
                .map(|s| s.username.clone())
                .unwrap_or_else(|| ANONYMOUS.to_string()),
            text: draft.text,
            media: media.as_ref().map(|m| m.url.clone()),
            media_type: media.map(|m| m.mime_type),
            date: models::now(),
        };

        // Posts still carrying a local id only exist on this device.
        let remote = if is_local_id(post_id) {
            None
        } else {
            self.backends.remote().cloned()
        };
        if let Some(remote) = remote {
            match remote.append_comment(page, post_id, comment.clone()).await {
                Ok(()) => return Ok(comment),
                Err(StorageError::NotFound { .. }) => return Err(AppError::NotFound),
                Err(e) => tracing::warn!("Remote comment failed, keeping it locally: {}", e),
            }
        }

        match self
            .backends
            .local()
            .append_comment(page, post_id, comment.clone())
            .await
        {
            Ok(()) => {}
            // Not cached here, but the remote may still know the post.
            Err(StorageError::NotFound { .. })
                if self.backends.has_remote() && !is_local_id(post_id) => {}
            Err(StorageError::NotFound { .. }) => return Err(AppError::NotFound),
            Err(e) => return Err(e.into()),
        }
        self.queue(PendingWrite::AppendComment {
            page: page.to_string(),
            post_id: post_id.to_string(),
            comment: comment.clone(),
        })?;
        self.show_local(page).await?;
        Ok(comment)
    }

    /// Admin only. Goes to the configured remote even after a downgrade and
    /// returns its failures.
    pub async fn delete_post(
        &self,
        page: &str,
        post_id: &str,
        session: Option<&Session>,
    ) -> AppResult<()> {
        if !session.map(Session::is_admin).unwrap_or(false) {
            return Err(AppError::Unauthorized);
        }

        let mut found = false;
        if !is_local_id(post_id) {
            if let Some(remote) = self.backends.configured_remote().cloned() {
                match remote.delete_post(page, post_id).await {
                    Ok(()) => found = true,
                    Err(StorageError::NotFound { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        match self.backends.local().delete_post(page, post_id).await {
            Ok(()) => found = true,
            Err(StorageError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        found |= self.outbox.discard_post(post_id)?;
        if !found {
            return Err(AppError::NotFound);
        }

        tracing::info!("Post {} deleted from {}", post_id, page);
        if let Some(mut posts) = self.view(page) {
            posts.retain(|p| p.id() != Some(post_id));
            self.show(page, posts);
        }
        Ok(())
    }

    /// Deliver queued writes to the remote in order. Returns how many were
    /// delivered; stops at the first write the remote fails to take.
    pub async fn replay_outbox(&self) -> AppResult<usize> {
        let Some(remote) = self.backends.remote().cloned() else {
            return Ok(0);
        };
        let _guard = self.replaying.lock().await;

        let mut writes = self.outbox.pending();
        let mut delivered = 0;
        for index in 0..writes.len() {
            let write = writes[index].clone();
            let repoint = match deliver(remote.as_ref(), &write).await {
                Ok(repoint) => {
                    delivered += 1;
                    repoint
                }
                Err(e @ (StorageError::Conflict(_) | StorageError::NotFound { .. })) => {
                    tracing::warn!("Dropping undeliverable queued write: {}", e);
                    if let PendingWrite::Register { registration } = &write {
                        self.forget_registration(&registration.username).await?;
                    }
                    None
                }
                Err(e) => return Err(e.into()),
            };

            self.outbox.complete(
                &write,
                repoint.as_ref().map(|(from, to)| (from.as_str(), to.as_str())),
            )?;
            if let (Some((from, to)), PendingWrite::CreatePost { post }) = (&repoint, &write) {
                self.backends.local().rename_post(&post.page, from, to)?;
                for later in writes[index + 1..].iter_mut() {
                    later.repoint(from, to);
                }
            }
        }
        if delivered > 0 {
            tracing::info!("Delivered {} queued writes", delivered);
        }
        Ok(delivered)
    }

    /// Drop a locally kept registration the remote refused.
    async fn forget_registration(&self, username: &str) -> AppResult<()> {
        match self.backends.local().reject(username).await {
            Ok(()) | Err(StorageError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop every live subscription.
    pub fn shutdown(&self) {
        if let Ok(mut watchers) = self.watchers.lock() {
            for handle in watchers.drain(..) {
                handle.abort();
            }
        }
    }
}

/// Send one queued write. For a post, returns its local id and the id the
/// remote assigned.
async fn deliver(
    remote: &dyn StorageBackend,
    write: &PendingWrite,
) -> Result<Option<(String, String)>, StorageError> {
    match write {
        PendingWrite::CreatePost { post } => {
            let created = remote.create_post(post.clone()).await?;
            Ok(post.id.clone().zip(created.id))
        }
        PendingWrite::AppendComment {
            page,
            post_id,
            comment,
        } => {
            remote
                .append_comment(page, post_id, comment.clone())
                .await?;
            Ok(None)
        }
        PendingWrite::Register { registration } => {
            remote.add_pending(registration.clone()).await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::db;
    use crate::local::LocalStore;
    use crate::render::NullRenderer;

    fn reconciler() -> Reconciler {
        let pool = db::memory_pool().unwrap();
        db::run_migrations(&pool).unwrap();
        let store = LocalStore::new(pool);
        let local = Arc::new(LocalBackend::new(store.clone()));
        Reconciler::new(
            Arc::new(Backends::local_only(local)),
            Outbox::new(store),
            Arc::new(NullRenderer),
        )
    }

    fn member(name: &str) -> Session {
        Session {
            username: name.into(),
            approved: true,
        }
    }

    #[test]
    fn draft_normalization_drops_blank_text() {
        let draft = Draft::text("   ").normalized();
        assert!(draft.is_empty());
        let draft = Draft::text("  hi ").normalized();
        assert_eq!(draft.text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn unapproved_or_missing_session_cannot_post() {
        let r = reconciler();
        let pending = Session {
            username: "bob".into(),
            approved: false,
        };
        assert!(matches!(
            r.create_post("daily", Some(&pending), Draft::text("x")).await,
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            r.create_post("daily", None, Draft::text("x")).await,
            Err(AppError::Unauthorized)
        ));
        assert!(r.list_posts("daily").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_post_is_rejected() {
        let r = reconciler();
        assert!(matches!(
            r.create_post("daily", Some(&member("alice")), Draft::default())
                .await,
            Err(AppError::EmptyContent)
        ));
    }

    #[tokio::test]
    async fn local_only_writes_update_view_without_outbox() {
        let r = reconciler();
        let post = r
            .create_post("daily", Some(&member("alice")), Draft::text("hello"))
            .await
            .unwrap();
        assert!(post.is_local());
        assert_eq!(r.view("daily").unwrap().len(), 1);
        assert!(r.outbox().is_empty());

        r.add_comment("daily", post.id().unwrap(), None, Draft::text("hey"))
            .await
            .unwrap();
        let view = r.view("daily").unwrap();
        assert_eq!(view[0].comments[0].username, ANONYMOUS);
    }

    #[tokio::test]
    async fn media_is_inlined_without_remote() {
        let r = reconciler();
        let upload = MediaUpload::new("a.png", "image/png", bytes::Bytes::from_static(b"hi"));
        let post = r
            .create_post(
                "daily",
                Some(&member("alice")),
                Draft::default().with_media(upload),
            )
            .await
            .unwrap();
        assert_eq!(post.media.as_deref(), Some("data:image/png;base64,aGk="));
        assert_eq!(post.media_type.as_deref(), Some("image/png"));
        assert!(post.text.is_none());
    }

    #[tokio::test]
    async fn only_admin_deletes() {
        let r = reconciler();
        let post = r
            .create_post("daily", Some(&member("alice")), Draft::text("hello"))
            .await
            .unwrap();
        let id = post.id().unwrap();
        assert!(matches!(
            r.delete_post("daily", id, Some(&member("alice"))).await,
            Err(AppError::Unauthorized)
        ));
        r.delete_post("daily", id, Some(&member("admin")))
            .await
            .unwrap();
        assert!(r.view("daily").unwrap().is_empty());
        assert!(matches!(
            r.delete_post("daily", id, Some(&member("admin"))).await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn comment_on_unknown_local_post_is_not_found() {
        let r = reconciler();
        assert!(matches!(
            r.add_comment("daily", "local-nope", None, Draft::text("x"))
                .await,
            Err(AppError::NotFound)
        ));
    }

    #[tokio::test]
    async fn refresh_all_relists_known_pages() {
        let r = reconciler();
        r.list_posts("daily").await.unwrap();
        r.list_posts("music").await.unwrap();
        assert_eq!(r.pages(), vec!["daily", "music"]);
        r.refresh_all().await.unwrap();
        assert!(r.view("music").unwrap().is_empty());
    }
}
