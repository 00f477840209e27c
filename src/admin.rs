use std::sync::Arc;

use crate::backend::{Backends, StorageBackend};
use crate::db::models::{PendingRegistration, Session, User, ADMIN_USERNAME};
use crate::error::{AppError, AppResult, StorageError};

/// Approval queue for new accounts. Only the admin can open it.
pub struct Moderation {
    backends: Arc<Backends>,
}

fn decided(e: StorageError) -> AppError {
    match e {
        StorageError::NotFound { .. } => AppError::NotFound,
        other => AppError::Storage(other),
    }
}

impl Moderation {
    pub fn open(backends: Arc<Backends>, session: Option<&Session>) -> AppResult<Self> {
        match session {
            Some(session) if session.is_admin() => Ok(Self { backends }),
            _ => Err(AppError::Unauthorized),
        }
    }

    pub async fn list_pending(&self) -> AppResult<Vec<PendingRegistration>> {
        let mut pending = match self.backends.remote() {
            Some(remote) => match remote.list_pending().await {
                Ok(pending) => pending,
                Err(e) => {
                    self.backends.downgrade(&e);
                    self.backends.local().list_pending().await?
                }
            },
            None => self.backends.local().list_pending().await?,
        };
        pending.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(pending)
    }

    /// Approved accounts other than the admin itself.
    pub async fn list_approved(&self) -> AppResult<Vec<User>> {
        let users = match self.backends.remote() {
            Some(remote) => match remote.list_users().await {
                Ok(users) => users,
                Err(e) => {
                    self.backends.downgrade(&e);
                    self.backends.local().list_users().await?
                }
            },
            None => self.backends.local().list_users().await?,
        };
        let mut users: Vec<User> = users
            .into_iter()
            .filter(|u| u.approved && u.username != ADMIN_USERNAME)
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    /// Promote a pending registration. `NotFound` if it was already decided.
    pub async fn approve(&self, username: &str) -> AppResult<User> {
        let user = self.backends.authority().approve(username).await.map_err(decided)?;
        tracing::info!("Approved {}", username);
        Ok(user)
    }

    pub async fn reject(&self, username: &str) -> AppResult<()> {
        self.backends.authority().reject(username).await.map_err(decided)?;
        tracing::info!("Rejected {}", username);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::db;
    use crate::local::LocalStore;
    use chrono::Utc;

    async fn backends() -> Arc<Backends> {
        let pool = db::memory_pool().unwrap();
        db::run_migrations(&pool).unwrap();
        let local = Arc::new(LocalBackend::new(LocalStore::new(pool)));
        local
            .seed_user(User {
                username: ADMIN_USERNAME.into(),
                password_hash: "h".into(),
                approved: true,
            })
            .await
            .unwrap();
        for name in ["carol", "alice"] {
            local
                .add_pending(PendingRegistration {
                    username: name.into(),
                    password_hash: "h".into(),
                    requested_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        Arc::new(Backends::local_only(local))
    }

    fn session(name: &str) -> Session {
        Session {
            username: name.into(),
            approved: true,
        }
    }

    #[tokio::test]
    async fn only_admin_opens_moderation() {
        let backends = backends().await;
        assert!(matches!(
            Moderation::open(backends.clone(), Some(&session("alice"))),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(
            Moderation::open(backends.clone(), None),
            Err(AppError::Unauthorized)
        ));
        assert!(Moderation::open(backends, Some(&session(ADMIN_USERNAME))).is_ok());
    }

    #[tokio::test]
    async fn pending_list_is_sorted() {
        let moderation = Moderation::open(backends().await, Some(&session("admin"))).unwrap();
        let names: Vec<_> = moderation
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.username)
            .collect();
        assert_eq!(names, vec!["alice", "carol"]);
    }

    #[tokio::test]
    async fn approve_moves_user_and_hides_admin() {
        let moderation = Moderation::open(backends().await, Some(&session("admin"))).unwrap();
        assert!(moderation.list_approved().await.unwrap().is_empty());

        moderation.approve("alice").await.unwrap();
        let approved: Vec<_> = moderation
            .list_approved()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(approved, vec!["alice"]);
        assert_eq!(moderation.list_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_decision_is_not_found() {
        let moderation = Moderation::open(backends().await, Some(&session("admin"))).unwrap();
        moderation.reject("carol").await.unwrap();
        assert!(matches!(
            moderation.approve("carol").await,
            Err(AppError::NotFound)
        ));
        assert!(matches!(
            moderation.reject("carol").await,
            Err(AppError::NotFound)
        ));
    }
}
