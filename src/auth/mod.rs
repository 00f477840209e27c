//! Identity: registration, login and the cached session.

pub mod password;

use std::sync::Arc;

use crate::backend::{Backends, StorageBackend};
use crate::db::models::{self, PendingRegistration, Session, User};
use crate::error::{AppError, AppResult, StorageError};
use crate::local::{LocalStore, KEY_CURRENT_USER};
use crate::sync::{Outbox, PendingWrite, Reconciler};

pub use self::password::{hash_password, verify_password};

pub struct SessionGate {
    backends: Arc<Backends>,
    store: LocalStore,
    outbox: Outbox,
    reconciler: Arc<Reconciler>,
    bcrypt_cost: u32,
}

fn taken(e: StorageError) -> AppError {
    match e {
        StorageError::Conflict(_) => AppError::UsernameTaken,
        other => AppError::Storage(other),
    }
}

impl SessionGate {
    pub fn new(
        backends: Arc<Backends>,
        store: LocalStore,
        reconciler: Arc<Reconciler>,
        bcrypt_cost: u32,
    ) -> Self {
        let outbox = reconciler.outbox().clone();
        Self {
            backends,
            store,
            outbox,
            reconciler,
            bcrypt_cost,
        }
    }

    /// Pure read of the cached identity.
    pub fn current_session(&self) -> Option<Session> {
        self.store.read(KEY_CURRENT_USER)
    }

    async fn find_user(&self, username: &str) -> AppResult<Option<User>> {
        if let Some(remote) = self.backends.remote() {
            match remote.find_user(username).await {
                Ok(user) => return Ok(user),
                Err(e) => self.backends.downgrade(&e),
            }
        }
        Ok(self.backends.local().find_user(username).await?)
    }

    async fn find_pending(&self, username: &str) -> AppResult<Option<PendingRegistration>> {
        if let Some(remote) = self.backends.remote() {
            match remote.find_pending(username).await {
                Ok(pending) => return Ok(pending),
                Err(e) => self.backends.downgrade(&e),
            }
        }
        Ok(self.backends.local().find_pending(username).await?)
    }

    pub async fn login(&self, username: &str, password: &str) -> AppResult<Session> {
        let username = username.trim();

        if let Some(user) = self.find_user(username).await? {
            if !verify_password(password, &user.password_hash) {
                return Err(AppError::InvalidCredentials);
            }
            if !user.approved {
                return Err(AppError::PendingApproval);
            }
            let session = Session {
                username: user.username,
                approved: true,
            };
            self.store.write(KEY_CURRENT_USER, &session)?;
            tracing::info!("Logged in as {}", session.username);
            self.refresh_views().await;
            return Ok(session);
        }

        match self.find_pending(username).await? {
            Some(pending) if verify_password(password, &pending.password_hash) => {
                Err(AppError::PendingApproval)
            }
            _ => Err(AppError::InvalidCredentials),
        }
    }

    /// Queue a registration for admin approval.
    pub async fn register(&self, username: &str, password: &str) -> AppResult<()> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AppError::BadRequest("username must not be empty".into()));
        }
        if password.is_empty() {
            return Err(AppError::BadRequest("password must not be empty".into()));
        }

        let registration = PendingRegistration {
            username: username.to_string(),
            password_hash: hash_password(password, self.bcrypt_cost)?,
            requested_at: models::now(),
        };

        if let Some(remote) = self.backends.remote() {
            match remote.add_pending(registration.clone()).await {
                Ok(()) => {
                    tracing::info!("Registration for {} awaits approval", username);
                    return Ok(());
                }
                Err(StorageError::Conflict(_)) => return Err(AppError::UsernameTaken),
                Err(e) => tracing::warn!("Remote registration failed, keeping it locally: {}", e),
            }
        }

        self.backends
            .local()
            .add_pending(registration.clone())
            .await
            .map_err(taken)?;
        if self.backends.has_remote() {
            self.outbox.push(PendingWrite::Register { registration })?;
        }
        tracing::info!("Registration for {} stored locally", username);
        Ok(())
    }

    pub async fn logout(&self) -> AppResult<()> {
        self.store.delete(KEY_CURRENT_USER)?;
        tracing::info!("Logged out");
        self.refresh_views().await;
        Ok(())
    }

    async fn refresh_views(&self) {
        if let Err(e) = self.reconciler.refresh_all().await {
            tracing::warn!("Refreshing feeds failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use crate::db;
    use crate::db::models::ADMIN_USERNAME;
    use crate::render::NullRenderer;
    use super::password::MIN_COST;

    async fn gate() -> SessionGate {
        let pool = db::memory_pool().unwrap();
        db::run_migrations(&pool).unwrap();
        let store = LocalStore::new(pool);
        let local = Arc::new(LocalBackend::new(store.clone()));
        local
            .seed_user(User {
                username: ADMIN_USERNAME.into(),
                password_hash: hash_password("admin", MIN_COST).unwrap(),
                approved: true,
            })
            .await
            .unwrap();
        let backends = Arc::new(Backends::local_only(local));
        let reconciler = Arc::new(Reconciler::new(
            backends.clone(),
            Outbox::new(store.clone()),
            Arc::new(NullRenderer),
        ));
        SessionGate::new(backends, store, reconciler, MIN_COST)
    }

    #[tokio::test]
    async fn admin_logs_in_and_session_is_cached() {
        let gate = gate().await;
        assert!(gate.current_session().is_none());
        let session = gate.login("admin", "admin").await.unwrap();
        assert!(session.is_admin());
        assert_eq!(gate.current_session(), Some(session));
        gate.logout().await.unwrap();
        assert!(gate.current_session().is_none());
    }

    #[tokio::test]
    async fn wrong_password_or_unknown_user_is_invalid() {
        let gate = gate().await;
        assert!(matches!(
            gate.login("admin", "nope").await,
            Err(AppError::InvalidCredentials)
        ));
        assert!(matches!(
            gate.login("ghost", "admin").await,
            Err(AppError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn pending_registration_cannot_log_in() {
        let gate = gate().await;
        gate.register("alice", "pw").await.unwrap();
        assert!(matches!(
            gate.login("alice", "pw").await,
            Err(AppError::PendingApproval)
        ));
        assert!(matches!(
            gate.login("alice", "wrong").await,
            Err(AppError::InvalidCredentials)
        ));
        assert!(gate.current_session().is_none());
    }

    #[tokio::test]
    async fn names_are_unique_including_admin() {
        let gate = gate().await;
        gate.register("alice", "pw").await.unwrap();
        assert!(matches!(
            gate.register("alice", "other").await,
            Err(AppError::UsernameTaken)
        ));
        assert!(matches!(
            gate.register("admin", "x").await,
            Err(AppError::UsernameTaken)
        ));
    }

    #[tokio::test]
    async fn blank_names_are_rejected() {
        let gate = gate().await;
        assert!(matches!(
            gate.register("  ", "pw").await,
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn stored_registration_has_no_cleartext() {
        let gate = gate().await;
        gate.register("alice", "secret").await.unwrap();
        let pending = gate
            .backends
            .local()
            .find_pending("alice")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(pending.password_hash, "secret");
        assert!(verify_password("secret", &pending.password_hash));
    }
}
