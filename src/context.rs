//! Explicit application context: everything a client session needs, built
//! once from configuration and torn down with [`AppContext::shutdown`].

use std::sync::Arc;

use crate::admin::Moderation;
use crate::auth::{hash_password, SessionGate};
use crate::backend::{BackendKind, Backends, LocalBackend, RemoteBackend, StorageBackend};
use crate::config::Config;
use crate::db;
use crate::db::models::{Session, User, ADMIN_USERNAME};
use crate::error::{AppError, AppResult};
use crate::local::LocalStore;
use crate::remote::HttpDocumentStore;
use crate::render::Render;
use crate::state::DbPool;
use crate::sync::{Outbox, Reconciler};

pub struct AppContext {
    config: Config,
    backends: Arc<Backends>,
    reconciler: Arc<Reconciler>,
    gate: SessionGate,
}

/// Open the device store. Without a remote to fall back on, a store that
/// cannot be opened leaves nowhere to keep data.
fn open_local(config: &Config, has_remote: bool) -> AppResult<DbPool> {
    let opened = config
        .db_path()
        .ok_or_else(|| anyhow::anyhow!("no database path configured"))
        .and_then(|path| {
            let pool = db::create_pool(path)?;
            db::run_migrations(&pool)?;
            Ok(pool)
        });

    match opened {
        Ok(pool) => Ok(pool),
        Err(e) if has_remote => {
            tracing::warn!("Local store unavailable ({}), caching in memory", e);
            let pool = db::memory_pool().map_err(|e| AppError::Configuration(e.to_string()))?;
            db::run_migrations(&pool).map_err(|e| AppError::Configuration(e.to_string()))?;
            Ok(pool)
        }
        Err(e) => Err(AppError::Configuration(format!(
            "local store cannot be opened and no remote store is configured: {}",
            e
        ))),
    }
}

impl AppContext {
    pub async fn init(config: &Config, renderer: Arc<dyn Render>) -> AppResult<Self> {
        let endpoint = config.remote.endpoint().cloned();
        let pool = open_local(config, endpoint.is_some())?;
        let store = LocalStore::new(pool);
        let local = Arc::new(LocalBackend::new(store.clone()));

        let remote = endpoint.map(|url| {
            tracing::info!("Using remote store at {}", url);
            let http = Arc::new(HttpDocumentStore::new(url));
            Arc::new(RemoteBackend::new(http.clone(), http)) as Arc<dyn StorageBackend>
        });

        Self::assemble(config, store, Arc::new(Backends::new(local, remote)), renderer).await
    }

    /// Build a context over backends the caller has already set up.
    pub async fn assemble(
        config: &Config,
        store: LocalStore,
        backends: Arc<Backends>,
        renderer: Arc<dyn Render>,
    ) -> AppResult<Self> {
        seed_admin(config, &backends).await?;

        let reconciler = Arc::new(Reconciler::new(
            backends.clone(),
            Outbox::new(store.clone()),
            renderer,
        ));
        if let Err(e) = reconciler.replay_outbox().await {
            tracing::warn!("Queued writes not delivered yet: {}", e);
        }

        let gate = SessionGate::new(
            backends.clone(),
            store,
            reconciler.clone(),
            config.auth.bcrypt_cost,
        );

        tracing::debug!("Context ready, storage mode {}", backends.mode());
        Ok(Self {
            config: config.clone(),
            backends,
            reconciler,
            gate,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backends(&self) -> &Arc<Backends> {
        &self.backends
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub fn session(&self) -> Option<Session> {
        self.gate.current_session()
    }

    pub fn mode(&self) -> BackendKind {
        self.backends.mode()
    }

    /// Moderation for the current session; `Unauthorized` unless admin.
    pub fn moderation(&self) -> AppResult<Moderation> {
        Moderation::open(self.backends.clone(), self.session().as_ref())
    }

    pub fn shutdown(&self) {
        self.reconciler.shutdown();
        tracing::debug!("Context shut down");
    }
}

/// Make sure the admin account exists everywhere data may be read from.
async fn seed_admin(config: &Config, backends: &Backends) -> AppResult<()> {
    let mut hash: Option<String> = None;
    let mut admin = || -> AppResult<User> {
        let password_hash = match &hash {
            Some(h) => h.clone(),
            None => {
                let h = hash_password(&config.auth.admin_password, config.auth.bcrypt_cost)?;
                hash = Some(h.clone());
                h
            }
        };
        Ok(User {
            username: ADMIN_USERNAME.to_string(),
            password_hash,
            approved: true,
        })
    };

    if backends.local().find_user(ADMIN_USERNAME).await?.is_none() {
        backends.local().seed_user(admin()?).await?;
        tracing::info!("Seeded local admin account");
    }

    if let Some(remote) = backends.remote() {
        let seeded = match remote.find_user(ADMIN_USERNAME).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => remote.seed_user(admin()?).await,
            Err(e) => Err(e),
        };
        if let Err(e) = seeded {
            backends.downgrade(&e);
        }
    }
    Ok(())
}
