use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::Config;
use crate::remote::SqliteDocumentStore;
use crate::storage::UploadDir;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Shared state of `umuw serve`.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Config,
    pub documents: SqliteDocumentStore,
    pub uploads: UploadDir,
}

impl AppState {
    pub fn new(db: DbPool, config: Config, uploads: UploadDir) -> Self {
        let documents = SqliteDocumentStore::new(db.clone());
        Self {
            db,
            config,
            documents,
            uploads,
        }
    }
}
