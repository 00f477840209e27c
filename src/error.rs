use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Failures of either storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Remote store unavailable: {0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document {collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Remote store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl StorageError {
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid username or password")]
    InvalidCredentials,

    #[error("Your account has not been approved by the administrator yet")]
    PendingApproval,

    #[error("That username is already taken or awaiting approval")]
    UsernameTaken,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("A post or comment needs text or an attachment")]
    EmptyContent,

    #[error("Not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("No storage backend is reachable: {0}")]
    Configuration(String),
}

impl AppError {
    /// Message shown to the person at the keyboard. Storage internals stay in
    /// the log.
    pub fn notice(&self) -> String {
        match self {
            AppError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                "The operation failed, please try again later.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::InvalidCredentials => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::PendingApproval => (StatusCode::FORBIDDEN, self.to_string()),
            AppError::UsernameTaken => (StatusCode::CONFLICT, self.to_string()),
            AppError::EmptyContent => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Storage(StorageError::NotFound { .. }) => {
                (StatusCode::NOT_FOUND, "Not found".to_string())
            }
            AppError::Storage(StorageError::Conflict(msg)) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Storage(StorageError::Json(e)) => {
                (StatusCode::BAD_REQUEST, format!("Malformed document: {}", e))
            }
            AppError::Storage(e) => {
                tracing::error!("Storage error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::Configuration(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, message).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
