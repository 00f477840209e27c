use crate::error::AppError;

/// bcrypt's lowest accepted cost; used by tests.
pub const MIN_COST: u32 = 4;

/// Hash a password for storage. The cleartext is never persisted.
pub fn hash_password(password: &str, cost: u32) -> Result<String, AppError> {
    bcrypt::hash(password, cost)
        .map_err(|e| AppError::Configuration(format!("password hashing failed: {}", e)))
}

/// Verify a password against a stored hash. Malformed hashes never match.
pub fn verify_password(password: &str, hash: &str) -> bool {
    bcrypt::verify(password, hash).unwrap_or(false)
}
