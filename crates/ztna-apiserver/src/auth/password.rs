//! Gateway stream credentials, stored as argon2id PHC strings.

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use tracing::warn;

use super::AuthError;

/// Hash a gateway password with a fresh salt.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    if password.is_empty() {
        return Err(AuthError::InvalidCredentials("empty gateway password".into()));
    }
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Config(format!("hash gateway password: {e}")))
}

/// Check a presented password against a stored hash.
///
/// A gateway enrolled without a password, or whose stored hash no longer
/// parses, can never authenticate.
pub fn verify_password(gateway: &str, password: &str, stored_hash: &str) -> bool {
    if stored_hash.is_empty() {
        warn!(gateway, "Gateway has no password set");
        return false;
    }
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!(gateway, error = %e, "Stored gateway password hash is unreadable");
            false
        }
    }
}
