//! Authentication for devices, gateways and administrators.
//!
//! Devices log in with an identity-provider token (enterprise or consumer
//! provider, chosen at startup). Gateways present a name and password;
//! administrators a separate username/password pair.

pub mod admin;
pub mod authenticator;
pub mod consumer;
pub mod enterprise;
pub mod identity;
pub mod jwks;
pub mod password;

#[cfg(test)]
pub(crate) mod test_keys;

pub use admin::AdminCredentials;
pub use authenticator::Authenticator;
pub use consumer::{ConsumerConfig, ConsumerProvider};
pub use enterprise::{EnterpriseConfig, EnterpriseProvider};
pub use identity::{Identity, IdentityProvider};
pub use jwks::{JwksCache, KeySource};

use crate::storage::DatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Bad signature, expiry, audience, issuer or shape.
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// Wrong gateway or administrator password.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Acceptable use policy not accepted (missing group {0})")]
    MissingPolicyGroup(String),

    #[error("Device {serial}/{platform} is not enrolled")]
    UnknownDevice { serial: String, platform: String },

    /// The provider's published key set could not be fetched or decoded.
    #[error("Signing keys unavailable: {0}")]
    KeySet(String),

    #[error("Identity provider misconfigured: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}
