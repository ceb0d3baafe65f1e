//! The identity-provider seam.

use async_trait::async_trait;

use super::AuthError;

/// What a validated identity token says about its subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable subject identifier (object id / `sub`).
    pub subject: String,
    /// Human-readable account name, compared against the device owner.
    pub username: String,
    pub groups: Vec<String>,
}

/// One way of turning a bearer token into an [`Identity`].
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Short provider name for logs.
    fn kind(&self) -> &'static str;

    /// Verify signature, expiry, audience and issuer, then extract the identity.
    async fn validate(&self, token: &str) -> Result<Identity, AuthError>;

    /// Browser authorization URL for clients that run the code flow.
    fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, AuthError>;
}
