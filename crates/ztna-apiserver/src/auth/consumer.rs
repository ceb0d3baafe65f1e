//! Consumer (Google style) identity provider.
//!
//! Consumer tokens carry no group claims. Every verified account from an
//! allowed hosted domain gets the configured default groups.

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;

use super::identity::{Identity, IdentityProvider};
use super::jwks::{JwksCache, KeySource, verify};
use super::AuthError;

pub const DEFAULT_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
pub const AUTHORIZATION_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_GROUP: &str = "allUsers";
const ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub client_id: String,
    /// Accepted `hd` claims. Empty accepts any domain.
    pub allowed_domains: Vec<String>,
    pub jwks_url: String,
    pub default_groups: Vec<String>,
}

impl ConsumerConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            allowed_domains: Vec::new(),
            jwks_url: DEFAULT_JWKS_URL.to_string(),
            default_groups: vec![DEFAULT_GROUP.to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ConsumerClaims {
    sub: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    email_verified: bool,
    #[serde(default)]
    hd: Option<String>,
}

pub struct ConsumerProvider {
    config: ConsumerConfig,
    keys: Arc<dyn KeySource>,
    validation: Validation,
}

impl ConsumerProvider {
    pub fn new(config: ConsumerConfig) -> Result<Self, AuthError> {
        let keys = Arc::new(JwksCache::new(config.jwks_url.clone())?);
        Self::with_key_source(config, keys)
    }

    pub fn with_key_source(
        config: ConsumerConfig,
        keys: Arc<dyn KeySource>,
    ) -> Result<Self, AuthError> {
        if config.client_id.is_empty() {
            return Err(AuthError::Config("consumer provider needs a client id".into()));
        }
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&config.client_id]);
        validation.set_issuer(&ISSUERS);

        Ok(Self {
            config,
            keys,
            validation,
        })
    }

    fn domain_allowed(&self, hd: Option<&str>) -> bool {
        if self.config.allowed_domains.is_empty() {
            return true;
        }
        hd.is_some_and(|hd| {
            self.config
                .allowed_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(hd))
        })
    }
}

#[async_trait]
impl IdentityProvider for ConsumerProvider {
    fn kind(&self) -> &'static str {
        "consumer"
    }

    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims: ConsumerClaims = verify(self.keys.as_ref(), token, &self.validation).await?;

        if !claims.email_verified {
            return Err(AuthError::InvalidToken(format!(
                "email {} is not verified",
                claims.email
            )));
        }
        if !self.domain_allowed(claims.hd.as_deref()) {
            return Err(AuthError::InvalidToken(format!(
                "hosted domain {:?} is not allowed",
                claims.hd
            )));
        }

        Ok(Identity {
            subject: claims.sub,
            username: claims.email,
            groups: self.config.default_groups.clone(),
        })
    }

    fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, AuthError> {
        let mut params = vec![
            ("client_id", self.config.client_id.as_str()),
            ("response_type", "code"),
            ("scope", "openid email profile"),
            ("redirect_uri", redirect_uri),
            ("state", state),
        ];
        if let [domain] = self.config.allowed_domains.as_slice() {
            params.push(("hd", domain.as_str()));
        }
        let url = reqwest::Url::parse_with_params(AUTHORIZATION_ENDPOINT, &params)
            .map_err(|e| AuthError::Config(e.to_string()))?;
        Ok(url.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::test_keys;
    use serde_json::{Value, json};

    fn provider(domains: &[&str]) -> ConsumerProvider {
        let mut cfg = ConsumerConfig::new("consumer-client");
        cfg.allowed_domains = domains.iter().map(|d| (*d).to_string()).collect();
        ConsumerProvider::with_key_source(cfg, Arc::new(test_keys::key_source())).unwrap()
    }

    fn token(email_verified: bool, hd: Option<&str>) -> String {
        let mut claims = test_keys::claims("1098765", &[]);
        claims["iss"] = json!("https://accounts.google.com");
        claims["aud"] = json!("consumer-client");
        claims["email"] = json!("bob@example.org");
        claims["email_verified"] = json!(email_verified);
        claims["hd"] = hd.map_or(Value::Null, |d| json!(d));
        test_keys::sign(&claims)
    }

    #[tokio::test]
    async fn verified_account_gets_default_groups() {
        let identity = provider(&["example.org"])
            .validate(&token(true, Some("example.org")))
            .await
            .unwrap();
        assert_eq!(identity.subject, "1098765");
        assert_eq!(identity.username, "bob@example.org");
        assert_eq!(identity.groups, vec![DEFAULT_GROUP]);
    }

    #[tokio::test]
    async fn unverified_email_is_rejected() {
        let err = provider(&[]).validate(&token(false, None)).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn foreign_hosted_domain_is_rejected() {
        let p = provider(&["example.org"]);
        assert!(p.validate(&token(true, Some("other.org"))).await.is_err());
        assert!(p.validate(&token(true, None)).await.is_err());
    }

    #[tokio::test]
    async fn any_domain_when_allow_list_is_empty() {
        assert!(provider(&[]).validate(&token(true, None)).await.is_ok());
    }

    #[test]
    fn authorization_url_pins_single_domain() {
        let url = provider(&["example.org"])
            .authorization_url("http://localhost:51800", "xyz")
            .unwrap();
        assert!(url.starts_with(AUTHORIZATION_ENDPOINT));
        assert!(url.contains("hd=example.org"));
        assert!(url.contains("scope=openid+email+profile"));
    }
}
