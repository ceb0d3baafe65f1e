//! Enterprise (Entra ID style) identity provider.

use std::sync::Arc;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, Validation};
use serde::Deserialize;

use super::identity::{Identity, IdentityProvider};
use super::jwks::{JwksCache, KeySource, verify};
use super::AuthError;

pub const DEFAULT_AUTHORITY_URL: &str = "https://login.microsoftonline.com";

#[derive(Debug, Clone)]
pub struct EnterpriseConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub authority_url: String,
    /// Overrides the tenant's discovery key endpoint.
    pub jwks_url: Option<String>,
}

impl EnterpriseConfig {
    fn tenant_base(&self) -> String {
        format!(
            "{}/{}",
            self.authority_url.trim_end_matches('/'),
            self.tenant_id
        )
    }

    pub fn issuer(&self) -> String {
        format!("{}/v2.0", self.tenant_base())
    }

    pub fn key_set_url(&self) -> String {
        self.jwks_url
            .clone()
            .unwrap_or_else(|| format!("{}/discovery/v2.0/keys", self.tenant_base()))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct EnterpriseClaims {
    oid: String,
    #[serde(default)]
    preferred_username: Option<String>,
    #[serde(default)]
    upn: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
}

pub struct EnterpriseProvider {
    config: EnterpriseConfig,
    keys: Arc<dyn KeySource>,
    validation: Validation,
}

impl EnterpriseProvider {
    pub fn new(config: EnterpriseConfig) -> Result<Self, AuthError> {
        let keys = Arc::new(JwksCache::new(config.key_set_url())?);
        Self::with_key_source(config, keys)
    }

    pub fn with_key_source(
        config: EnterpriseConfig,
        keys: Arc<dyn KeySource>,
    ) -> Result<Self, AuthError> {
        if config.tenant_id.is_empty() || config.client_id.is_empty() {
            return Err(AuthError::Config(
                "enterprise provider needs a tenant id and a client id".into(),
            ));
        }
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[&config.client_id]);
        validation.set_issuer(&[config.issuer()]);
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);

        Ok(Self {
            config,
            keys,
            validation,
        })
    }
}

#[async_trait]
impl IdentityProvider for EnterpriseProvider {
    fn kind(&self) -> &'static str {
        "enterprise"
    }

    async fn validate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims: EnterpriseClaims = verify(self.keys.as_ref(), token, &self.validation).await?;
        let username = claims
            .preferred_username
            .or(claims.upn)
            .unwrap_or_default();
        Ok(Identity {
            subject: claims.oid,
            username,
            groups: claims.groups,
        })
    }

    fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String, AuthError> {
        let endpoint = format!("{}/oauth2/v2.0/authorize", self.config.tenant_base());
        let url = reqwest::Url::parse_with_params(
            &endpoint,
            &[
                ("client_id", self.config.client_id.as_str()),
                ("response_type", "code"),
                ("response_mode", "query"),
                ("scope", "openid profile offline_access"),
                ("redirect_uri", redirect_uri),
                ("state", state),
            ],
        )
        .map_err(|e| AuthError::Config(format!("authority url {endpoint}: {e}")))?;
        Ok(url.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::test_keys;
    use serde_json::json;

    fn config() -> EnterpriseConfig {
        EnterpriseConfig {
            tenant_id: "tenant-1".into(),
            client_id: "client-1".into(),
            authority_url: "https://login.test/".into(),
            jwks_url: None,
        }
    }

    fn provider() -> EnterpriseProvider {
        EnterpriseProvider::with_key_source(config(), Arc::new(test_keys::key_source())).unwrap()
    }

    fn token(overrides: serde_json::Value) -> String {
        let mut claims = test_keys::claims("oid-alice", &["aup-accepted", "eng"]);
        claims["iss"] = json!("https://login.test/tenant-1/v2.0");
        claims["aud"] = json!("client-1");
        claims["preferred_username"] = json!("alice@corp.example");
        if let (Some(base), Some(extra)) = (claims.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        test_keys::sign(&claims)
    }

    #[test]
    fn derived_urls_follow_tenant() {
        let cfg = config();
        assert_eq!(cfg.issuer(), "https://login.test/tenant-1/v2.0");
        assert_eq!(
            cfg.key_set_url(),
            "https://login.test/tenant-1/discovery/v2.0/keys"
        );
    }

    #[tokio::test]
    async fn extracts_identity_from_valid_token() {
        let identity = provider().validate(&token(json!({}))).await.unwrap();
        assert_eq!(identity.subject, "oid-alice");
        assert_eq!(identity.username, "alice@corp.example");
        assert_eq!(identity.groups, vec!["aup-accepted", "eng"]);
    }

    #[tokio::test]
    async fn rejects_other_tenant_and_audience() {
        let p = provider();
        let other_tenant = token(json!({"iss": "https://login.test/tenant-2/v2.0"}));
        assert!(p.validate(&other_tenant).await.is_err());

        let other_app = token(json!({"aud": "client-2"}));
        assert!(p.validate(&other_app).await.is_err());
    }

    #[test]
    fn authorization_url_carries_client_and_state() {
        let url = provider()
            .authorization_url("http://localhost:51800", "st4te")
            .unwrap();
        assert!(url.starts_with("https://login.test/tenant-1/oauth2/v2.0/authorize?"));
        assert!(url.contains("client_id=client-1"));
        assert!(url.contains("state=st4te"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A51800"));
    }

    #[test]
    fn missing_tenant_is_a_config_error() {
        let mut cfg = config();
        cfg.tenant_id.clear();
        let err = EnterpriseProvider::with_key_source(cfg, Arc::new(test_keys::key_source()))
            .err()
            .unwrap();
        assert!(matches!(err, AuthError::Config(_)));
    }
}
