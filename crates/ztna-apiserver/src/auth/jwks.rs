//! Published signing keys and bearer token verification.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::AuthError;

/// Keys are refetched after this age even when every `kid` is known.
const KEY_SET_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Unknown `kid`s trigger a refetch at most this often.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Resolves the verification key for a token's `kid`.
#[async_trait]
pub trait KeySource: Send + Sync {
    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError>;
}

struct CachedKeySet {
    keys: JwkSet,
    fetched_at: Instant,
}

/// A JWKS endpoint with an in-memory key cache.
pub struct JwksCache {
    http: reqwest::Client,
    url: String,
    state: RwLock<Option<CachedKeySet>>,
}

impl JwksCache {
    pub fn new(url: impl Into<String>) -> Result<Self, AuthError> {
        // reqwest is built with rustls-no-provider; Err means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| AuthError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            url: url.into(),
            state: RwLock::new(None),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<JwkSet, AuthError> {
        let resp = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AuthError::KeySet(format!("GET {}: {e}", self.url)))?;

        if !resp.status().is_success() {
            return Err(AuthError::KeySet(format!(
                "GET {} returned {}",
                self.url,
                resp.status()
            )));
        }

        let keys: JwkSet = resp
            .json()
            .await
            .map_err(|e| AuthError::KeySet(format!("decode key set: {e}")))?;
        info!(url = %self.url, keys = keys.keys.len(), "Fetched identity provider signing keys");
        Ok(keys)
    }
}

#[async_trait]
impl KeySource for JwksCache {
    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        let kid = kid.ok_or_else(|| AuthError::InvalidToken("token header has no kid".into()))?;

        {
            let state = self.state.read().await;
            if let Some(cached) = state.as_ref() {
                let fresh = cached.fetched_at.elapsed() < KEY_SET_MAX_AGE;
                if let Some(jwk) = cached.keys.find(kid).filter(|_| fresh) {
                    return DecodingKey::from_jwk(jwk).map_err(|e| AuthError::KeySet(e.to_string()));
                }
                if fresh && cached.fetched_at.elapsed() < MIN_REFRESH_INTERVAL {
                    debug!(kid, "Unknown signing key, refetch suppressed");
                    return Err(AuthError::InvalidToken(format!("unknown signing key {kid}")));
                }
            }
        }

        let mut state = self.state.write().await;
        let keys = match self.fetch().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(url = %self.url, error = %e, "Signing key refresh failed");
                return Err(e);
            }
        };
        let result = keys
            .find(kid)
            .ok_or_else(|| AuthError::InvalidToken(format!("unknown signing key {kid}")))
            .and_then(|jwk| DecodingKey::from_jwk(jwk).map_err(|e| AuthError::KeySet(e.to_string())));

        *state = Some(CachedKeySet {
            keys,
            fetched_at: Instant::now(),
        });
        result
    }
}

/// A fixed key set, for providers whose keys are configured out of band.
pub struct StaticKeySet(JwkSet);

impl StaticKeySet {
    pub const fn new(keys: JwkSet) -> Self {
        Self(keys)
    }
}

#[async_trait]
impl KeySource for StaticKeySet {
    async fn decoding_key(&self, kid: Option<&str>) -> Result<DecodingKey, AuthError> {
        let jwk = match kid {
            Some(kid) => self.0.find(kid),
            None if self.0.keys.len() == 1 => self.0.keys.first(),
            None => None,
        }
        .ok_or_else(|| AuthError::InvalidToken("unknown signing key".into()))?;
        DecodingKey::from_jwk(jwk).map_err(|e| AuthError::KeySet(e.to_string()))
    }
}

/// Verify a token against `keys` and `validation`, returning its claims.
pub async fn verify<T: DeserializeOwned + Clone>(
    keys: &dyn KeySource,
    token: &str,
    validation: &Validation,
) -> Result<T, AuthError> {
    let header =
        jsonwebtoken::decode_header(token).map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    if !validation.algorithms.contains(&header.alg) {
        return Err(AuthError::InvalidToken(format!(
            "unexpected algorithm {:?}",
            header.alg
        )));
    }

    let key = keys.decoding_key(header.kid.as_deref()).await?;
    let data = jsonwebtoken::decode::<T>(token, &key, validation)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
    Ok(data.claims)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::auth::test_keys;
    use jsonwebtoken::Algorithm;
    use serde::Deserialize;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Clone, Deserialize)]
    struct SubjectClaims {
        sub: String,
    }

    fn validation() -> Validation {
        let mut v = Validation::new(Algorithm::RS256);
        v.set_audience(&[test_keys::AUDIENCE]);
        v.set_issuer(&[test_keys::ISSUER]);
        v
    }

    async fn jwks_server(expected_fetches: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(200).set_body_json(test_keys::jwks_json()))
            .expect(expected_fetches)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn verifies_token_signed_by_published_key() {
        let server = jwks_server(1).await;
        let cache = JwksCache::new(format!("{}/keys", server.uri())).unwrap();

        let token = test_keys::sign(&test_keys::claims("alice", &["g1"]));
        let claims: SubjectClaims = verify(&cache, &token, &validation()).await.unwrap();
        assert_eq!(claims.sub, "alice");

        // Second verification is served from the cache.
        let again: SubjectClaims = verify(&cache, &token, &validation()).await.unwrap();
        assert_eq!(again.sub, "alice");
    }

    #[tokio::test]
    async fn unknown_kid_refetch_is_rate_limited() {
        let server = jwks_server(1).await;
        let cache = JwksCache::new(format!("{}/keys", server.uri())).unwrap();

        assert!(cache.decoding_key(Some(test_keys::KID)).await.is_ok());
        let err = cache.decoding_key(Some("rotated-away")).await.err().unwrap();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn unreachable_key_set_is_a_key_set_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/keys"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let cache = JwksCache::new(format!("{}/keys", server.uri())).unwrap();

        let err = cache.decoding_key(Some(test_keys::KID)).await.err().unwrap();
        assert!(matches!(err, AuthError::KeySet(_)));
    }

    #[tokio::test]
    async fn rejects_wrong_audience_and_issuer() {
        let keys = test_keys::key_source();
        let token = test_keys::sign(&test_keys::claims("alice", &[]));

        let mut wrong_aud = validation();
        wrong_aud.set_audience(&["someone-else"]);
        assert!(verify::<SubjectClaims>(&keys, &token, &wrong_aud).await.is_err());

        let mut wrong_iss = validation();
        wrong_iss.set_issuer(&["https://evil.example.com"]);
        assert!(verify::<SubjectClaims>(&keys, &token, &wrong_iss).await.is_err());
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let keys = test_keys::key_source();
        let mut claims = test_keys::claims("alice", &[]);
        claims["exp"] = serde_json::json!(ztna_core::unix_timestamp() - 3600);
        let token = test_keys::sign(&claims);

        let err = verify::<SubjectClaims>(&keys, &token, &validation())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn rejects_tampered_payload() {
        let keys = test_keys::key_source();
        let token = test_keys::sign(&test_keys::claims("alice", &[]));
        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = test_keys::sign_unverified_payload(&test_keys::claims("mallory", &[]));
        parts[1] = forged.as_str();
        let tampered = parts.join(".");

        assert!(verify::<SubjectClaims>(&keys, &tampered, &validation()).await.is_err());
    }

    #[tokio::test]
    async fn rejects_algorithm_outside_validation() {
        let keys = test_keys::key_source();
        let token = test_keys::sign(&test_keys::claims("alice", &[]));
        let hs_only = Validation::new(Algorithm::HS256);

        let err = verify::<SubjectClaims>(&keys, &token, &hs_only)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(msg) if msg.contains("algorithm")));
    }
}
