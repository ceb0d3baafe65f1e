//! Just-in-time access (JITA) client and grant cache.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use super::{ProviderError, check_status, http_client};

/// One grant as returned by `GET /gatewayAccess/{gateway}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PrivilegedUser {
    pub user_id: String,
    pub gateway: String,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
}

/// Source of privileged subjects for a gateway.
#[async_trait]
pub trait PrivilegedAccess: Send + Sync {
    /// Subject ids currently granted on `gateway`.
    async fn privileged_subjects(&self, gateway: &str) -> Result<HashSet<String>, ProviderError>;
}

pub struct JitaClient {
    http: reqwest::Client,
    base_url: Url,
    username: String,
    password: String,
}

impl JitaClient {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ProviderError::Config(format!("JITA url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::Config(format!("JITA url {base_url} is not a base")));
        }
        Ok(Self {
            http: http_client()?,
            base_url,
            username: username.into(),
            password: password.into(),
        })
    }

    fn gateway_access_url(&self, gateway: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("gatewayAccess").push(gateway);
        }
        url
    }

    pub async fn privileged_users_for_gateway(
        &self,
        gateway: &str,
    ) -> Result<Vec<PrivilegedUser>, ProviderError> {
        let resp = self
            .http
            .get(self.gateway_access_url(gateway))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let resp = check_status(resp).await?;
        resp.json()
            .await
            .map_err(|e| ProviderError::Decode(format!("gatewayAccess/{gateway}: {e}")))
    }
}

#[async_trait]
impl PrivilegedAccess for JitaClient {
    async fn privileged_subjects(&self, gateway: &str) -> Result<HashSet<String>, ProviderError> {
        let now = Utc::now();
        let users = self.privileged_users_for_gateway(gateway).await?;
        Ok(users
            .into_iter()
            .filter(|u| u.expires.is_none_or(|exp| exp > now))
            .map(|u| u.user_id)
            .collect())
    }
}

/// In-memory grant lists, refreshed in the background.
///
/// The filter pipeline reads only from here, so a slow or unreachable JITA
/// never blocks a configuration push.
pub struct JitaCache {
    source: Option<Arc<dyn PrivilegedAccess>>,
    grants: RwLock<HashMap<String, HashSet<String>>>,
}

impl JitaCache {
    pub fn new(source: Arc<dyn PrivilegedAccess>) -> Self {
        Self {
            source: Some(source),
            grants: RwLock::new(HashMap::new()),
        }
    }

    /// A cache with no upstream. Privileged gateways admit nobody.
    pub fn disabled() -> Self {
        Self {
            source: None,
            grants: RwLock::new(HashMap::new()),
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.source.is_some()
    }

    pub async fn get(&self, gateway: &str) -> Result<HashSet<String>, ProviderError> {
        self.grants
            .read()
            .await
            .get(gateway)
            .cloned()
            .ok_or_else(|| ProviderError::NotCached(gateway.to_string()))
    }

    /// Refetch grants for `gateways` and return the names whose subject set
    /// changed. A failed fetch keeps that gateway's previous list.
    pub async fn refresh(&self, gateways: &[String]) -> Vec<String> {
        let Some(source) = &self.source else {
            return Vec::new();
        };

        let mut changed = Vec::new();
        for gateway in gateways {
            let subjects = match source.privileged_subjects(gateway).await {
                Ok(subjects) => subjects,
                Err(e) => {
                    error!(gateway = %gateway, provider = "jita", error = %e, "Privileged access refresh failed");
                    continue;
                }
            };

            let mut grants = self.grants.write().await;
            if grants.get(gateway) != Some(&subjects) {
                info!(gateway = %gateway, subjects = subjects.len(), "Privileged access changed");
                grants.insert(gateway.clone(), subjects);
                changed.push(gateway.clone());
            } else {
                debug!(gateway = %gateway, "Privileged access unchanged");
            }
        }

        // Gateways no longer requiring privileged access drop out of the cache.
        self.grants
            .write()
            .await
            .retain(|name, _| gateways.contains(name));
        changed
    }
}
