//! Kolide device health client.
//!
//! Health is pulled: all checks (for severity tags), all devices, then each
//! device's open failures. A device is unhealthy when any unresolved,
//! non-ignored failure has outlived the grace period of its severity.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ProviderError, check_status, http_client};

pub const DEFAULT_KOLIDE_URL: &str = "https://k2.kolide.com/api/v0";
const PAGE_SIZE: &str = "100";

/// A device as the health provider reports it, failures attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderDevice {
    pub serial: String,
    /// Already mapped onto `darwin`, `windows` or `linux`.
    pub platform: String,
    pub owner_email: String,
    pub last_seen: Option<DateTime<Utc>>,
    pub failures: Vec<Failure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub check_id: i64,
    pub title: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub ignored: bool,
    /// Severity tags of the failing check.
    pub tags: Vec<String>,
}

/// Where device health comes from.
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn devices(&self) -> Result<Vec<ProviderDevice>, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiCheck {
    id: i64,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiDevice {
    id: i64,
    #[serde(default)]
    serial: String,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    assigned_owner: Option<ApiOwner>,
}

#[derive(Debug, Deserialize)]
struct ApiOwner {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Deserialize)]
struct ApiFailure {
    check_id: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    ignored: bool,
}

pub struct KolideClient {
    http: reqwest::Client,
    base_url: Url,
    api_token: String,
}

impl KolideClient {
    pub fn new(base_url: &str, api_token: impl Into<String>) -> Result<Self, ProviderError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ProviderError::Config(format!("Kolide url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::Config(format!("Kolide url {base_url} is not a base")));
        }
        Ok(Self {
            http: http_client()?,
            base_url,
            api_token: api_token.into(),
        })
    }

    fn url(&self, segments: &[&str], cursor: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("per_page", PAGE_SIZE);
            if let Some(cursor) = cursor {
                query.append_pair("cursor", cursor);
            }
        }
        url
    }

    /// Follow `next_cursor` until the provider stops returning one.
    async fn get_all<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<Vec<T>, ProviderError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let resp = self
                .http
                .get(self.url(segments, cursor.as_deref()))
                .bearer_auth(&self.api_token)
                .header(reqwest::header::ACCEPT, "application/json")
                .send()
                .await?;
            let page: Page<T> = check_status(resp)
                .await?
                .json()
                .await
                .map_err(|e| ProviderError::Decode(format!("{}: {e}", segments.join("/"))))?;
            items.extend(page.data);

            match page.pagination.next_cursor.filter(|c| !c.is_empty()) {
                Some(next) => cursor = Some(next),
                None => return Ok(items),
            }
        }
    }
}

#[async_trait]
impl HealthSource for KolideClient {
    async fn devices(&self) -> Result<Vec<ProviderDevice>, ProviderError> {
        let checks: Vec<ApiCheck> = self.get_all(&["checks"]).await?;
        let tags: HashMap<i64, Vec<String>> = checks.into_iter().map(|c| (c.id, c.tags)).collect();

        let api_devices: Vec<ApiDevice> = self.get_all(&["devices"]).await?;
        let mut devices = Vec::with_capacity(api_devices.len());
        for device in api_devices {
            let id = device.id.to_string();
            let failures: Vec<ApiFailure> = self.get_all(&["devices", &id, "failures"]).await?;
            devices.push(ProviderDevice {
                serial: device.serial,
                platform: normalize_platform(&device.platform).to_string(),
                owner_email: device.assigned_owner.map(|o| o.email).unwrap_or_default(),
                last_seen: device.last_seen_at,
                failures: failures
                    .into_iter()
                    .map(|f| Failure {
                        tags: tags.get(&f.check_id).cloned().unwrap_or_default(),
                        check_id: f.check_id,
                        title: f.title,
                        timestamp: f.timestamp,
                        resolved_at: f.resolved_at,
                        ignored: f.ignored,
                    })
                    .collect(),
            });
        }
        debug!(devices = devices.len(), "Fetched device health from Kolide");
        Ok(devices)
    }
}

/// Map a provider platform name onto the enrollment platform names.
pub fn normalize_platform(platform: &str) -> &'static str {
    match platform.to_ascii_lowercase().as_str() {
        "darwin" => "darwin",
        "windows" => "windows",
        _ => "linux",
    }
}

/// How long a failing check may stay open before it makes the device
/// unhealthy. `None` means it never does.
fn grace_period(tags: &[String]) -> Option<Duration> {
    let mut severities = tags.iter().filter_map(|t| match t.to_ascii_lowercase().as_str() {
        "critical" => Some(Some(Duration::hours(1))),
        "danger" => Some(Some(Duration::hours(24))),
        "warning" => Some(Some(Duration::days(7))),
        "notice" => Some(Some(Duration::days(30))),
        "info" => Some(None),
        _ => None,
    });

    let first = match severities.next() {
        Some(grace) => grace,
        None => return Some(Duration::hours(24)),
    };
    // The most severe tag wins.
    severities.fold(first, |acc, grace| match (acc, grace) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) | (None, Some(a)) => Some(a),
        (None, None) => None,
    })
}

impl Failure {
    /// Whether this failure alone makes its device unhealthy at `now`.
    pub fn blocks_access(&self, now: DateTime<Utc>) -> bool {
        if self.ignored || self.resolved_at.is_some() {
            return false;
        }
        let Some(grace) = grace_period(&self.tags) else {
            return false;
        };
        // An undated failure is treated as long overdue.
        self.timestamp.is_none_or(|since| now - since > grace)
    }
}

pub fn is_healthy(failures: &[Failure], now: DateTime<Utc>) -> bool {
    !failures.iter().any(|f| f.blocks_access(now))
}
