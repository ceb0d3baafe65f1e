//! Background jobs: device health sync, privileged access refresh, session
//! expiry and expired session cleanup.
//!
//! Every job writes through [`ConfigDistributor`] so the affected streams
//! are pushed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::distribution::ConfigDistributor;
use crate::providers::kolide::{is_healthy, normalize_platform};
use crate::providers::{HealthSource, ProviderDevice, ProviderError};
use crate::storage::{DatabaseError, Device};
use ztna_core::db::unix_timestamp;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

fn match_key(serial: &str, platform: &str) -> (String, &'static str) {
    (serial.to_uppercase(), normalize_platform(platform))
}

/// Compare stored devices against the provider's view and return the devices
/// whose health flag flips, stamped with `now`.
///
/// A device the provider does not know about is unhealthy.
pub fn health_changes(stored: &[Device], reported: &[ProviderDevice], now: DateTime<Utc>) -> Vec<Device> {
    let by_key: HashMap<_, _> = reported
        .iter()
        .map(|d| (match_key(&d.serial, &d.platform), d))
        .collect();

    let mut changed = Vec::new();
    for device in stored {
        let report = by_key.get(&match_key(&device.serial, &device.platform));
        let healthy = report.is_some_and(|r| is_healthy(&r.failures, now));
        if healthy == device.healthy {
            continue;
        }
        if report.is_none() {
            debug!(device_id = device.id, serial = %device.serial, "Device unknown to health provider");
        }

        let mut updated = device.clone();
        updated.healthy = healthy;
        updated.last_updated = Some(now.timestamp());
        if let Some(seen) = report.and_then(|r| r.last_seen) {
            updated.last_seen = Some(seen.timestamp());
        }
        changed.push(updated);
    }
    changed
}

/// One health sync pass. Returns the number of devices whose health changed.
pub async fn sync_health(distributor: &ConfigDistributor, source: &dyn HealthSource) -> Result<usize, JobError> {
    let reported = source.devices().await?;
    let stored = distributor.db().read_devices().await?;
    let changes = health_changes(&stored, &reported, Utc::now());
    if changes.is_empty() {
        return Ok(0);
    }
    for device in &changes {
        info!(device_id = device.id, serial = %device.serial, healthy = device.healthy, "Device health changed");
    }
    Ok(distributor.update_device_health(&changes).await?)
}

/// One privileged access refresh pass. Returns the gateways that were pushed.
pub async fn refresh_privileged(distributor: &ConfigDistributor) -> Result<Vec<String>, JobError> {
    let gateways: Vec<String> = distributor
        .db()
        .read_gateways()
        .await?
        .into_iter()
        .filter(|g| g.requires_privileged_access)
        .map(|g| g.name)
        .collect();
    let changed = distributor.privileged().refresh(&gateways).await;
    distributor.privileged_access_changed(&changed).await;
    Ok(changed)
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

pub fn spawn_health_sync(
    distributor: Arc<ConfigDistributor>,
    source: Arc<dyn HealthSource>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            interval.tick().await;
            match sync_health(&distributor, source.as_ref()).await {
                Ok(changed) if changed > 0 => info!(changed, "Health sync completed"),
                Ok(_) => {}
                Err(e) => error!(provider = "kolide", error = %e, "Health sync failed"),
            }
        }
    })
}

pub fn spawn_privileged_refresh(distributor: Arc<ConfigDistributor>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            interval.tick().await;
            if let Err(e) = refresh_privileged(&distributor).await {
                warn!(error = %e, "Privileged access refresh failed");
            }
        }
    })
}

/// Revoke access as sessions expire. The cleanup job only deletes rows.
pub fn spawn_expiry_watch(distributor: Arc<ConfigDistributor>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move { distributor.watch_expiry().await })
}

pub fn spawn_session_cleanup(distributor: Arc<ConfigDistributor>, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(period);
        interval.tick().await; // Skip first immediate tick
        loop {
            interval.tick().await;
            match distributor.remove_expired_sessions(unix_timestamp()).await {
                Ok(removed) if removed > 0 => info!(removed, "Expired session cleanup completed"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Expired session cleanup failed"),
            }
        }
    })
}
