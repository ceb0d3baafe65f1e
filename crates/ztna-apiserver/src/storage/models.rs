//! Data models for control plane storage.

use serde::{Deserialize, Serialize};

use ztna_core::db::{DatabaseError, unix_timestamp};

/// One enrolled end-user machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Device {
    pub id: i64,
    pub serial: String,
    pub platform: String,
    pub username: String,
    pub public_key: String,
    pub ip: String,
    pub healthy: bool,
    /// Last time health sync evaluated this device.
    pub last_updated: Option<i64>,
    /// Last time the health provider saw this device check in.
    pub last_seen: Option<i64>,
}

/// Input for [`Database::add_device`](super::Database::add_device).
///
/// `healthy: None` keeps the stored flag of an existing device and defaults
/// new devices to unhealthy.
#[derive(Debug, Clone, Default)]
pub struct NewDevice {
    pub serial: String,
    pub platform: String,
    pub username: String,
    pub public_key: String,
    pub healthy: Option<bool>,
}

/// An internal service endpoint reachable over the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gateway {
    pub name: String,
    pub public_key: String,
    pub endpoint: String,
    pub ip: String,
    pub access_group_ids: Vec<String>,
    pub routes: Vec<String>,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub requires_privileged_access: bool,
}

/// Every gateway field except the server-assigned tunnel IP.
#[derive(Debug, Clone, Default)]
pub struct GatewayParams {
    pub name: String,
    pub public_key: String,
    pub endpoint: String,
    pub access_group_ids: Vec<String>,
    pub routes: Vec<String>,
    pub password_hash: String,
    pub requires_privileged_access: bool,
}

/// Fields that external metadata sync rewrites often, independently of identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayDynamicFields {
    pub access_group_ids: Vec<String>,
    pub routes: Vec<String>,
    pub requires_privileged_access: bool,
}

/// An authenticated device login.
///
/// `device` is a cached copy valid as of the last session store refresh;
/// the device id is the authoritative reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    /// Unix timestamp after which the session no longer authorizes anything.
    pub expiry: i64,
    pub device: Device,
    /// Group memberships captured at login.
    pub groups: Vec<String>,
    /// Subject identifier from the identity provider.
    pub object_id: String,
}

impl Session {
    pub fn expired(&self) -> bool {
        self.expired_at(unix_timestamp())
    }

    pub const fn expired_at(&self, now: i64) -> bool {
        now > self.expiry
    }

    pub const fn device_id(&self) -> i64 {
        self.device.id
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct GatewayRow {
    pub name: String,
    pub public_key: String,
    pub endpoint: String,
    pub ip: String,
    pub access_group_ids: String,
    pub routes: String,
    pub password_hash: String,
    pub requires_privileged_access: bool,
}

impl TryFrom<GatewayRow> for Gateway {
    type Error = DatabaseError;

    fn try_from(row: GatewayRow) -> Result<Self, Self::Error> {
        Ok(Self {
            access_group_ids: decode_list(&row.access_group_ids, "gateway.access_group_ids")?,
            routes: decode_list(&row.routes, "gateway.routes")?,
            name: row.name,
            public_key: row.public_key,
            endpoint: row.endpoint,
            ip: row.ip,
            password_hash: row.password_hash,
            requires_privileged_access: row.requires_privileged_access,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(super) struct SessionRow {
    pub session_key: String,
    pub expiry: i64,
    pub group_ids: String,
    pub object_id: String,
    #[sqlx(flatten)]
    pub device: Device,
}

impl TryFrom<SessionRow> for Session {
    type Error = DatabaseError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            groups: decode_list(&row.group_ids, "session.group_ids")?,
            key: row.session_key,
            expiry: row.expiry,
            device: row.device,
            object_id: row.object_id,
        })
    }
}

pub(super) fn encode_list(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn decode_list(raw: &str, column: &str) -> Result<Vec<String>, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Corrupt(format!("{column}: {e}")))
}
