//! Fixtures shared by the engine and service test modules.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use crate::distribution::{ConfigDistributor, ConfigStream};
use crate::providers::JitaCache;
use crate::sessions::SessionStore;
use crate::storage::{Database, Device, GatewayParams, NewDevice, Session};
use ztna_core::db::unix_timestamp;

pub struct Harness {
    pub db: Database,
    pub sessions: Arc<SessionStore>,
    pub distributor: Arc<ConfigDistributor>,
}

pub async fn harness() -> Harness {
    harness_with_jita(Arc::new(JitaCache::disabled())).await
}

pub async fn harness_with_jita(jita: Arc<JitaCache>) -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let sessions = Arc::new(SessionStore::new(db.clone()));
    let distributor = Arc::new(ConfigDistributor::new(
        db.clone(),
        Arc::clone(&sessions),
        jita,
    ));
    Harness {
        db,
        sessions,
        distributor,
    }
}

pub fn new_device(serial: &str, healthy: bool) -> NewDevice {
    NewDevice {
        serial: serial.into(),
        platform: "linux".into(),
        username: format!("{}@example.com", serial.to_lowercase()),
        public_key: format!("pk-{serial}"),
        healthy: Some(healthy),
    }
}

pub fn gateway_params(name: &str, groups: &[&str]) -> GatewayParams {
    GatewayParams {
        name: name.into(),
        public_key: format!("gw-pk-{name}"),
        endpoint: "198.51.100.10:51820".into(),
        access_group_ids: groups.iter().map(|g| (*g).to_string()).collect(),
        routes: vec!["10.20.0.0/16".into()],
        password_hash: crate::auth::password::hash_password("gw-secret").unwrap(),
        requires_privileged_access: false,
    }
}

impl Harness {
    pub async fn device(&self, serial: &str, healthy: bool) -> Device {
        self.db.add_device(&new_device(serial, healthy)).await.unwrap()
    }

    /// Persist and cache a one hour session, the way a login does.
    pub async fn login(&self, device: &Device, key: &str, groups: &[&str], subject: &str) -> Session {
        let session = Session {
            key: key.into(),
            expiry: unix_timestamp() + 3600,
            device: device.clone(),
            groups: groups.iter().map(|g| (*g).to_string()).collect(),
            object_id: subject.into(),
        };
        self.sessions.set(session).await.unwrap()
    }
}

/// Next message on a config stream, failing the test if none arrives soon.
pub async fn next<T>(stream: &mut ConfigStream<T>) -> T {
    next_within(stream, Duration::from_secs(2)).await
}

/// [`next`] with an explicit deadline, for pushes driven by the clock.
pub async fn next_within<T>(stream: &mut ConfigStream<T>, wait: Duration) -> T {
    tokio::time::timeout(wait, stream.next())
        .await
        .expect("stream produced nothing")
        .expect("stream ended")
        .expect("stream yielded an error")
}

/// True when nothing arrives within a short window.
pub async fn quiet<T>(stream: &mut ConfigStream<T>) -> bool {
    tokio::time::timeout(Duration::from_millis(100), stream.next())
        .await
        .is_err()
}
