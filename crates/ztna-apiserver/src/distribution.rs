//! Configuration distribution engine.
//!
//! Owns the device and gateway stream registries and every state mutation
//! that can change a pushed configuration. Each mutation persists first and
//! then pushes to exactly the streams whose configuration may have changed.
//! There is no periodic reconciliation, so nothing else may write devices,
//! gateways or sessions behind this type's back. The one clock-driven push is
//! session expiry, see [`ConfigDistributor::watch_expiry`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;
use tracing::{debug, error, info, instrument, warn};

use ztna_proto::v1::{
    DeviceConfigurationStatus, GetDeviceConfigurationResponse, GetGatewayConfigurationResponse,
};

use crate::filter;
use crate::providers::JitaCache;
use crate::registry::{SendError, StreamHandle, StreamRegistry};
use crate::server::convert::{device_to_proto, gateway_to_proto};
use crate::sessions::{SessionStore, key_prefix};
use crate::storage::{
    Database, DatabaseError, Device, Gateway, GatewayDynamicFields, GatewayParams, NewDevice,
    Session,
};
use ztna_core::db::unix_timestamp;

const STREAM_BUFFER: usize = 16;

pub type ConfigStream<T> = ReceiverStream<Result<T, Status>>;
type DeviceHandle = StreamHandle<GetDeviceConfigurationResponse>;
type GatewayHandle = StreamHandle<GetGatewayConfigurationResponse>;

#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
    #[error("Gateway {0} already has an open configuration stream")]
    AlreadyConnected(String),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

pub struct ConfigDistributor {
    db: Database,
    sessions: Arc<SessionStore>,
    privileged: Arc<JitaCache>,
    device_streams: StreamRegistry<GetDeviceConfigurationResponse>,
    gateway_streams: StreamRegistry<GetGatewayConfigurationResponse>,
    /// Wakes [`ConfigDistributor::watch_expiry`] when a session is added.
    session_added: Notify,
}

impl ConfigDistributor {
    pub fn new(db: Database, sessions: Arc<SessionStore>, privileged: Arc<JitaCache>) -> Self {
        Self {
            db,
            sessions,
            privileged,
            device_streams: StreamRegistry::new("device"),
            gateway_streams: StreamRegistry::new("gateway"),
            session_added: Notify::new(),
        }
    }

    pub const fn db(&self) -> &Database {
        &self.db
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn privileged(&self) -> &JitaCache {
        &self.privileged
    }

    // ── Stream lifecycle ───────────────────────────────────────────────

    /// Open a device configuration stream.
    ///
    /// An unknown or expired session gets a single `InvalidSession` message
    /// and a stream that is never registered.
    #[instrument(skip(self, session_key), fields(session = %key_prefix(session_key)))]
    pub async fn connect_device(
        &self,
        session_key: &str,
    ) -> Result<ConfigStream<GetDeviceConfigurationResponse>, DistributionError> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        if self.live_session(session_key).await?.is_none() {
            info!("Rejected device stream, invalid session");
            let _ = tx.send(Ok(invalid_session())).await;
            return Ok(ReceiverStream::new(rx));
        }

        let watch = tx.clone();
        let handle = self
            .device_streams
            .register(session_key, key_prefix(session_key), tx)
            .await;
        self.push_device_handle(&handle).await;
        self.spawn_unregister(&self.device_streams, &handle, watch);
        Ok(ReceiverStream::new(rx))
    }

    /// Open a gateway configuration stream. Credentials must already be
    /// verified. At most one stream per gateway is accepted.
    #[instrument(skip(self))]
    pub async fn connect_gateway(
        &self,
        name: &str,
    ) -> Result<ConfigStream<GetGatewayConfigurationResponse>, DistributionError> {
        // Fail with NotFound before touching the registry.
        self.db.read_gateway_by_name(name).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let watch = tx.clone();
        let handle = self
            .gateway_streams
            .register_exclusive(name, tx)
            .await
            .map_err(|e| {
                warn!(gateway = %name, "Rejected second gateway stream");
                DistributionError::AlreadyConnected(e.0)
            })?;
        self.push_gateway_handle(&handle).await;
        self.spawn_unregister(&self.gateway_streams, &handle, watch);
        Ok(ReceiverStream::new(rx))
    }

    /// Remove the registry entry once the client side of the stream is gone.
    fn spawn_unregister<T: Send + Sync + 'static>(
        &self,
        registry: &StreamRegistry<T>,
        handle: &StreamHandle<T>,
        watch: mpsc::Sender<Result<T, Status>>,
    ) {
        let registry = registry.clone();
        let key = handle.key.clone();
        let conn_id = handle.conn_id;
        tokio::spawn(async move {
            watch.closed().await;
            registry.unregister(&key, conn_id).await;
        });
    }

    pub async fn is_gateway_connected(&self, name: &str) -> bool {
        self.gateway_streams.is_connected(name).await
    }

    pub async fn device_stream_count(&self) -> usize {
        self.device_streams.connection_count().await
    }

    pub async fn gateway_stream_count(&self) -> usize {
        self.gateway_streams.connection_count().await
    }

    // ── Configuration computation ──────────────────────────────────────

    async fn live_session(&self, key: &str) -> Result<Option<Session>, DatabaseError> {
        match self.sessions.get(key).await {
            Ok(session) if !session.expired() => Ok(Some(session)),
            Ok(_) | Err(DatabaseError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// What a device holding `session_key` should see right now.
    pub async fn device_configuration(
        &self,
        session_key: &str,
    ) -> Result<GetDeviceConfigurationResponse, DatabaseError> {
        let Some(session) = self.live_session(session_key).await? else {
            return Ok(invalid_session());
        };
        if !session.device.healthy {
            return Ok(GetDeviceConfigurationResponse {
                status: DeviceConfigurationStatus::DeviceUnhealthy as i32,
                gateways: Vec::new(),
            });
        }

        let gateways = self.db.read_gateways().await?;
        Ok(GetDeviceConfigurationResponse {
            status: DeviceConfigurationStatus::DeviceHealthy as i32,
            gateways: filter::gateways_for_session(&session, &gateways)
                .iter()
                .map(gateway_to_proto)
                .collect(),
        })
    }

    /// The devices `gateway` should currently admit.
    pub async fn gateway_devices(&self, gateway: &Gateway) -> Vec<Device> {
        let sessions = self.sessions.all().await;
        let privileged = if gateway.requires_privileged_access {
            match self.privileged.get(&gateway.name).await {
                Ok(subjects) => Some(subjects),
                Err(e) if self.privileged.is_enabled() => {
                    error!(gateway = %gateway.name, provider = "jita", error = %e, "No privileged access list, admitting no devices");
                    None
                }
                Err(_) => {
                    debug!(gateway = %gateway.name, "Privileged access provider disabled, admitting no devices");
                    None
                }
            }
        } else {
            None
        };
        filter::devices_for_gateway(gateway, &sessions, privileged.as_ref(), unix_timestamp())
    }

    pub async fn gateway_configuration(&self, gateway: &Gateway) -> GetGatewayConfigurationResponse {
        GetGatewayConfigurationResponse {
            devices: self
                .gateway_devices(gateway)
                .await
                .iter()
                .map(device_to_proto)
                .collect(),
            routes: gateway.routes.clone(),
        }
    }

    // ── Pushes ─────────────────────────────────────────────────────────

    async fn push_device_handle(&self, handle: &DeviceHandle) {
        let _ordered = handle.lock().await;
        let config = match self.device_configuration(&handle.key).await {
            Ok(config) => config,
            Err(e) => {
                warn!(session = %key_prefix(&handle.key), error = %e, "Device configuration failed");
                return;
            }
        };
        let invalid = config.status == DeviceConfigurationStatus::InvalidSession as i32;
        log_send(
            "device",
            key_prefix(&handle.key),
            handle.send(config).await,
        );
        if invalid {
            self.device_streams.unregister(&handle.key, handle.conn_id).await;
        }
    }

    async fn push_gateway_handle(&self, handle: &GatewayHandle) {
        let _ordered = handle.lock().await;
        let gateway = match self.db.read_gateway_by_name(&handle.key).await {
            Ok(gateway) => gateway,
            Err(e) => {
                warn!(gateway = %handle.key, error = %e, "Gateway configuration failed");
                return;
            }
        };
        let config = self.gateway_configuration(&gateway).await;
        debug!(gateway = %gateway.name, devices = config.devices.len(), "Pushing gateway configuration");
        log_send("gateway", &handle.key, handle.send(config).await);
    }

    /// Recompute and push one gateway. A gateway without an open stream is skipped.
    pub async fn push_gateway(&self, name: &str) {
        match self.gateway_streams.get(name).await {
            Some(handle) => self.push_gateway_handle(&handle).await,
            None => debug!(gateway = %name, "Gateway not connected, skipping push"),
        }
    }

    pub async fn push_all_gateways(&self) {
        for handle in self.gateway_streams.snapshot().await {
            self.push_gateway_handle(&handle).await;
        }
    }

    pub async fn push_all_devices(&self) {
        for handle in self.device_streams.snapshot().await {
            self.push_device_handle(&handle).await;
        }
    }

    /// Push to every device stream whose session is no longer live. Each one
    /// receives `InvalidSession` and is unregistered.
    async fn push_expired_devices(&self) {
        for handle in self.device_streams.snapshot().await {
            if matches!(self.live_session(&handle.key).await, Ok(None)) {
                self.push_device_handle(&handle).await;
            }
        }
    }

    /// Push to every device stream whose session belongs to one of `device_ids`.
    async fn push_devices(&self, device_ids: &HashSet<i64>) {
        for handle in self.device_streams.snapshot().await {
            let owned = match self.sessions.get(&handle.key).await {
                Ok(session) => device_ids.contains(&session.device_id()),
                Err(_) => true,
            };
            if owned {
                self.push_device_handle(&handle).await;
            }
        }
    }

    // ── Mutate-then-notify entry points ────────────────────────────────

    /// A login persisted `session`; its device may now qualify everywhere.
    pub async fn session_added(&self, session: &Session) {
        debug!(session = %key_prefix(&session.key), device_id = session.device_id(), "Session added");
        self.session_added.notify_one();
        self.push_all_gateways().await;
    }

    /// Persist a batch of device health changes and propagate them.
    ///
    /// The batch is applied in one transaction; on failure nothing is
    /// persisted, cached or pushed.
    pub async fn update_device_health(&self, devices: &[Device]) -> Result<usize, DatabaseError> {
        if devices.is_empty() {
            return Ok(0);
        }
        self.db.update_devices(devices).await?;

        let mut ids = HashSet::with_capacity(devices.len());
        for device in devices {
            self.sessions.update_device(device).await;
            ids.insert(device.id);
        }
        info!(devices = devices.len(), "Device health updated");

        self.push_devices(&ids).await;
        self.push_all_gateways().await;
        Ok(devices.len())
    }

    /// Enroll or re-enroll a device.
    pub async fn enroll_device(&self, new: &NewDevice) -> Result<Device, DatabaseError> {
        let device = self.db.add_device(new).await?;
        info!(device_id = device.id, serial = %device.serial, platform = %device.platform, ip = %device.ip, "Device enrolled");

        if self.sessions.update_device(&device).await > 0 {
            self.push_devices(&HashSet::from([device.id])).await;
            self.push_all_gateways().await;
        }
        Ok(device)
    }

    pub async fn enroll_gateway(&self, params: &GatewayParams) -> Result<Gateway, DatabaseError> {
        let gateway = self.db.add_gateway(params).await?;
        info!(gateway = %gateway.name, ip = %gateway.ip, "Gateway enrolled");
        self.push_all_devices().await;
        Ok(gateway)
    }

    pub async fn update_gateway(&self, params: &GatewayParams) -> Result<Gateway, DatabaseError> {
        let gateway = self.db.update_gateway(params).await?;
        info!(gateway = %gateway.name, "Gateway updated");
        self.push_gateway(&gateway.name).await;
        self.push_all_devices().await;
        Ok(gateway)
    }

    pub async fn update_gateway_dynamic_fields(
        &self,
        name: &str,
        fields: &GatewayDynamicFields,
    ) -> Result<Gateway, DatabaseError> {
        let before = self.db.read_gateway_by_name(name).await?;
        let gateway = self.db.update_gateway_dynamic_fields(name, fields).await?;
        if before == gateway {
            debug!(gateway = %name, "Gateway dynamic fields unchanged");
            return Ok(gateway);
        }
        info!(gateway = %name, routes = gateway.routes.len(), groups = gateway.access_group_ids.len(), "Gateway dynamic fields updated");
        self.push_gateway(name).await;
        self.push_all_devices().await;
        Ok(gateway)
    }

    /// The privileged subject list of these gateways changed.
    pub async fn privileged_access_changed(&self, gateways: &[String]) {
        for name in gateways {
            self.push_gateway(name).await;
        }
    }

    /// Delete expired sessions and drop their devices from gateway configs.
    pub async fn remove_expired_sessions(&self, now: i64) -> Result<u64, DatabaseError> {
        let removed = self.sessions.remove_expired(now).await?;
        if removed > 0 {
            self.push_all_gateways().await;
        }
        Ok(removed)
    }

    /// Revoke access at the instant each session expires.
    ///
    /// Sleeps until the earliest live session expires, then pushes every
    /// gateway and the device streams holding expired sessions. A new session
    /// may expire sooner, so [`ConfigDistributor::session_added`] wakes the
    /// loop to recompute its deadline. Never returns.
    pub async fn watch_expiry(&self) {
        loop {
            // notify_one leaves a permit, so an add during this pass still wakes us.
            let added = self.session_added.notified();
            let earliest = self.sessions.all().await.first().map(|s| s.expiry);

            let Some(expiry) = earliest else {
                added.await;
                continue;
            };
            tokio::select! {
                () = tokio::time::sleep(until_expired(expiry)) => {
                    info!(expiry, "Session expired, revoking access");
                    self.push_expired_devices().await;
                    self.push_all_gateways().await;
                }
                () = added => {}
            }
        }
    }
}

/// Time left until a session with `expiry` fails [`Session::expired`].
fn until_expired(expiry: i64) -> Duration {
    let secs = u64::try_from(expiry.saturating_add(1)).unwrap_or(0);
    (UNIX_EPOCH + Duration::from_secs(secs))
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::ZERO)
}

fn invalid_session() -> GetDeviceConfigurationResponse {
    GetDeviceConfigurationResponse {
        status: DeviceConfigurationStatus::InvalidSession as i32,
        gateways: Vec::new(),
    }
}

fn log_send(kind: &'static str, key: &str, result: Result<(), SendError>) {
    match result {
        Ok(()) => {}
        // Its own disconnect path unregisters it.
        Err(SendError::Closed) => debug!(kind, key, "Stream gone, push dropped"),
        Err(SendError::Timeout) => warn!(kind, key, "Stream not draining, push dropped"),
    }
}
