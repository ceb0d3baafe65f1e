//! ZTNA control plane server
//!
//! Authenticates devices, tracks device and gateway configuration streams
//! and pushes WireGuard peer lists whenever access changes.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing::{info, warn};

use ztna_proto::v1::admin_service_server::AdminServiceServer;
use ztna_proto::v1::device_service_server::DeviceServiceServer;
use ztna_proto::v1::gateway_service_server::GatewayServiceServer;

use ztna_apiserver::auth::{
    AdminCredentials, Authenticator, ConsumerProvider, EnterpriseProvider, IdentityProvider,
};
use ztna_apiserver::config::{Config, IdentitySettings};
use ztna_apiserver::distribution::ConfigDistributor;
use ztna_apiserver::http::{HttpState, build_router};
use ztna_apiserver::jobs;
use ztna_apiserver::providers::{JitaCache, JitaClient, KolideClient};
use ztna_apiserver::server::{
    AdminServiceImpl, DeviceServiceImpl, GatewayServiceImpl, admin_interceptor,
};
use ztna_apiserver::sessions::SessionStore;
use ztna_apiserver::storage::Database;
use ztna_core::tracing_init::{DEFAULT_FILTER, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(DEFAULT_FILTER, config.log_json)?;

    // reqwest is built with rustls-no-provider; Err means already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        grpc_addr = %config.grpc_addr,
        "Starting ztna-apiserver"
    );

    let provider: Arc<dyn IdentityProvider> = match config.identity_settings()? {
        IdentitySettings::Enterprise(settings) => Arc::new(EnterpriseProvider::new(settings)?),
        IdentitySettings::Consumer(settings) => Arc::new(ConsumerProvider::new(settings)?),
    };
    let required_group = config.required_group()?;

    let db_path = config.db_path()?;
    info!(path = %db_path.display(), "Opening control plane database");
    let db = Database::open(&db_path, config.ip_allocator()?).await?;

    let sessions = Arc::new(SessionStore::new(db.clone()));
    sessions.warmup().await?;

    let privileged = match config.jita_settings()? {
        Some(jita) => {
            info!(url = %jita.url, "Privileged access enabled");
            let client = JitaClient::new(&jita.url, jita.username, jita.password)?;
            Arc::new(JitaCache::new(Arc::new(client)))
        }
        None => {
            warn!("No JITA url configured, privileged gateways will admit nobody");
            Arc::new(JitaCache::disabled())
        }
    };

    let distributor = Arc::new(ConfigDistributor::new(
        db.clone(),
        Arc::clone(&sessions),
        Arc::clone(&privileged),
    ));
    let authenticator = Arc::new(Authenticator::new(
        provider,
        db.clone(),
        Arc::clone(&sessions),
        required_group,
        config.session_ttl,
    ));
    let admin = Arc::new(AdminCredentials::new(
        &config.admin_username,
        &config.admin_password,
    ));

    // Background jobs
    if let Some(token) = &config.kolide_api_token {
        let kolide = KolideClient::new(&config.kolide_url, token.clone())?;
        jobs::spawn_health_sync(
            Arc::clone(&distributor),
            Arc::new(kolide),
            config.health_sync_period(),
        );
        info!(url = %config.kolide_url, "Health sync enabled");
    } else {
        warn!("No Kolide API token configured, device health is only set at enrollment");
    }
    if privileged.is_enabled() {
        jobs::spawn_privileged_refresh(Arc::clone(&distributor), config.jita_refresh_period());
    }
    jobs::spawn_expiry_watch(Arc::clone(&distributor));
    jobs::spawn_session_cleanup(Arc::clone(&distributor), config.session_cleanup_period());

    if let Some(http_addr) = config.http_addr {
        let router = build_router(HttpState {
            distributor: Arc::clone(&distributor),
            authenticator: Arc::clone(&authenticator),
            admin: Arc::clone(&admin),
            redirect_uri: config.auth_redirect_uri.clone(),
        });
        let listener = tokio::net::TcpListener::bind(http_addr).await?;
        info!(addr = %http_addr, "Legacy HTTP surface listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "Legacy HTTP surface stopped");
            }
        });
    }

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<DeviceServiceServer<DeviceServiceImpl>>()
        .await;
    health_reporter
        .set_serving::<GatewayServiceServer<GatewayServiceImpl>>()
        .await;

    let device = DeviceServiceImpl::new(Arc::clone(&authenticator), Arc::clone(&distributor));
    let gateway = GatewayServiceImpl::new(Arc::clone(&distributor));
    let admin_svc = AdminServiceImpl::new(Arc::clone(&distributor));

    let grpc_router = Server::builder()
        .http2_keepalive_interval(Some(Duration::from_secs(30)))
        .http2_keepalive_timeout(Some(Duration::from_secs(10)))
        .add_service(health_service)
        .add_service(DeviceServiceServer::new(device))
        .add_service(GatewayServiceServer::new(gateway))
        .add_service(AdminServiceServer::with_interceptor(
            admin_svc,
            admin_interceptor(admin),
        ));

    info!(addr = %config.grpc_addr, "gRPC server starting (plaintext)");
    tokio::select! {
        result = grpc_router.serve(config.grpc_addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Control plane stopped");
    Ok(())
}
