//! End-to-end tests over a real gRPC listener.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::Code;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::Interceptor;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::{Channel, Server};

use ztna_proto::v1::admin_service_client::AdminServiceClient;
use ztna_proto::v1::admin_service_server::AdminServiceServer;
use ztna_proto::v1::device_service_client::DeviceServiceClient;
use ztna_proto::v1::device_service_server::DeviceServiceServer;
use ztna_proto::v1::gateway_service_client::GatewayServiceClient;
use ztna_proto::v1::gateway_service_server::GatewayServiceServer;
use ztna_proto::v1::{
    DeviceConfigurationStatus, EnrollDeviceRequest, Gateway, GetDeviceConfigurationRequest,
    GetGatewayConfigurationRequest, ListSessionsRequest, LoginRequest, ModifyGatewayRequest,
};

use ztna_apiserver::auth::admin::basic_auth_header;
use ztna_apiserver::auth::jwks::StaticKeySet;
use ztna_apiserver::auth::{AdminCredentials, Authenticator, EnterpriseConfig, EnterpriseProvider};
use ztna_apiserver::distribution::ConfigDistributor;
use ztna_apiserver::ip::IpAllocator;
use ztna_apiserver::providers::JitaCache;
use ztna_apiserver::server::{
    AdminServiceImpl, DeviceServiceImpl, GatewayServiceImpl, admin_interceptor,
};
use ztna_apiserver::sessions::SessionStore;
use ztna_apiserver::storage::{Database, NewDevice};

const PRIVATE_KEY_PEM: &str = include_str!("../testdata/identity_rsa.pem");
const JWKS_JSON: &str = include_str!("../testdata/identity_jwks.json");
const POLICY_GROUP: &str = "aup-accepted";

fn enterprise_config() -> EnterpriseConfig {
    EnterpriseConfig {
        tenant_id: "tenant".into(),
        client_id: "client".into(),
        authority_url: "https://login.test".into(),
        jwks_url: None,
    }
}

fn id_token(subject: &str, groups: &[&str]) -> String {
    let now = ztna_core::unix_timestamp();
    let claims = json!({
        "oid": subject,
        "sub": subject,
        "preferred_username": "ser-1@example.com",
        "iss": "https://login.test/tenant/v2.0",
        "aud": "client",
        "iat": now,
        "exp": now + 600,
        "groups": groups,
    });
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("test-signing-key".into());
    let key = EncodingKey::from_rsa_pem(PRIVATE_KEY_PEM.as_bytes()).unwrap();
    jsonwebtoken::encode(&header, &claims, &key).unwrap()
}

struct Running {
    addr: SocketAddr,
    db: Database,
}

async fn start(db: Database) -> Running {
    let sessions = Arc::new(SessionStore::new(db.clone()));
    sessions.warmup().await.unwrap();
    let distributor = Arc::new(ConfigDistributor::new(
        db.clone(),
        Arc::clone(&sessions),
        Arc::new(JitaCache::disabled()),
    ));

    let keys: JwkSet = serde_json::from_str(JWKS_JSON).unwrap();
    let provider =
        EnterpriseProvider::with_key_source(enterprise_config(), Arc::new(StaticKeySet::new(keys)))
            .unwrap();
    let authenticator = Arc::new(Authenticator::new(
        Arc::new(provider),
        db.clone(),
        Arc::clone(&sessions),
        POLICY_GROUP,
        3600,
    ));
    let admin = Arc::new(AdminCredentials::new("admin", "admin-pw"));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Server::builder()
        .add_service(DeviceServiceServer::new(DeviceServiceImpl::new(
            authenticator,
            Arc::clone(&distributor),
        )))
        .add_service(GatewayServiceServer::new(GatewayServiceImpl::new(
            Arc::clone(&distributor),
        )))
        .add_service(AdminServiceServer::with_interceptor(
            AdminServiceImpl::new(distributor),
            admin_interceptor(admin),
        ));
    tokio::spawn(router.serve_with_incoming(TcpListenerStream::new(listener)));

    Running { addr, db }
}

async fn channel(addr: SocketAddr) -> Channel {
    Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap()
}

#[derive(Clone)]
struct AdminAuth(MetadataValue<Ascii>);

impl Interceptor for AdminAuth {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        req.metadata_mut().insert("authorization", self.0.clone());
        Ok(req)
    }
}

async fn admin_client(addr: SocketAddr) -> AdminServiceClient<InterceptedService<Channel, AdminAuth>> {
    let value = basic_auth_header("admin", "admin-pw").parse().unwrap();
    AdminServiceClient::with_interceptor(channel(addr).await, AdminAuth(value))
}

async fn next<T>(stream: &mut tonic::Streaming<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream produced nothing")
        .expect("stream ended")
        .expect("stream yielded an error")
}

fn gateway(name: &str, groups: &[&str]) -> Gateway {
    Gateway {
        name: name.into(),
        public_key: format!("gw-pk-{name}"),
        endpoint: "198.51.100.10:51820".into(),
        access_group_ids: groups.iter().map(|g| (*g).to_string()).collect(),
        routes: vec!["10.20.0.0/16".into()],
        ..Default::default()
    }
}

#[tokio::test]
async fn login_is_pushed_to_connected_gateway() {
    let running = start(Database::open_in_memory().await.unwrap()).await;
    let mut admin = admin_client(running.addr).await;

    let enrolled = admin
        .enroll_gateway(ModifyGatewayRequest {
            gateway: Some(gateway("gw", &["eng"])),
            password: "gw-pw".into(),
        })
        .await
        .unwrap()
        .into_inner()
        .gateway
        .unwrap();
    assert!(!enrolled.ip.is_empty());

    let device = admin
        .enroll_device(EnrollDeviceRequest {
            serial: "SER-1".into(),
            platform: "linux".into(),
            username: "ser-1@example.com".into(),
            public_key: "pk-ser-1".into(),
            healthy: Some(true),
        })
        .await
        .unwrap()
        .into_inner()
        .device
        .unwrap();

    let mut gateways = GatewayServiceClient::new(channel(running.addr).await);
    let mut gw_stream = gateways
        .get_gateway_configuration(GetGatewayConfigurationRequest {
            gateway: "gw".into(),
            password: "gw-pw".into(),
        })
        .await
        .unwrap()
        .into_inner();
    let initial = next(&mut gw_stream).await;
    assert!(initial.devices.is_empty());
    assert_eq!(initial.routes, vec!["10.20.0.0/16"]);

    let mut devices = DeviceServiceClient::new(channel(running.addr).await);
    let session = devices
        .login(LoginRequest {
            token: id_token("oid-1", &[POLICY_GROUP, "eng"]),
            serial: "SER-1".into(),
            platform: "linux".into(),
        })
        .await
        .unwrap()
        .into_inner()
        .session
        .unwrap();

    let pushed = next(&mut gw_stream).await;
    assert_eq!(pushed.devices.len(), 1);
    assert_eq!(pushed.devices[0].public_key, device.public_key);

    let mut dev_stream = devices
        .get_device_configuration(GetDeviceConfigurationRequest {
            session_key: session.key,
        })
        .await
        .unwrap()
        .into_inner();
    let config = next(&mut dev_stream).await;
    assert_eq!(config.status, DeviceConfigurationStatus::DeviceHealthy as i32);
    assert_eq!(config.gateways.len(), 1);
    assert_eq!(config.gateways[0].ip, enrolled.ip);

    let listed = admin
        .list_sessions(ListSessionsRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(listed.sessions.len(), 1);
}

#[tokio::test]
async fn rejected_credentials() {
    let running = start(Database::open_in_memory().await.unwrap()).await;

    let mut anonymous = AdminServiceClient::new(channel(running.addr).await);
    let err = anonymous
        .list_sessions(ListSessionsRequest {})
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let mut admin = admin_client(running.addr).await;
    admin
        .enroll_gateway(ModifyGatewayRequest {
            gateway: Some(gateway("gw", &["eng"])),
            password: "gw-pw".into(),
        })
        .await
        .unwrap();

    let mut gateways = GatewayServiceClient::new(channel(running.addr).await);
    let err = gateways
        .get_gateway_configuration(GetGatewayConfigurationRequest {
            gateway: "gw".into(),
            password: "nope".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    // Device was never enrolled.
    let mut devices = DeviceServiceClient::new(channel(running.addr).await);
    let err = devices
        .login(LoginRequest {
            token: id_token("oid-1", &[POLICY_GROUP]),
            serial: "SER-404".into(),
            platform: "linux".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn sessions_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("apiserver.db");
    let allocator = || IpAllocator::new("10.255.240.0/21", [Ipv4Addr::new(10, 255, 240, 1)]).unwrap();

    let session_key = {
        let db = Database::open(&path, allocator()).await.unwrap();
        db.add_device(&NewDevice {
            serial: "SER-1".into(),
            platform: "linux".into(),
            username: "ser-1@example.com".into(),
            public_key: "pk-ser-1".into(),
            healthy: Some(true),
        })
        .await
        .unwrap();
        let running = start(db).await;
        let mut devices = DeviceServiceClient::new(channel(running.addr).await);
        devices
            .login(LoginRequest {
                token: id_token("oid-1", &[POLICY_GROUP]),
                serial: "SER-1".into(),
                platform: "linux".into(),
            })
            .await
            .unwrap()
            .into_inner()
            .session
            .unwrap()
            .key
    };

    let db = Database::open(&path, allocator()).await.unwrap();
    let restored = db.read_session_info(&session_key).await.unwrap();
    assert_eq!(restored.device.serial, "SER-1");

    let running = start(db).await;
    let mut devices = DeviceServiceClient::new(channel(running.addr).await);
    let mut stream = devices
        .get_device_configuration(GetDeviceConfigurationRequest { session_key })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(
        next(&mut stream).await.status,
        DeviceConfigurationStatus::DeviceHealthy as i32
    );
    assert_eq!(running.db.read_devices().await.unwrap().len(), 1);
}
