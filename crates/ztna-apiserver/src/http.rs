//! Legacy HTTP/JSON surface for clients not yet on the gRPC path.
//!
//! Responses are single snapshots; there is no push over HTTP.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use ztna_proto::v1::DeviceConfigurationStatus;

use crate::auth::admin::parse_basic_auth;
use crate::auth::authenticator::generate_session_key;
use crate::auth::{AdminCredentials, AuthError, Authenticator, password};
use crate::distribution::ConfigDistributor;
use crate::storage::{DatabaseError, Device, Gateway, Session};

/// Header carrying the session key on `/deviceconfig`.
pub const SESSION_KEY_HEADER: &str = "x-ztna-session-key";

#[derive(Clone)]
pub struct HttpState {
    pub distributor: Arc<ConfigDistributor>,
    pub authenticator: Arc<Authenticator>,
    pub admin: Arc<AdminCredentials>,
    pub redirect_uri: String,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/devices", get(devices))
        .route("/gateways", get(gateways))
        .route("/gatewayconfig", get(gateway_config))
        .route("/deviceconfig", get(device_config))
        .route("/login", get(login))
        .route("/authurl", get(auth_url))
        .with_state(state)
}

#[derive(Debug)]
pub struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<DatabaseError> for HttpError {
    fn from(e: DatabaseError) -> Self {
        match e {
            DatabaseError::NotFound(what) => Self::new(StatusCode::NOT_FOUND, format!("{what} not found")),
            DatabaseError::Conflict(msg) => Self::new(StatusCode::CONFLICT, msg),
            DatabaseError::ExhaustedPool(msg) => Self::new(StatusCode::INSUFFICIENT_STORAGE, msg),
            other => {
                warn!(error = %other, "Storage error");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            }
        }
    }
}

impl From<AuthError> for HttpError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Storage(db) => db.into(),
            AuthError::KeySet(_) => Self::new(StatusCode::SERVICE_UNAVAILABLE, "Identity provider unavailable"),
            AuthError::Config(msg) => {
                warn!(error = %msg, "Identity provider misconfigured");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
            }
            other => Self::unauthorized(other.to_string()),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn require_admin(state: &HttpState, headers: &HeaderMap) -> Result<(), HttpError> {
    let ok = header_str(headers, header::AUTHORIZATION).is_some_and(|h| state.admin.verify_header(h));
    if ok {
        Ok(())
    } else {
        Err(HttpError::unauthorized("Invalid admin credentials"))
    }
}

/// `GET /devices`
async fn devices(State(state): State<HttpState>, headers: HeaderMap) -> Result<Json<Vec<Device>>, HttpError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.distributor.db().read_devices().await?))
}

/// `GET /gateways`
async fn gateways(State(state): State<HttpState>, headers: HeaderMap) -> Result<Json<Vec<Gateway>>, HttpError> {
    require_admin(&state, &headers)?;
    Ok(Json(state.distributor.db().read_gateways().await?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayConfigBody {
    pub devices: Vec<Device>,
    pub routes: Vec<String>,
}

/// `GET /gatewayconfig`, Basic-authenticated as `gateway:password`.
async fn gateway_config(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> Result<Json<GatewayConfigBody>, HttpError> {
    let (name, pass) = header_str(&headers, header::AUTHORIZATION)
        .and_then(parse_basic_auth)
        .ok_or_else(|| HttpError::unauthorized("Missing gateway credentials"))?;

    let gateway = match state.distributor.db().read_gateway_by_name(&name).await {
        Ok(gateway) => gateway,
        Err(DatabaseError::NotFound(_)) => return Err(HttpError::unauthorized("Invalid gateway credentials")),
        Err(e) => return Err(e.into()),
    };
    if !password::verify_password(&gateway.name, &pass, &gateway.password_hash) {
        return Err(HttpError::unauthorized("Invalid gateway credentials"));
    }

    Ok(Json(GatewayConfigBody {
        devices: state.distributor.gateway_devices(&gateway).await,
        routes: gateway.routes,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceConfigBody {
    pub status: String,
    pub gateways: Vec<Gateway>,
}

/// `GET /deviceconfig` with the session key in [`SESSION_KEY_HEADER`].
async fn device_config(
    State(state): State<HttpState>,
    headers: HeaderMap,
) -> Result<Json<DeviceConfigBody>, HttpError> {
    let key = header_str(&headers, SESSION_KEY_HEADER)
        .ok_or_else(|| HttpError::unauthorized("Missing session key"))?;

    let config = state.distributor.device_configuration(key).await?;
    let status = DeviceConfigurationStatus::try_from(config.status)
        .unwrap_or(DeviceConfigurationStatus::InvalidSession);
    if status == DeviceConfigurationStatus::InvalidSession {
        return Err(HttpError::new(StatusCode::FORBIDDEN, "Invalid session"));
    }

    // Full records carry ip, endpoint and public key, which the proto copy does too.
    let names: Vec<&str> = config.gateways.iter().map(|g| g.name.as_str()).collect();
    let mut gateways = state.distributor.db().read_gateways().await?;
    gateways.retain(|g| names.contains(&g.name.as_str()));

    Ok(Json(DeviceConfigBody {
        status: status.as_str_name().to_string(),
        gateways,
    }))
}

#[derive(Debug, Deserialize)]
struct LoginParams {
    serial: String,
    platform: String,
}

/// `GET /login?serial=..&platform=..` with `Authorization: Bearer <id token>`.
async fn login(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(params): Query<LoginParams>,
) -> Result<Json<Session>, HttpError> {
    let token = header_str(&headers, header::AUTHORIZATION)
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(|| HttpError::unauthorized("Missing bearer token"))?;

    let session = state
        .authenticator
        .login(token, &params.serial, &params.platform)
        .await?;
    state.distributor.session_added(&session).await;
    Ok(Json(session))
}

/// `GET /authurl`
async fn auth_url(State(state): State<HttpState>) -> Result<Json<serde_json::Value>, HttpError> {
    let nonce = generate_session_key();
    let url = state
        .authenticator
        .provider()
        .authorization_url(&state.redirect_uri, &nonce)?;
    Ok(Json(json!({ "url": url, "state": nonce })))
}
