//! Conversions between storage models and wire messages, and error mapping
//! onto gRPC status codes.

use tonic::Status;
use tracing::warn;

use ztna_proto::prost_types::Timestamp;
use ztna_proto::v1 as pb;

use crate::auth::AuthError;
use crate::distribution::DistributionError;
use crate::storage::{DatabaseError, Device, Gateway, GatewayDynamicFields, Session};

fn timestamp(secs: i64) -> Timestamp {
    Timestamp {
        seconds: secs,
        nanos: 0,
    }
}

pub fn device_to_proto(device: &Device) -> pb::Device {
    pb::Device {
        id: device.id,
        serial: device.serial.clone(),
        platform: device.platform.clone(),
        username: device.username.clone(),
        public_key: device.public_key.clone(),
        ip: device.ip.clone(),
        healthy: device.healthy,
        last_updated: device.last_updated.map(timestamp),
        last_seen: device.last_seen.map(timestamp),
    }
}

/// The password hash never leaves the server.
pub fn gateway_to_proto(gateway: &Gateway) -> pb::Gateway {
    pb::Gateway {
        name: gateway.name.clone(),
        public_key: gateway.public_key.clone(),
        endpoint: gateway.endpoint.clone(),
        ip: gateway.ip.clone(),
        access_group_ids: gateway.access_group_ids.clone(),
        routes: gateway.routes.clone(),
        requires_privileged_access: gateway.requires_privileged_access,
    }
}

pub fn session_to_proto(session: &Session) -> pb::Session {
    pb::Session {
        key: session.key.clone(),
        expiry: Some(timestamp(session.expiry)),
        device: Some(device_to_proto(&session.device)),
        groups: session.groups.clone(),
        object_id: session.object_id.clone(),
    }
}

pub fn dynamic_fields_from_proto(req: &pb::UpdateGatewayDynamicFieldsRequest) -> GatewayDynamicFields {
    GatewayDynamicFields {
        access_group_ids: req.access_group_ids.clone(),
        routes: req.routes.clone(),
        requires_privileged_access: req.requires_privileged_access,
    }
}

pub fn database_error_to_status(e: DatabaseError) -> Status {
    match e {
        DatabaseError::NotFound(what) => Status::not_found(format!("{what} not found")),
        DatabaseError::Conflict(msg) => Status::already_exists(msg),
        DatabaseError::ExhaustedPool(msg) => Status::resource_exhausted(msg),
        other => {
            warn!(error = %other, "Storage error");
            Status::internal("Internal error")
        }
    }
}

pub fn auth_error_to_status(e: AuthError) -> Status {
    match e {
        AuthError::KeySet(msg) => {
            warn!(error = %msg, "Identity provider keys unavailable");
            Status::unavailable("Identity provider unavailable")
        }
        AuthError::Storage(db) => database_error_to_status(db),
        AuthError::Config(msg) => {
            warn!(error = %msg, "Identity provider misconfigured");
            Status::internal("Internal error")
        }
        other @ (AuthError::InvalidToken(_)
        | AuthError::InvalidCredentials(_)
        | AuthError::MissingPolicyGroup(_)
        | AuthError::UnknownDevice { .. }) => Status::unauthenticated(other.to_string()),
    }
}

pub fn distribution_error_to_status(e: DistributionError) -> Status {
    match e {
        DistributionError::AlreadyConnected(name) => {
            Status::already_exists(format!("Gateway {name} is already connected"))
        }
        DistributionError::Storage(db) => database_error_to_status(db),
    }
}
