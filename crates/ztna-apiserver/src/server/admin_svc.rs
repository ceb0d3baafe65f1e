//! AdminService gRPC implementation.
//!
//! Served behind [`admin_interceptor`](super::admin_interceptor). Every write
//! goes through the distributor so connected streams see it.

use std::sync::Arc;

use ipnet::IpNet;
use tonic::{Request, Response, Status};
use tracing::{info, instrument};

use ztna_proto::v1 as pb;
use ztna_proto::v1::admin_service_server::AdminService;

use super::convert::{
    auth_error_to_status, database_error_to_status, device_to_proto, dynamic_fields_from_proto,
    gateway_to_proto, session_to_proto,
};
use crate::auth::password;
use crate::distribution::ConfigDistributor;
use crate::storage::{GatewayParams, NewDevice};

pub struct AdminServiceImpl {
    distributor: Arc<ConfigDistributor>,
}

impl AdminServiceImpl {
    pub const fn new(distributor: Arc<ConfigDistributor>) -> Self {
        Self { distributor }
    }
}

#[allow(clippy::result_large_err)]
fn validate_routes(routes: &[String]) -> Result<(), Status> {
    for route in routes {
        route
            .parse::<IpNet>()
            .map_err(|_| Status::invalid_argument(format!("Route {route} is not a CIDR")))?;
    }
    Ok(())
}

/// Identity and dynamic fields from the request. The tunnel IP is
/// server-assigned and ignored.
#[allow(clippy::result_large_err)]
fn gateway_params(gateway: Option<pb::Gateway>, password_hash: String) -> Result<GatewayParams, Status> {
    let gw = gateway.ok_or_else(|| Status::invalid_argument("gateway is required"))?;
    if gw.name.is_empty() {
        return Err(Status::invalid_argument("gateway name is required"));
    }
    if gw.public_key.is_empty() {
        return Err(Status::invalid_argument("gateway public key is required"));
    }
    validate_routes(&gw.routes)?;
    Ok(GatewayParams {
        name: gw.name,
        public_key: gw.public_key,
        endpoint: gw.endpoint,
        access_group_ids: gw.access_group_ids,
        routes: gw.routes,
        password_hash,
        requires_privileged_access: gw.requires_privileged_access,
    })
}

#[tonic::async_trait]
impl AdminService for AdminServiceImpl {
    #[instrument(skip(self, request), fields(rpc = "EnrollGateway"))]
    async fn enroll_gateway(
        &self,
        request: Request<pb::ModifyGatewayRequest>,
    ) -> Result<Response<pb::ModifyGatewayResponse>, Status> {
        let req = request.into_inner();
        if req.password.is_empty() {
            return Err(Status::invalid_argument("gateway password is required"));
        }
        let hash = password::hash_password(&req.password).map_err(auth_error_to_status)?;
        let params = gateway_params(req.gateway, hash)?;

        let gateway = self
            .distributor
            .enroll_gateway(&params)
            .await
            .map_err(database_error_to_status)?;
        Ok(Response::new(pb::ModifyGatewayResponse {
            gateway: Some(gateway_to_proto(&gateway)),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "UpdateGateway"))]
    async fn update_gateway(
        &self,
        request: Request<pb::ModifyGatewayRequest>,
    ) -> Result<Response<pb::ModifyGatewayResponse>, Status> {
        let req = request.into_inner();
        let mut params = gateway_params(req.gateway, String::new())?;

        // An empty password keeps the stored credential.
        params.password_hash = if req.password.is_empty() {
            self.distributor
                .db()
                .read_gateway_by_name(&params.name)
                .await
                .map_err(database_error_to_status)?
                .password_hash
        } else {
            password::hash_password(&req.password).map_err(auth_error_to_status)?
        };

        let gateway = self
            .distributor
            .update_gateway(&params)
            .await
            .map_err(database_error_to_status)?;
        Ok(Response::new(pb::ModifyGatewayResponse {
            gateway: Some(gateway_to_proto(&gateway)),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "UpdateGatewayDynamicFields"))]
    async fn update_gateway_dynamic_fields(
        &self,
        request: Request<pb::UpdateGatewayDynamicFieldsRequest>,
    ) -> Result<Response<pb::ModifyGatewayResponse>, Status> {
        let req = request.into_inner();
        validate_routes(&req.routes)?;
        let fields = dynamic_fields_from_proto(&req);

        let gateway = self
            .distributor
            .update_gateway_dynamic_fields(&req.name, &fields)
            .await
            .map_err(database_error_to_status)?;
        Ok(Response::new(pb::ModifyGatewayResponse {
            gateway: Some(gateway_to_proto(&gateway)),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "GetGateway"))]
    async fn get_gateway(
        &self,
        request: Request<pb::GetGatewayRequest>,
    ) -> Result<Response<pb::Gateway>, Status> {
        let name = request.into_inner().name;
        let gateway = self
            .distributor
            .db()
            .read_gateway_by_name(&name)
            .await
            .map_err(database_error_to_status)?;
        Ok(Response::new(gateway_to_proto(&gateway)))
    }

    #[instrument(skip(self, _request), fields(rpc = "ListGateways"))]
    async fn list_gateways(
        &self,
        _request: Request<pb::ListGatewaysRequest>,
    ) -> Result<Response<pb::ListGatewaysResponse>, Status> {
        let gateways = self
            .distributor
            .db()
            .read_gateways()
            .await
            .map_err(database_error_to_status)?;
        Ok(Response::new(pb::ListGatewaysResponse {
            gateways: gateways.iter().map(gateway_to_proto).collect(),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "EnrollDevice"))]
    async fn enroll_device(
        &self,
        request: Request<pb::EnrollDeviceRequest>,
    ) -> Result<Response<pb::EnrollDeviceResponse>, Status> {
        let req = request.into_inner();
        if req.serial.is_empty() || req.platform.is_empty() || req.public_key.is_empty() {
            return Err(Status::invalid_argument(
                "serial, platform and public key are required",
            ));
        }
        let new = NewDevice {
            serial: req.serial,
            platform: req.platform,
            username: req.username,
            public_key: req.public_key,
            healthy: req.healthy,
        };
        let device = self
            .distributor
            .enroll_device(&new)
            .await
            .map_err(database_error_to_status)?;
        info!(device_id = device.id, "Device enrolled by admin");
        Ok(Response::new(pb::EnrollDeviceResponse {
            device: Some(device_to_proto(&device)),
        }))
    }

    #[instrument(skip(self, _request), fields(rpc = "ListDevices"))]
    async fn list_devices(
        &self,
        _request: Request<pb::ListDevicesRequest>,
    ) -> Result<Response<pb::ListDevicesResponse>, Status> {
        let devices = self
            .distributor
            .db()
            .read_devices()
            .await
            .map_err(database_error_to_status)?;
        Ok(Response::new(pb::ListDevicesResponse {
            devices: devices.iter().map(device_to_proto).collect(),
        }))
    }

    #[instrument(skip(self, _request), fields(rpc = "ListSessions"))]
    async fn list_sessions(
        &self,
        _request: Request<pb::ListSessionsRequest>,
    ) -> Result<Response<pb::ListSessionsResponse>, Status> {
        let sessions = self.distributor.sessions().all().await;
        Ok(Response::new(pb::ListSessionsResponse {
            sessions: sessions.iter().map(session_to_proto).collect(),
        }))
    }
}
