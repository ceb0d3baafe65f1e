//! DeviceService gRPC implementation.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{info, instrument};

use ztna_proto::v1::device_service_server::DeviceService;
use ztna_proto::v1::{
    GetDeviceConfigurationRequest, GetDeviceConfigurationResponse, LoginRequest, LoginResponse,
};

use super::convert::{auth_error_to_status, distribution_error_to_status, session_to_proto};
use crate::auth::Authenticator;
use crate::distribution::{ConfigDistributor, ConfigStream};
use crate::sessions::key_prefix;

pub struct DeviceServiceImpl {
    authenticator: Arc<Authenticator>,
    distributor: Arc<ConfigDistributor>,
}

impl DeviceServiceImpl {
    pub const fn new(authenticator: Arc<Authenticator>, distributor: Arc<ConfigDistributor>) -> Self {
        Self {
            authenticator,
            distributor,
        }
    }
}

#[tonic::async_trait]
impl DeviceService for DeviceServiceImpl {
    #[instrument(skip(self, request), fields(rpc = "Login"))]
    async fn login(&self, request: Request<LoginRequest>) -> Result<Response<LoginResponse>, Status> {
        let req = request.into_inner();
        if req.serial.is_empty() || req.platform.is_empty() {
            return Err(Status::invalid_argument("serial and platform are required"));
        }

        let session = self
            .authenticator
            .login(&req.token, &req.serial, &req.platform)
            .await
            .map_err(auth_error_to_status)?;
        self.distributor.session_added(&session).await;

        Ok(Response::new(LoginResponse {
            session: Some(session_to_proto(&session)),
        }))
    }

    type GetDeviceConfigurationStream = ConfigStream<GetDeviceConfigurationResponse>;

    #[instrument(skip(self, request), fields(rpc = "GetDeviceConfiguration"))]
    async fn get_device_configuration(
        &self,
        request: Request<GetDeviceConfigurationRequest>,
    ) -> Result<Response<Self::GetDeviceConfigurationStream>, Status> {
        let req = request.into_inner();
        info!(session = %key_prefix(&req.session_key), "Device configuration stream requested");
        let stream = self
            .distributor
            .connect_device(&req.session_key)
            .await
            .map_err(distribution_error_to_status)?;
        Ok(Response::new(stream))
    }
}
