//! GatewayService gRPC implementation.

use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::{instrument, warn};

use ztna_proto::v1::gateway_service_server::GatewayService;
use ztna_proto::v1::{GetGatewayConfigurationRequest, GetGatewayConfigurationResponse};

use super::convert::{database_error_to_status, distribution_error_to_status};
use crate::auth::password;
use crate::distribution::{ConfigDistributor, ConfigStream};
use crate::storage::DatabaseError;

pub struct GatewayServiceImpl {
    distributor: Arc<ConfigDistributor>,
}

impl GatewayServiceImpl {
    pub const fn new(distributor: Arc<ConfigDistributor>) -> Self {
        Self { distributor }
    }
}

#[tonic::async_trait]
impl GatewayService for GatewayServiceImpl {
    type GetGatewayConfigurationStream = ConfigStream<GetGatewayConfigurationResponse>;

    #[instrument(skip(self, request), fields(rpc = "GetGatewayConfiguration"))]
    async fn get_gateway_configuration(
        &self,
        request: Request<GetGatewayConfigurationRequest>,
    ) -> Result<Response<Self::GetGatewayConfigurationStream>, Status> {
        let req = request.into_inner();

        // Unknown names and wrong passwords look the same to the caller.
        let gateway = match self.distributor.db().read_gateway_by_name(&req.gateway).await {
            Ok(gateway) => gateway,
            Err(DatabaseError::NotFound(_)) => {
                warn!(gateway = %req.gateway, "Configuration stream for unknown gateway");
                return Err(Status::unauthenticated("Invalid gateway credentials"));
            }
            Err(e) => return Err(database_error_to_status(e)),
        };
        if !password::verify_password(&gateway.name, &req.password, &gateway.password_hash) {
            warn!(gateway = %gateway.name, "Gateway presented wrong password");
            return Err(Status::unauthenticated("Invalid gateway credentials"));
        }

        let stream = self
            .distributor
            .connect_gateway(&gateway.name)
            .await
            .map_err(distribution_error_to_status)?;
        Ok(Response::new(stream))
    }
}
