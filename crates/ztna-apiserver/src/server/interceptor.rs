//! Admin credential check for the admin gRPC service.

use std::sync::Arc;

use tonic::{Request, Status};
use tracing::warn;

use crate::auth::AdminCredentials;

/// Require `authorization: Basic ...` metadata matching the admin pair.
pub fn admin_interceptor(
    creds: Arc<AdminCredentials>,
) -> impl Fn(Request<()>) -> Result<Request<()>, Status> + Clone {
    move |req: Request<()>| {
        let header = req
            .metadata()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Status::unauthenticated("Missing authorization header"))?;

        if !creds.verify_header(header) {
            warn!("Rejected admin request with bad credentials");
            return Err(Status::unauthenticated("Invalid admin credentials"));
        }
        Ok(req)
    }
}
