//! gRPC services of the control plane.

pub mod admin_svc;
pub mod convert;
pub mod device_svc;
pub mod gateway_svc;
pub mod interceptor;


pub use admin_svc::AdminServiceImpl;
pub use device_svc::DeviceServiceImpl;
pub use gateway_svc::GatewayServiceImpl;
pub use interceptor::admin_interceptor;
