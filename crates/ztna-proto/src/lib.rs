//! ZTNA Protocol Buffers
//!
//! Generated protobuf code for the control plane gRPC API.
//!
//! This crate contains:
//! - `DeviceService` for device login and configuration streaming
//! - `GatewayService` for gateway configuration streaming
//! - `AdminService` for gateway and device enrollment

#![allow(clippy::derive_partial_eq_without_eq)]

/// ZTNA v1 API definitions.
///
/// All generated types and services are included here.
pub mod v1 {
    tonic::include_proto!("ztna.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;

pub use prost_types;
