//! ZTNA Control Plane Library
//!
//! Core functionality for the control plane:
//! - SQLite storage for devices, gateways and sessions
//! - Identity token validation and session issuance
//! - Access filtering of devices per gateway
//! - Stream registries and push-on-change configuration distribution
//! - gRPC services (Device, Gateway, Admin) and a legacy HTTP surface
//! - Background health sync and privileged access refresh

pub mod auth;
pub mod config;
pub mod distribution;
pub mod filter;
pub mod http;
pub mod ip;
pub mod jobs;
pub mod providers;
pub mod registry;
pub mod server;
pub mod sessions;
pub mod storage;

#[cfg(test)]
mod test_helpers;
