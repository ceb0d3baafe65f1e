//! SQLite storage for the control plane.
//!
//! The single source of truth for devices, gateways and sessions.

mod db;
mod models;
mod queries_devices;
mod queries_gateways;
mod queries_sessions;


pub use db::Database;
pub use models::*;
pub use ztna_core::db::DatabaseError;
