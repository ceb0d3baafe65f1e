//! ZTNA Core Library
//!
//! Shared functionality for the control plane crates:
//! - `SQLite` pool creation and the shared database error type
//! - Tracing/logging initialisation

pub mod db;
pub mod tracing_init;

pub use db::{DatabaseError, unix_timestamp};
