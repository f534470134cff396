//! OpenLatency Common - Shared types for the in-path RTT measurement dataplane
//!
//! This crate provides the value types shared between the fast path and the
//! management plane:
//! - Protocol kinds and RTT sample records
//! - Worker configuration
//! - Error handling

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod proto;

pub use config::*;
pub use error::*;
pub use proto::*;
