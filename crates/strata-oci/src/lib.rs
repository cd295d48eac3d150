//! # strata-oci
//!
//! OCI (Open Container Initiative) specification types for Strata.
//!
//! This crate provides Rust types for:
//! - OCI Runtime Specification (config.json)
//! - Runtime state reports

#![warn(missing_docs)]

pub mod runtime;
pub mod state;

pub use runtime::{Mount, Spec};
pub use state::RuntimeState;
