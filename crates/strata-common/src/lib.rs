//! # strata-common
//!
//! Shared utilities and types for Strata.
//!
//! This crate provides common functionality used across all Strata crates:
//! - Container ID generation and validation
//! - Standard filesystem paths
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{StrataError, StrataResult};
pub use id::ContainerId;
pub use paths::StrataPaths;
