//! cloudbd Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions, persisted
//! metadata record and configuration used by every cloudbd component.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DeviceConfig, RetryConfig};
pub use error::{Error, Result};
pub use types::*;
