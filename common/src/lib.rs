//! Common utilities and abstractions for the psgrid project.
//!
//! This crate provides the shared error type, the typed configuration
//! accessor and time helpers used by the coordination core.

pub mod config;
pub mod error;
pub mod time;

pub use config::{Configuration, DeployMode, keys};
pub use error::{CommonError, Diagnose, ErrorContext, ErrorSeverity, Result};
pub use time::current_timestamp_millis;
