//! `Flock` Core Library
//!
//! Shared functionality for `Flock` components:
//! - Stream-json protocol parsing for agent worker output
//! - Domain message model delivered to the hosting application
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod ndjson;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
