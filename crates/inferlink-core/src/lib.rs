//! `InferLink` Core Library
//!
//! Shared functionality for `InferLink` components:
//! - Settings file resolution and layering
//! - Tracing subscriber initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
