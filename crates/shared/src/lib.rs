//! Shared library for the stream resolution service.
//!
//! This crate provides functionality common to the resolver crates:
//! - Configuration management
//! - Domain models
//! - Title similarity scoring
//! - Logging infrastructure

pub mod config;
pub mod logging;
pub mod models;
pub mod similarity;

// Re-export commonly used types
pub use config::Config;
pub use models::*;
pub use similarity::{FreqVectorScorer, TitleScorer};

/// Common result type using anyhow::Error
pub type Result<T> = anyhow::Result<T>;
