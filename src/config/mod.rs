//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values. The database URL
//! is wrapped in `secrecy::SecretString` so it never reaches the logs.

use std::path::PathBuf;

use crate::error::{Error, Result};

pub use secrecy::{ExposeSecret, SecretString};

pub const DEFAULT_WORKFLOWS_DIR: &str = "workflows";
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

#[derive(Debug)]
pub struct Config {
    /// Absent means in-memory stores, archive and queues.
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Directory of workflow definition files.
    pub workflows_dir: PathBuf,
    /// Cap on concurrent runs per workflow handed off by triggers.
    pub max_in_flight: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: optional_var("DATABASE_URL").map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            workflows_dir: optional_var("BATCHFLOW_WORKFLOWS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKFLOWS_DIR)),
            max_in_flight: match optional_var("BATCHFLOW_MAX_IN_FLIGHT") {
                Some(v) => v.parse().map_err(|_| {
                    Error::Config(format!(
                        "BATCHFLOW_MAX_IN_FLIGHT must be a non-negative integer, got {v:?}"
                    ))
                })?,
                None => DEFAULT_MAX_IN_FLIGHT,
            },
        })
    }
}

/// Unset and empty are the same thing.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
