//! Configuration system for the warden claim server.
//!
//! Provides runtime-configurable settings that persist to disk as RON files.
//! Supports CLI overrides via clap, hot-reload detection, range validation,
//! and forward/backward compatible serialization.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    ClaimsConfig, Config, DebugConfig, PersistenceConfig, StorageConfig, WildernessRule,
};
pub use error::ConfigError;
