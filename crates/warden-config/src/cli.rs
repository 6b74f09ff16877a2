//! Command-line argument parsing for the warden server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Warden command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "warden", about = "Land claim engine")]
pub struct CliArgs {
    /// Root directory for claim and account records.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// World to load (repeatable). Replaces the configured world list.
    #[arg(long = "world")]
    pub worlds: Vec<String>,

    /// Fraction of claim blocks returned on abandon.
    #[arg(long)]
    pub abandon_return_ratio: Option<f64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref dir) = args.data_dir {
            self.storage.data_dir = Some(dir.clone());
        }
        if !args.worlds.is_empty() {
            self.storage.worlds = args.worlds.clone();
        }
        if let Some(ratio) = args.abandon_return_ratio {
            self.claims.abandon_return_ratio = ratio;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
