//! `warden`: loads every configured world from disk, checks the claim
//! invariants and reports what it found.
//!
//! Run with: `cargo run -p warden-server -- --world overworld`

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use warden_claims::{ClaimEngine, ClaimError, WorldId};
use warden_config::{CliArgs, Config, ConfigError};
use warden_persist::{RetryPolicy, RonStore, WriteBehindQueue};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
enum ServerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("could not start persistence writer: {0}")]
    Io(#[from] std::io::Error),
    #[error("claim engine error: {0}")]
    Claims(#[from] ClaimError),
}

/// What a run found.
#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    worlds: usize,
    claims: usize,
    skipped: usize,
    violations: usize,
    dead_letters: usize,
}

impl Summary {
    fn healthy(&self) -> bool {
        self.violations == 0 && self.dead_letters == 0
    }
}

fn main() -> ExitCode {
    let args = CliArgs::parse();
    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);

    let config = match load_config(&config_dir, &args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warden: {e}");
            return ExitCode::FAILURE;
        }
    };

    let data_dir = config.storage.resolved_data_dir();
    warden_log::init_logging(
        Some(&data_dir.join("logs")),
        config.debug.log_to_file,
        Some(&config),
    );
    info!(config = %config_dir.display(), data = %data_dir.display(), "Warden starting");

    match run(&config, &data_dir) {
        Ok(summary) => {
            info!(
                worlds = summary.worlds,
                claims = summary.claims,
                skipped = summary.skipped,
                violations = summary.violations,
                dead_letters = summary.dead_letters,
                "Warden finished"
            );
            if summary.healthy() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            error!(error = %e, "Warden failed");
            ExitCode::FAILURE
        }
    }
}

fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("warden")
}

fn load_config(config_dir: &Path, args: &CliArgs) -> Result<Config, ServerError> {
    let mut config = Config::load_or_create(config_dir)?;
    config.apply_cli_overrides(args);
    config.validate()?;
    Ok(config)
}

fn run(config: &Config, data_dir: &Path) -> Result<Summary, ServerError> {
    let store = Arc::new(RonStore::new(data_dir));
    let queue = Arc::new(WriteBehindQueue::new(
        store.clone(),
        RetryPolicy::from_config(&config.persistence),
    )?);
    let engine = ClaimEngine::new(config.claims.clone())
        .with_gateway(store)
        .with_sink(queue.clone());

    if config.storage.worlds.is_empty() {
        warn!("No worlds configured; pass --world or set storage.worlds");
    }

    let mut summary = Summary::default();
    for name in &config.storage.worlds {
        let world = WorldId::new(name.as_str());
        let report = engine.load_world(world.clone())?;
        let registry = engine.registry(&world)?;
        let top_level = registry.read().top_level().count();
        info!(
            %world,
            claims = registry.len(),
            top_level,
            skipped = report.skipped.len(),
            "World ready"
        );
        summary.worlds += 1;
        summary.claims += registry.len();
        summary.skipped += report.skipped.len();
    }

    for (world, violation) in engine.verify() {
        error!(%world, ?violation, "Claim invariant violated");
        summary.violations += 1;
    }

    if !queue.flush(FLUSH_TIMEOUT) {
        warn!(pending = queue.pending(), "Timed out waiting for storage writes");
    }
    summary.dead_letters = queue.dead_letters().try_iter().count();
    Ok(summary)
}
