//! Configuration structs with sensible defaults and RON persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Claim rules and the claim-block economy.
    pub claims: ClaimsConfig,
    /// Where claim and account records live.
    pub storage: StorageConfig,
    /// Write-behind retry behaviour.
    pub persistence: PersistenceConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Claim creation rules and claim-block economy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClaimsConfig {
    /// Claim blocks granted to a freshly created account.
    pub initial_claim_blocks: u64,
    /// Ceiling for accrued claim blocks (bonus blocks are not capped).
    pub max_accrued_claim_blocks: u64,
    /// Fraction of a claim's area returned when it is abandoned, in `[0, 1]`.
    pub abandon_return_ratio: f64,
    /// Minimum width along either horizontal axis for player top-level claims.
    pub min_width: u32,
    /// Minimum horizontal area for player top-level claims.
    pub min_area: u64,
    /// Deepest allowed nesting level (top-level claims are depth 0).
    pub max_depth: u32,
    /// What anyone may do outside of claims.
    pub wilderness: WildernessRule,
    /// Per-world overrides for [`ClaimsConfig::wilderness`], keyed by world name.
    pub world_rules: HashMap<String, WildernessRule>,
}

/// Default permissions in unclaimed land.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WildernessRule {
    /// Doors, buttons, levers.
    pub allow_access: bool,
    /// Chests, furnaces and other inventories.
    pub allow_containers: bool,
    /// Placing and breaking blocks.
    pub allow_build: bool,
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for claim data. `None` uses the platform data directory.
    pub data_dir: Option<PathBuf>,
    /// Worlds loaded at startup.
    pub worlds: Vec<String>,
}

/// Retry behaviour for persistence writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Delay before the first retry of a failed write, in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Upper bound for the retry delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Attempts per write before it is given up on.
    pub max_attempts: u32,
    /// Jitter factor (0.0 - 1.0), applied as ±jitter to each delay.
    pub jitter: f64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Also write JSON logs to `<data_dir>/logs`.
    pub log_to_file: bool,
}

// --- Default implementations ---

impl Default for ClaimsConfig {
    fn default() -> Self {
        Self {
            initial_claim_blocks: 100,
            max_accrued_claim_blocks: 80_000,
            abandon_return_ratio: 1.0,
            min_width: 5,
            min_area: 100,
            max_depth: 3,
            wilderness: WildernessRule::default(),
            world_rules: HashMap::new(),
        }
    }
}

impl Default for WildernessRule {
    fn default() -> Self {
        Self {
            allow_access: true,
            allow_containers: true,
            allow_build: true,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: 8,
            jitter: 0.25,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: false,
        }
    }
}

impl ClaimsConfig {
    /// Wilderness rule for `world`, falling back to the global default.
    pub fn wilderness_for(&self, world: &str) -> WildernessRule {
        self.world_rules
            .get(world)
            .copied()
            .unwrap_or(self.wilderness)
    }
}

impl StorageConfig {
    /// The configured data directory, or `<platform data dir>/warden`.
    pub fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("warden")
        })
    }
}

// --- Validation ---

impl Config {
    /// Reject values that would break claim-block accounting or retries.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ratio = self.claims.abandon_return_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigError::Invalid(format!(
                "claims.abandon_return_ratio must be within [0, 1], got {ratio}"
            )));
        }
        if self.claims.min_width == 0 {
            return Err(ConfigError::Invalid(
                "claims.min_width must be at least 1".to_string(),
            ));
        }
        if self.persistence.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "persistence.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.persistence.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "persistence.backoff_multiplier must be >= 1.0, got {}",
                self.persistence.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.persistence.jitter) {
            return Err(ConfigError::Invalid(format!(
                "persistence.jitter must be within [0, 1], got {}",
                self.persistence.jitter
            )));
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            config.validate()?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        new_config.validate()?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
