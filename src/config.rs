//! Configuration management for the bridge tracker
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::reconcile::ConflictPolicy;
use crate::transfer::Direction;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub history: HistoryConfig,
    pub subscription: SubscriptionConfig,
    pub swap: SwapConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    pub instance_id: String,
    #[serde(default = "default_event_capacity")]
    pub event_channel_capacity: usize,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub base_url: String,
    #[serde(default = "default_history_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    pub enabled: bool,
    pub ws_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwapConfig {
    pub enabled: bool,
    pub base_url: String,
    #[serde(default = "default_swap_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Staleness thresholds per direction plus the sweep cadence
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    /// Hops inside one network family (parachain to parachain)
    pub intra_network_threshold_secs: u64,
    /// Snowbridge hops between Ethereum and Polkadot
    pub bridge_threshold_secs: u64,
    pub within_ethereum_threshold_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            intra_network_threshold_secs: 30 * 60,
            bridge_threshold_secs: 6 * 60 * 60,
            within_ethereum_threshold_secs: 30 * 60,
        }
    }
}

impl SweeperConfig {
    pub fn threshold(&self, direction: Direction) -> Duration {
        let secs = match direction {
            Direction::ToEthereum | Direction::ToPolkadot => self.bridge_threshold_secs,
            Direction::WithinPolkadot => self.intra_network_threshold_secs,
            Direction::WithinEthereum => self.within_ethereum_threshold_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

fn default_event_capacity() -> usize {
    1024
}

fn default_history_interval() -> u64 {
    30
}

fn default_swap_interval() -> u64 {
    20
}

fn default_request_timeout() -> u64 {
    10
}

fn default_resync_interval() -> u64 {
    15
}

impl Settings {
    /// Load settings from the configured file
    pub fn load() -> Result<Self> {
        let config_path = env::var("BRIDGE_TRACKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.tracker.event_channel_capacity == 0 {
            anyhow::bail!("tracker.event_channel_capacity must be positive");
        }

        if self.history.enabled {
            if self.history.base_url.is_empty() {
                anyhow::bail!("History source is enabled but has no base_url");
            }
            if self.history.poll_interval_secs == 0 {
                anyhow::bail!("history.poll_interval_secs must be positive");
            }
            if self.history.request_timeout_secs == 0 {
                anyhow::bail!("history.request_timeout_secs must be positive");
            }
        }

        if self.swap.enabled {
            if self.swap.base_url.is_empty() {
                anyhow::bail!("Swap source is enabled but has no base_url");
            }
            if self.swap.poll_interval_secs == 0 {
                anyhow::bail!("swap.poll_interval_secs must be positive");
            }
            if self.swap.request_timeout_secs == 0 {
                anyhow::bail!("swap.request_timeout_secs must be positive");
            }
        }

        if self.subscription.enabled {
            if self.subscription.ws_url.is_empty() {
                anyhow::bail!("Subscription source is enabled but has no ws_url");
            }
            if self.subscription.resync_interval_secs == 0 {
                anyhow::bail!("subscription.resync_interval_secs must be positive");
            }
        }

        if self.sweeper.interval_secs == 0 {
            anyhow::bail!("sweeper.interval_secs must be positive");
        }
        if self.sweeper.bridge_threshold_secs < self.sweeper.intra_network_threshold_secs {
            anyhow::bail!("sweeper.bridge_threshold_secs is shorter than the intra-network threshold");
        }

        if !self.history.enabled && !self.subscription.enabled && !self.swap.enabled {
            tracing::warn!("No status sources enabled - transfers will only finalize by staleness");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
