use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::pricing::ModelPricing;

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Tracks which configuration settings are overridden by environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "billing.sync_every") is overridden by an env var.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    pub fn all(&self) -> &HashMap<String, String> {
        &self.overrides
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Append-only CSV log of every generation call.
    #[serde(default = "default_metrics_log")]
    pub log_path: PathBuf,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            log_path: default_metrics_log(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BillingConfig {
    /// Reconcile to the durable store whenever a tenant's call count is a
    /// multiple of this value.
    #[serde(default = "default_sync_every")]
    pub sync_every: u64,
    /// Number of most-recent usage events kept per tenant in the fast path.
    #[serde(default = "default_event_history")]
    pub event_history: usize,
    /// Expiry of the per-day counters.
    #[serde(default = "default_daily_retention_days")]
    pub daily_retention_days: u32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            sync_every: default_sync_every(),
            event_history: default_event_history(),
            daily_retention_days: default_daily_retention_days(),
        }
    }
}

/// Extra or replacement model rates layered on top of the built-in table.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub models: Vec<ModelPricing>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

fn default_db_path() -> PathBuf {
    PathBuf::from("metering.db")
}
fn default_metrics_log() -> PathBuf {
    PathBuf::from("llm_metrics.csv")
}
const fn default_sync_every() -> u64 {
    10
}
const fn default_event_history() -> usize {
    100
}
const fn default_daily_retention_days() -> u32 {
    31
}
fn default_log_level() -> String {
    "info".to_string()
}

// ---------------------------------------------------------------------------
// Config loading and env overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `METER_` takes precedence over the
    /// file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.billing.sync_every == 0 {
            anyhow::bail!("billing.sync_every must be at least 1");
        }
        if self.billing.event_history == 0 {
            anyhow::bail!("billing.event_history must be at least 1");
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_str {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = val;
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    }
                }
            };
        }
        macro_rules! env_path {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = PathBuf::from(val);
                    ov.record($key, $env);
                }
            };
        }

        // -- Storage --
        env_path!("database.path", "METER_DATABASE_PATH", self.database.path);
        env_path!("metrics.log_path", "METER_METRICS_LOG", self.metrics.log_path);

        // -- Billing --
        env_parse!(
            "billing.sync_every",
            "METER_BILLING_SYNC_EVERY",
            self.billing.sync_every
        );
        env_parse!(
            "billing.event_history",
            "METER_BILLING_EVENT_HISTORY",
            self.billing.event_history
        );
        env_parse!(
            "billing.daily_retention_days",
            "METER_BILLING_DAILY_RETENTION_DAYS",
            self.billing.daily_retention_days
        );

        // -- Logging --
        env_str!("logging.level", "METER_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "METER_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
