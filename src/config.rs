use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::limiter::RateLimitSettings;
use crate::reaper::ReaperSettings;

/// Relay presence and dispatch server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "relay-server", version, about = "Relay presence and dispatch server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "RELAY_PORT", default_value = "8747")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "RELAY_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./relay.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "RELAY_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for the SQLite message log
    #[arg(long, env = "RELAY_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Rate-limit configuration (loaded from [rate_limit] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    /// Stale-session reaper configuration (loaded from [reaper] section)
    #[arg(skip)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaper: Option<ReaperConfig>,
}

/// Per-user send budget over a fixed window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Messages allowed per window (default: 30)
    #[serde(default = "default_budget")]
    pub budget: u32,

    /// Window length in seconds (default: 60)
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            budget: 30,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn settings(&self) -> RateLimitSettings {
        RateLimitSettings {
            budget: self.budget,
            window: Duration::from_secs(self.window_secs),
        }
    }
}

fn default_budget() -> u32 {
    30
}

fn default_window_secs() -> u64 {
    60
}

/// Stale-session sweep schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Seconds between sweeps (default: 300 = 5 minutes)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Idle seconds after which a session is evicted (default: 3600 = 1 hour)
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300,
            idle_threshold_secs: 3600,
        }
    }
}

impl ReaperConfig {
    pub fn settings(&self) -> ReaperSettings {
        ReaperSettings {
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            idle_threshold: Duration::from_secs(self.idle_threshold_secs),
        }
    }
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_idle_threshold() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8747,
            bind_address: "0.0.0.0".to_string(),
            config: "./relay.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            rate_limit: None,
            reaper: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (RELAY_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("RELAY_"))
            .merge(Serialized::defaults(cli))
            .extract()
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Relay Server Configuration
# Place this file at ./relay.toml or specify with --config <path>
# All settings can be overridden via environment variables (RELAY_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8747)
# port = 8747

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite message log
# data_dir = "./data"

# ---- Send-Rate Limiting ----
# [rate_limit]

# Messages allowed per window (default: 30)
# budget = 30

# Fixed window length in seconds (default: 60)
# window_secs = 60

# ---- Stale-Session Reaper ----
# [reaper]

# Seconds between sweeps (default: 300 = 5 minutes)
# sweep_interval_secs = 300

# Idle seconds after which a session is forcibly closed (default: 3600 = 1 hour)
# idle_threshold_secs = 3600
"#
    .to_string()
}
