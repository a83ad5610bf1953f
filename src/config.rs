use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::link::WifiCredentials;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    pub backend_url: String,
    pub firmware_version: String,
    /// Hardware address override; generated and persisted when absent.
    pub mac_address: Option<String>,
    pub data_dir: PathBuf,
    pub event_queue_max_bytes: u64,
    pub command_queue_max_bytes: u64,
    pub http_connect_timeout_ms: u64,
    pub http_timeout_ms: u64,
    pub command_poll_interval_secs: u64,
    pub tick_interval_ms: u64,
    pub probe_interval_secs: u64,
    pub link_connect_timeout_ms: u64,
    pub reconnect_after_failures: u32,
    pub retry_base_ms: u64,
    pub retry_floor_ms: u64,
    pub retry_ceiling_ms: u64,
    pub reconnect_floor_ms: u64,
    pub reconnect_ceiling_ms: u64,
    pub jitter_percent: u32,
    pub wifi_default_ssid: String,
    pub wifi_default_password: String,
    /// Interval of simulated button presses; 0 disables the simulator.
    pub simulated_press_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend_url: "http://localhost:8000".to_string(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            mac_address: None,
            data_dir: PathBuf::from("./data"),
            event_queue_max_bytes: 4 * 1024 * 1024,
            command_queue_max_bytes: 1024 * 1024,
            http_connect_timeout_ms: 3_000,
            http_timeout_ms: 10_000,
            command_poll_interval_secs: 30,
            tick_interval_ms: 1_000,
            probe_interval_secs: 60,
            link_connect_timeout_ms: 10_000,
            reconnect_after_failures: 3,
            retry_base_ms: 2_000,
            retry_floor_ms: 1_000,
            retry_ceiling_ms: 300_000,
            reconnect_floor_ms: 30_000,
            reconnect_ceiling_ms: 300_000,
            jitter_percent: 20,
            wifi_default_ssid: "testtest".to_string(),
            wifi_default_password: "mb95z78y".to_string(),
            simulated_press_interval_secs: 0,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let config = Config {
            backend_url: env::var("BACKEND_URL").unwrap_or(defaults.backend_url),
            firmware_version: env::var("FIRMWARE_VERSION").unwrap_or(defaults.firmware_version),
            mac_address: env::var("MAC_ADDRESS").ok().filter(|m| !m.trim().is_empty()),
            data_dir: env::var("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            event_queue_max_bytes: get_env_var_u64("EVENT_QUEUE_MAX_BYTES", defaults.event_queue_max_bytes),
            command_queue_max_bytes: get_env_var_u64("COMMAND_QUEUE_MAX_BYTES", defaults.command_queue_max_bytes),
            http_connect_timeout_ms: get_env_var_u64("HTTP_CONNECT_TIMEOUT_MS", defaults.http_connect_timeout_ms),
            http_timeout_ms: get_env_var_u64("HTTP_TIMEOUT_MS", defaults.http_timeout_ms),
            command_poll_interval_secs: get_env_var_u64("COMMAND_POLL_INTERVAL_SECS", defaults.command_poll_interval_secs),
            tick_interval_ms: get_env_var_u64("TICK_INTERVAL_MS", defaults.tick_interval_ms),
            probe_interval_secs: get_env_var_u64("PROBE_INTERVAL_SECS", defaults.probe_interval_secs),
            link_connect_timeout_ms: get_env_var_u64("LINK_CONNECT_TIMEOUT_MS", defaults.link_connect_timeout_ms),
            reconnect_after_failures: get_env_var_u32("RECONNECT_AFTER_FAILURES", defaults.reconnect_after_failures),
            retry_base_ms: get_env_var_u64("RETRY_BASE_MS", defaults.retry_base_ms),
            retry_floor_ms: get_env_var_u64("RETRY_FLOOR_MS", defaults.retry_floor_ms),
            retry_ceiling_ms: get_env_var_u64("RETRY_CEILING_MS", defaults.retry_ceiling_ms),
            reconnect_floor_ms: get_env_var_u64("RECONNECT_FLOOR_MS", defaults.reconnect_floor_ms),
            reconnect_ceiling_ms: get_env_var_u64("RECONNECT_CEILING_MS", defaults.reconnect_ceiling_ms),
            jitter_percent: get_env_var_u32("JITTER_PERCENT", defaults.jitter_percent),
            wifi_default_ssid: env::var("WIFI_DEFAULT_SSID").unwrap_or(defaults.wifi_default_ssid),
            wifi_default_password: env::var("WIFI_DEFAULT_PASSWORD").unwrap_or(defaults.wifi_default_password),
            simulated_press_interval_secs: get_env_var_u64(
                "SIMULATED_PRESS_INTERVAL_SECS",
                defaults.simulated_press_interval_secs,
            ),
        };
        config.validate()?;
        Ok(config)
    }

    fn get_config_file_path() -> PathBuf {
        let config_dir = env::var("CONFIG_DIR").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(config_dir).join("device_config.json")
    }

    /// Load `$CONFIG_DIR/device_config.json`; missing keys take their defaults.
    pub fn load_from_file() -> Result<Self> {
        let config_file_path = Self::get_config_file_path();
        let contents = fs::read_to_string(&config_file_path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// The config file when one exists, otherwise the environment.
    pub fn load() -> Result<Self> {
        if Self::get_config_file_path().exists() {
            Self::load_from_file()
        } else {
            Self::from_env()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend_url.trim().is_empty() {
            bail!("backend_url must not be empty");
        }
        if self.event_queue_max_bytes == 0 || self.command_queue_max_bytes == 0 {
            bail!("queue caps must be non-zero");
        }
        if self.retry_floor_ms > self.retry_ceiling_ms {
            bail!("retry floor {}ms exceeds ceiling {}ms", self.retry_floor_ms, self.retry_ceiling_ms);
        }
        if self.reconnect_floor_ms > self.reconnect_ceiling_ms {
            bail!(
                "reconnect floor {}ms exceeds ceiling {}ms",
                self.reconnect_floor_ms,
                self.reconnect_ceiling_ms
            );
        }
        if self.jitter_percent >= 100 {
            bail!("jitter_percent must be below 100");
        }
        if self.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be non-zero");
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.retry_base_ms),
            floor: Duration::from_millis(self.retry_floor_ms),
            ceiling: Duration::from_millis(self.retry_ceiling_ms),
            jitter_pct: self.jitter_percent,
        }
    }

    pub fn reconnect_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.reconnect_floor_ms),
            floor: Duration::from_millis(self.reconnect_floor_ms),
            ceiling: Duration::from_millis(self.reconnect_ceiling_ms),
            jitter_pct: self.jitter_percent,
        }
    }

    pub fn default_wifi(&self) -> WifiCredentials {
        WifiCredentials {
            ssid: self.wifi_default_ssid.clone(),
            password: self.wifi_default_password.clone(),
        }
    }

    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("device_state.db")
    }

    pub fn event_queue_path(&self) -> PathBuf {
        self.data_dir.join("events.jsonl")
    }

    pub fn command_queue_path(&self) -> PathBuf {
        self.data_dir.join("commands.jsonl")
    }
}

fn get_env_var_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .unwrap_or(default)
}

/// Out-of-range values count as unparseable and fall back to `default`.
fn get_env_var_u32(key: &str, default: u32) -> u32 {
    u32::try_from(get_env_var_u64(key, u64::from(default))).unwrap_or(default)
}
