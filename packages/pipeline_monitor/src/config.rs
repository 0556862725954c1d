use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::logging::LoggingConfig;
use crate::merger::MergeSettings;
use crate::transport::TransportSettings;

// =============================================================================
// Unified config (figment-deserialized from defaults / monitor.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   monitor.toml:    [transport]
//                    heartbeat_interval_secs = 15
//
//   env var:         PIPELINE_MONITOR_TRANSPORT__HEARTBEAT_INTERVAL_SECS=15
//
//   (double underscore = nesting, single underscore stays within field names)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub endpoint: EndpointFileConfig,
    #[serde(default)]
    pub transport: TransportFileConfig,
    #[serde(default)]
    pub merge: MergeFileConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the backend lives (lives under `[endpoint]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointFileConfig {
    /// Push hub URL, `ws://` or `wss://`
    #[serde(default = "default_push_url")]
    pub push_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_run_test_path")]
    pub run_test_path: String,
    /// Upper bound for the batch call. Pipeline runs are slow.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for EndpointFileConfig {
    fn default() -> Self {
        Self {
            push_url: default_push_url(),
            api_base_url: default_api_base_url(),
            run_test_path: default_run_test_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Push-channel tunables (lives under `[transport]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    /// Delay before each reconnect attempt; the last entry repeats.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    /// 0 disables heartbeats.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

/// Result-merge tunables (lives under `[merge]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeFileConfig {
    /// How long to wait for trailing telemetry after the batch call returns.
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,
}

impl Default for MergeFileConfig {
    fn default() -> Self {
        Self {
            grace_window_ms: default_grace_window_ms(),
        }
    }
}

fn default_push_url() -> String {
    "ws://127.0.0.1:5000/hubs/pipeline".to_string()
}
fn default_api_base_url() -> String {
    "http://127.0.0.1:5000".to_string()
}
fn default_run_test_path() -> String {
    "/api/pipeline/test".to_string()
}
fn default_request_timeout_secs() -> u64 {
    300
}
fn default_backoff_ms() -> Vec<u64> {
    vec![0, 2_000, 10_000, 30_000]
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_outbound_capacity() -> usize {
    64
}
fn default_grace_window_ms() -> u64 {
    1_500
}

/// Build the figment: struct defaults, then the TOML file (if given), then
/// `PIPELINE_MONITOR_*` env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `PIPELINE_MONITOR_ENDPOINT__PUSH_URL=wss://...`  →  `endpoint.push_url`
///   `PIPELINE_MONITOR_MERGE__GRACE_WINDOW_MS=3000`  →  `merge.grace_window_ms`
pub fn load_config(path: Option<&Path>) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    let mut figment = Figment::from(Serialized::defaults(FileConfig::default()));
    if let Some(path) = path {
        figment = figment.merge(Toml::file(path));
    }
    figment.merge(Env::prefixed("PIPELINE_MONITOR_").split("__"))
}

// =============================================================================
// Runtime config
// =============================================================================

/// Endpoints of the request/response API.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub run_test_path: String,
    pub request_timeout: Duration,
}

impl ApiConfig {
    pub fn from_file(fc: &EndpointFileConfig) -> Self {
        Self {
            base_url: fc.api_base_url.trim_end_matches('/').to_string(),
            run_test_path: fc.run_test_path.clone(),
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
        }
    }

    pub fn run_test_url(&self) -> String {
        if self.run_test_path.starts_with('/') {
            format!("{}{}", self.base_url, self.run_test_path)
        } else {
            format!("{}/{}", self.base_url, self.run_test_path)
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub push_url: String,
    pub api: ApiConfig,
    pub transport: TransportSettings,
    pub merge: MergeSettings,
    pub logging: LoggingConfig,
}

impl MonitorConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            push_url: fc.endpoint.push_url.clone(),
            api: ApiConfig::from_file(&fc.endpoint),
            transport: TransportSettings::from_file(&fc.transport),
            merge: MergeSettings::from_file(&fc.merge),
            logging: fc.logging.clone(),
        }
    }

    /// Load defaults < TOML file < env and build the runtime config.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_config: FileConfig = load_config(path)
            .extract()
            .context("invalid pipeline monitor configuration")?;
        let config = Self::from_file(&file_config);
        info!(
            push_url = %config.push_url,
            api = %config.api.run_test_url(),
            "loaded monitor configuration"
        );
        Ok(config)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}
