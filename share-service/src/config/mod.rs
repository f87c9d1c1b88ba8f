use crate::models::LocalUserId;
use serde::Deserialize;
use service_core::error::AppError;
use service_core::retry::RetryConfig;
use std::path::PathBuf;
use std::time::Duration;

const CONFIG_FILE: &str = "share-service";
const ENV_PREFIX: &str = "SHARE";

#[derive(Deserialize, Clone, Debug)]
pub struct ShareConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub plex: PlexConfig,
    #[serde(default)]
    pub pin: PinConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PlexConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_product")]
    pub product: String,
    /// Stable device id presented to the media server. Generated per process
    /// when unset, which makes every restart look like a new device.
    #[serde(default = "default_client_identifier")]
    pub client_identifier: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct PinConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Longest server-mandated delay honoured inside a single call.
    #[serde(default = "default_max_rate_limit_wait_secs")]
    pub max_rate_limit_wait_secs: u64,
    /// Delay assumed when a 429 carries no `Retry-After`.
    #[serde(default = "default_rate_limit_secs")]
    pub default_rate_limit_secs: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ReconcileConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default)]
    pub local_users: Vec<LocalUserId>,
}

#[derive(Deserialize, Clone, Debug)]
pub struct StoreConfig {
    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,
    #[serde(default = "default_credential_path")]
    pub credential_path: PathBuf,
}

impl ShareConfig {
    /// Load from `share-service.toml` (optional) and `SHARE__*` variables.
    pub fn load() -> Result<Self, AppError> {
        service_core::config::load(CONFIG_FILE, ENV_PREFIX, &["reconcile.local_users"])
    }
}

impl PlexConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PinConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl RetrySettings {
    pub fn default_rate_limit(&self) -> Duration {
        Duration::from_secs(self.default_rate_limit_secs)
    }

    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            max_mandated_wait: Duration::from_secs(self.max_rate_limit_wait_secs),
            ..RetryConfig::default()
        }
    }
}

impl ReconcileConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            log_level: default_log_level(),
            otlp_endpoint: None,
            plex: PlexConfig::default(),
            pin: PinConfig::default(),
            retry: RetrySettings::default(),
            reconcile: ReconcileConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for PlexConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            product: default_product(),
            client_identifier: default_client_identifier(),
            version: default_version(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_rate_limit_wait_secs: default_max_rate_limit_wait_secs(),
            default_rate_limit_secs: default_rate_limit_secs(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_concurrency: default_max_concurrency(),
            local_users: Vec::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            policy_path: default_policy_path(),
            credential_path: default_credential_path(),
        }
    }
}

fn default_service_name() -> String {
    "share-service".to_string()
}

fn default_log_level() -> String {
    "info,share_service=debug".to_string()
}

fn default_api_base_url() -> String {
    "https://plex.tv".to_string()
}

fn default_product() -> String {
    "Share Service".to_string()
}

fn default_client_identifier() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_max_wait_secs() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_max_rate_limit_wait_secs() -> u64 {
    30
}

fn default_rate_limit_secs() -> u64 {
    5
}

fn default_interval_secs() -> u64 {
    300
}

fn default_max_concurrency() -> usize {
    4
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("share-policy.json")
}

fn default_credential_path() -> PathBuf {
    PathBuf::from("share-credentials.json")
}
