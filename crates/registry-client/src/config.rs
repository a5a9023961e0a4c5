//! Configuration structures for the registry client

use crate::backoff::Backoff;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the address probe interval (seconds)
pub const PROBE_INTERVAL_ENV: &str = "SC_HEALTH_CHECK_INTERVAL";

/// Registry client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry endpoints as `host:port`
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Project (domain) segment of every API path
    #[serde(default = "default_project")]
    pub project: String,
    /// API version segment of every API path
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Reconciliation cadence in seconds
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Refresh the address pool from the registry's own instances
    #[serde(default)]
    pub auto_discovery: bool,
    /// Subscribe to push notifications for the own service
    #[serde(default)]
    pub watch: bool,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Dial timeout used by the address prober in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Address probe interval in seconds, see [`PROBE_INTERVAL_ENV`]
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    /// Heartbeat interval in seconds, used when the instance sets none
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Forget providers not looked up for this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ttl_secs: Option<u64>,
    /// Bound on the health re-check made before applying a delete event
    #[serde(default = "default_delete_recheck_timeout_ms")]
    pub delete_recheck_timeout_ms: u64,
    /// Build the interface → services index every cycle
    #[serde(default)]
    pub enable_schema_index: bool,
    /// Build the IP → service index every cycle
    #[serde(default)]
    pub enable_ip_index: bool,
    /// Watch reconnect schedule
    #[serde(default)]
    pub backoff: Backoff,
    /// TLS towards the registry (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

/// TLS configuration for registry connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Server name for certificate validation
    pub server_name: String,
    /// Path to CA certificate for validation (optional, web roots otherwise)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<PathBuf>,
}

/// Identity of the local process ("dimension info")
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Own service name
    pub service_name: String,
    /// Own service version
    pub version: String,
    /// Own application id
    #[serde(default = "default_app_id")]
    pub app_id: String,
    /// Own environment
    #[serde(default)]
    pub environment: String,
}

fn default_project() -> String {
    "default".to_string()
}

fn default_api_version() -> String {
    "v4".to_string()
}

fn default_app_id() -> String {
    "default".to_string()
}

fn default_refresh_interval_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

fn default_probe_interval_secs() -> u64 {
    std::env::var(PROBE_INTERVAL_ENV)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(25)
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_delete_recheck_timeout_ms() -> u64 {
    3_000
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            addresses: vec![crate::address::DEFAULT_ADDRESS.to_string()],
            project: default_project(),
            api_version: default_api_version(),
            refresh_interval_secs: default_refresh_interval_secs(),
            auto_discovery: false,
            watch: false,
            request_timeout_secs: default_request_timeout_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_interval_secs: default_probe_interval_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            provider_ttl_secs: None,
            delete_recheck_timeout_ms: default_delete_recheck_timeout_ms(),
            enable_schema_index: false,
            enable_ip_index: false,
            backoff: Backoff::default(),
            tls: None,
        }
    }
}

impl RegistryConfig {
    /// Load configuration from file
    pub async fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use async_fs::File;
        use futures::io::AsyncReadExt;

        let mut file = File::open(path.as_ref()).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        // YAML by extension, JSON otherwise
        match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            _ => Self::from_json_str(&contents),
        }
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration for a fixed set of registry addresses
    pub fn with_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() && !self.auto_discovery {
            return Err(Error::Config("no registry address configured".to_string()));
        }
        if let Some(bad) = self.addresses.iter().find(|a| !a.contains(':')) {
            return Err(Error::Config(format!(
                "registry address '{}' must be host:port",
                bad
            )));
        }
        if self.refresh_interval_secs == 0 {
            return Err(Error::Config("refresh interval must be positive".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request timeout must be positive".to_string()));
        }
        Ok(())
    }

    /// Reconciliation cadence
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Prober dial timeout
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Prober interval
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    /// Default heartbeat interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    /// Provider idle limit
    pub fn provider_ttl(&self) -> Option<Duration> {
        self.provider_ttl_secs.map(Duration::from_secs)
    }

    /// Delete re-check bound
    pub fn delete_recheck_timeout(&self) -> Duration {
        Duration::from_millis(self.delete_recheck_timeout_ms)
    }
}

impl ServiceIdentity {
    /// Create an identity in the default app
    pub fn new(service_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            version: version.into(),
            app_id: default_app_id(),
            environment: String::new(),
        }
    }

    /// Set the application id
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    /// Set the environment
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Validate name, app and version (1 to 4 numeric dot-separated segments)
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(Error::InvalidIdentity(
                "micro-service name cannot be empty".to_string(),
            ));
        }
        if self.app_id.trim().is_empty() {
            return Err(Error::InvalidIdentity("app id cannot be empty".to_string()));
        }
        let segments: Vec<&str> = self.version.split('.').collect();
        let numeric = segments
            .iter()
            .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()));
        if segments.len() > 4 || !numeric {
            return Err(Error::InvalidIdentity(format!(
                "invalid version '{}'",
                self.version
            )));
        }
        Ok(())
    }
}
