//! On-disk configuration.
//!
//! The daemon is configured by a single YAML file (the teacher's config is
//! TOML; this control plane follows the overlay-network ecosystem's
//! convention of YAML instead — see `serde_yaml` in the workspace manifest).

use std::fmt;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

//----------- Config ----------------------------------------------------------

/// The full, parsed contents of the configuration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// The DNS suffix every managed record lives under, e.g. `internal`.
    pub base_domain: String,

    pub overlay_network: OverlayNetworkConfig,

    pub zone: ZoneConfig,

    pub resolver: ResolverConfig,

    pub proxy: ProxyConfig,

    #[serde(default)]
    pub acme: Option<AcmeConfig>,

    pub storage: StorageConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Parse a configuration file's contents.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(contents).map_err(ConfigError::Parse)
    }

    /// Load and parse the configuration file at `path`.
    pub async fn load(path: &camino::Utf8Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|err| ConfigError::Read(path.to_owned(), err))?;
        Self::from_yaml(&contents)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read(Utf8PathBuf, std::io::Error),
    Parse(serde_yaml::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(path, err) => write!(f, "failed to read config file '{path}': {err}"),
            Self::Parse(err) => write!(f, "failed to parse config file: {err}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read(_, err) => Some(err),
            Self::Parse(err) => Some(err),
        }
    }
}

//----------- OverlayNetworkConfig ---------------------------------------------

/// Credentials and identifiers for the overlay-network control API (C3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OverlayNetworkConfig {
    pub api_base_url: String,
    pub api_token: String,
    pub network_id: String,
}

//----------- ZoneConfig --------------------------------------------------------

/// Where the authoritative zone files (C1) live and how they are served.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ZoneConfig {
    /// Directory holding one `<service>.zone` file per managed zone.
    pub zone_dir: Utf8PathBuf,
    /// Dedicated zone file for `_acme-challenge` TXT records, kept separate
    /// from the production zones it coexists with.
    pub challenge_zone_path: Utf8PathBuf,
    #[serde(default = "default_soa_refresh")]
    pub soa_refresh: u32,
    #[serde(default = "default_soa_retry")]
    pub soa_retry: u32,
    #[serde(default = "default_soa_expire")]
    pub soa_expire: u32,
    #[serde(default = "default_soa_minimum")]
    pub soa_minimum: u32,
    pub primary_nameserver: String,
    pub hostmaster: String,
}

fn default_soa_refresh() -> u32 {
    3600
}
fn default_soa_retry() -> u32 {
    600
}
fn default_soa_expire() -> u32 {
    604_800
}
fn default_soa_minimum() -> u32 {
    300
}

//----------- ResolverConfig ----------------------------------------------------

/// Template and restart settings for the resolver-config renderer (C2).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverConfig {
    pub template_path: Utf8PathBuf,
    pub output_path: Utf8PathBuf,
    pub restart_command: Vec<String>,
    #[serde(default = "default_restart_timeout_secs")]
    pub restart_timeout_secs: u64,
    /// Address the Health Checker (C11) sends its minimal DNS probe to. If
    /// unset, picked based on whether the process looks containerised
    /// (§4.11's environment probe).
    #[serde(default)]
    pub health_check_addr: Option<String>,
}

fn default_restart_timeout_secs() -> u64 {
    10
}

//----------- ProxyConfig -------------------------------------------------------

/// Output path and reload endpoint for the reverse-proxy router (C4).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Whether proxying is active at all; when `false`, the Proxy Router is
    /// still constructed (so record creation doesn't need to branch) but
    /// never installs rules or contacts the admin interface.
    #[serde(default = "default_proxy_enabled")]
    pub enabled: bool,
    pub template_path: Utf8PathBuf,
    pub output_path: Utf8PathBuf,
    pub reload_url: String,
    #[serde(default = "default_reload_timeout_secs")]
    pub reload_timeout_secs: u64,
}

fn default_proxy_enabled() -> bool {
    true
}

fn default_reload_timeout_secs() -> u64 {
    5
}

//----------- AcmeConfig --------------------------------------------------------

/// ACME DNS-01 issuance settings (C6). Absent entirely if certificate
/// issuance is disabled for this deployment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcmeConfig {
    pub directory_url: String,
    pub contact_email: String,
    pub cert_domain: String,
    pub cert_path: Utf8PathBuf,
    pub key_path: Utf8PathBuf,
    pub account_credentials_path: Utf8PathBuf,
    pub certificate_metadata_path: Utf8PathBuf,
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,
    #[serde(default = "default_san_debounce_secs")]
    pub san_debounce_secs: u64,
    #[serde(default = "default_renewal_check_interval_secs")]
    pub renewal_check_interval_secs: u64,
}

fn default_renew_before_days() -> u32 {
    30
}
fn default_san_debounce_secs() -> u64 {
    5
}
fn default_renewal_check_interval_secs() -> u64 {
    3600
}

//----------- StorageConfig -----------------------------------------------------

/// Where persisted state (C5) and device annotations live on disk.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub state_dir: Utf8PathBuf,
    #[serde(default = "default_backup_count")]
    pub backup_count: u8,
}

fn default_backup_count() -> u8 {
    3
}

//----------- SyncConfig --------------------------------------------------------

/// How often the sync loop (C8) polls the overlay network for changes, and
/// the static list of devices it projects into DNS on every tick.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub bootstrap_devices: Vec<BootstrapDeviceConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            bootstrap_devices: Vec::new(),
        }
    }
}

/// A single overlay-network device to project into DNS on every sync tick.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BootstrapDeviceConfig {
    /// The primary hostname label to publish for this device.
    pub name: String,
    /// The device's name on the overlay network, resolved through the
    /// Inventory (C3).
    pub tailscale_name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_bootstrap_enabled")]
    pub enabled: bool,
}

fn default_bootstrap_enabled() -> bool {
    true
}

//----------- HealthConfig --------------------------------------------------------

/// Timeouts for the Health Checkers (C11); the sync-freshness checker's
/// budget is derived from `sync.interval_secs` instead of configured here.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    pub resolver_query_timeout_secs: u64,
    pub proxy_check_timeout_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            resolver_query_timeout_secs: 2,
            proxy_check_timeout_secs: 3,
        }
    }
}

//----------- HttpConfig --------------------------------------------------------

/// The operator-facing HTTP API's bind address.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_owned(),
        }
    }
}

//----------- LoggingConfig -----------------------------------------------------

/// Where log output goes and at what verbosity.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub target: LogTarget,
    pub level: LogLevel,
    /// Overrides `level`, using `tracing_subscriber`'s `EnvFilter` syntax,
    /// e.g. `meshgated=debug,tower_http=info`.
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            target: LogTarget::Stderr,
            level: LogLevel::Info,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    Stdout,
    Stderr,
    File { path: Utf8PathBuf },
}

impl Default for LogTarget {
    fn default() -> Self {
        Self::Stderr
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

//----------- MetricsConfig -----------------------------------------------------

/// Whether the `/metrics` endpoint is exposed, and under what path.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_YAML: &str = r#"
base_domain: internal
overlay_network:
  api_base_url: https://api.example.com
  api_token: secret
  network_id: abc123
zone:
  zone_dir: /var/lib/meshgated/zones
  challenge_zone_path: /var/lib/meshgated/zones/_acme-challenge.zone
  primary_nameserver: ns1.internal
  hostmaster: hostmaster.internal
resolver:
  template_path: /etc/meshgated/resolver.tmpl
  output_path: /etc/unbound/meshgated.conf
  restart_command: ["systemctl", "restart", "unbound"]
proxy:
  template_path: /etc/meshgated/proxy.tmpl
  output_path: /etc/caddy/meshgated.json
  reload_url: http://127.0.0.1:2019/load
storage:
  state_dir: /var/lib/meshgated/state
"#;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = Config::from_yaml(MINIMAL_YAML).unwrap();
        assert_eq!(cfg.base_domain, "internal");
        assert_eq!(cfg.sync.interval_secs, 30);
        assert_eq!(cfg.http.listen_addr, "127.0.0.1:8080");
        assert!(cfg.acme.is_none());
        assert!(cfg.metrics.enabled);
        assert_eq!(cfg.zone.soa_refresh, 3600);
    }

    #[test]
    fn rejects_malformed_yaml() {
        assert!(Config::from_yaml("not: [valid").is_err());
    }
}
