//! Proxy Router (C4): an in-memory hostname -> (address, port, scheme)
//! table, rendered into the reverse proxy's config file and hot-reloaded
//! through its admin interface.

pub mod render;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::metrics::ProxyMetrics;
use crate::util;

//----------- Types ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheme {
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRule {
    pub hostname_fqdn: String,
    pub target_address: IpAddr,
    pub target_port: u16,
    pub scheme: Scheme,
    pub created_at: Timestamp,
}

impl ProxyRule {
    fn validate(&self) -> Result<(), ProxyError> {
        if self.target_port == 0 {
            return Err(ProxyError::InvalidInput(format!(
                "port out of range: {}",
                self.target_port
            )));
        }
        if !is_valid_fqdn(&self.hostname_fqdn) {
            return Err(ProxyError::InvalidInput(format!(
                "invalid hostname: {}",
                self.hostname_fqdn
            )));
        }
        Ok(())
    }
}

fn is_valid_fqdn(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

#[derive(Debug, Clone, Default)]
pub struct ProxyStats {
    pub rule_count: usize,
    pub last_reload_at: Option<Timestamp>,
    pub last_reload_ok: bool,
}

#[derive(Debug, Clone)]
pub struct ProxyRouterConfig {
    pub enabled: bool,
    pub template_path: Utf8PathBuf,
    pub output_path: Utf8PathBuf,
    pub reload_url: String,
    pub reload_timeout: Duration,
}

//----------- RuleStore --------------------------------------------------------------

/// Durable storage for the proxy rule table, implemented atop the
/// Persistence primitive (C5) in the wired-up daemon.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn load(&self) -> HashMap<String, ProxyRule>;
    async fn save(&self, all: &HashMap<String, ProxyRule>) -> Result<(), ProxyError>;
}

//----------- ProxyRouter --------------------------------------------------------------

pub struct ProxyRouter {
    config: ProxyRouterConfig,
    rules: RwLock<HashMap<String, ProxyRule>>,
    stats: RwLock<ProxyStats>,
    http: reqwest::Client,
    store: Box<dyn RuleStore>,
}

impl ProxyRouter {
    pub fn new(config: ProxyRouterConfig, store: Box<dyn RuleStore>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.reload_timeout)
            .build()
            .expect("reqwest client configuration is valid");
        Self {
            config,
            rules: RwLock::new(HashMap::default()),
            stats: RwLock::new(ProxyStats::default()),
            http,
            store,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Load the persisted rule set and reinstall the proxy config.
    pub async fn restore_from_storage(&self, metrics: &ProxyMetrics) -> Result<(), ProxyError> {
        let persisted = self.store.load().await;
        {
            let mut rules = self.rules.write().await;
            *rules = persisted;
        }
        self.render_and_reload(metrics).await
    }

    pub async fn add_rule(&self, rule: ProxyRule, metrics: &ProxyMetrics) -> Result<(), ProxyError> {
        rule.validate()?;

        let previous = {
            let mut rules = self.rules.write().await;
            let previous = rules.clone();
            rules.insert(rule.hostname_fqdn.clone(), rule);
            previous
        };

        if let Err(err) = self.persist_and_reload(metrics).await {
            let mut rules = self.rules.write().await;
            *rules = previous;
            return Err(err);
        }
        Ok(())
    }

    pub async fn remove_rule(&self, hostname_fqdn: &str, metrics: &ProxyMetrics) -> Result<(), ProxyError> {
        let previous = {
            let mut rules = self.rules.write().await;
            let previous = rules.clone();
            let removed = rules.remove(hostname_fqdn);
            if removed.is_none() {
                return Ok(());
            }
            previous
        };

        if let Err(err) = self.persist_and_reload(metrics).await {
            let mut rules = self.rules.write().await;
            *rules = previous;
            return Err(err);
        }
        Ok(())
    }

    pub async fn list_rules(&self) -> Vec<ProxyRule> {
        self.rules.read().await.values().cloned().collect()
    }

    pub async fn get_stats(&self) -> ProxyStats {
        self.stats.read().await.clone()
    }

    async fn persist_and_reload(&self, metrics: &ProxyMetrics) -> Result<(), ProxyError> {
        {
            let rules = self.rules.read().await;
            self.store.save(&rules).await?;
        }
        self.render_and_reload(metrics).await
    }

    async fn render_and_reload(&self, metrics: &ProxyMetrics) -> Result<(), ProxyError> {
        let rules: Vec<ProxyRule> = self.rules.read().await.values().cloned().collect();
        metrics.rules.set(rules.len() as i64);

        if !self.config.enabled {
            return Ok(());
        }

        let template_src = tokio::fs::read_to_string(&self.config.template_path)
            .await
            .map_err(|err| ProxyError::IOError(err.to_string()))?;
        let rendered = render::render(&template_src, &rules)?;

        util::write_file_async(self.config.output_path.clone(), rendered.into_bytes())
            .await
            .map_err(|err| ProxyError::IOError(err.to_string()))?;

        let reload_result = self.trigger_reload().await;

        let mut stats = self.stats.write().await;
        stats.rule_count = rules.len();
        stats.last_reload_at = Some(Timestamp::now());
        stats.last_reload_ok = reload_result.is_ok();
        drop(stats);

        match &reload_result {
            Ok(()) => metrics.reloads_total.inc(),
            Err(_) => metrics.reload_failures_total.inc(),
        };

        reload_result
    }

    async fn trigger_reload(&self) -> Result<(), ProxyError> {
        let url = format!("{}/reload", self.config.reload_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|err| ProxyError::UpstreamUnavailable(err.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProxyError::UpstreamUnavailable(format!(
                "proxy reload endpoint returned status {}",
                response.status()
            )))
        }
    }
}

//----------- ProxyError --------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    InvalidInput(String),
    TemplateError(String),
    UpstreamUnavailable(String),
    IOError(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid proxy rule: {msg}"),
            Self::TemplateError(msg) => write!(f, "proxy template error: {msg}"),
            Self::UpstreamUnavailable(msg) => write!(f, "proxy admin interface unavailable: {msg}"),
            Self::IOError(msg) => write!(f, "proxy I/O error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct FakeRuleStore {
        data: RwLock<HashMap<String, ProxyRule>>,
    }

    impl Default for FakeRuleStore {
        fn default() -> Self {
            Self {
                data: RwLock::new(HashMap::default()),
            }
        }
    }

    #[async_trait]
    impl RuleStore for FakeRuleStore {
        async fn load(&self) -> HashMap<String, ProxyRule> {
            self.data.read().await.clone()
        }

        async fn save(&self, all: &HashMap<String, ProxyRule>) -> Result<(), ProxyError> {
            *self.data.write().await = all.clone();
            Ok(())
        }
    }

    fn test_rule(hostname: &str) -> ProxyRule {
        ProxyRule {
            hostname_fqdn: hostname.to_owned(),
            target_address: IpAddr::V4(Ipv4Addr::new(100, 70, 110, 111)),
            target_port: 8000,
            scheme: Scheme::Http,
            created_at: Timestamp::now(),
        }
    }

    async fn test_router(dir: &std::path::Path, enabled: bool) -> ProxyRouter {
        let template_path = Utf8PathBuf::from_path_buf(dir.join("proxy.tmpl")).unwrap();
        tokio::fs::write(&template_path, "{{ for r in rules }}{ r.hostname }\n{{ endfor }}")
            .await
            .unwrap();
        let config = ProxyRouterConfig {
            enabled,
            template_path,
            output_path: Utf8PathBuf::from_path_buf(dir.join("proxy.json")).unwrap(),
            reload_url: "http://127.0.0.1:0".to_owned(),
            reload_timeout: Duration::from_millis(50),
        };
        ProxyRouter::new(config, Box::new(FakeRuleStore::default()))
    }

    #[tokio::test]
    async fn disabled_router_skips_render_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path(), false).await;
        let metrics = ProxyMetrics::default();
        router.add_rule(test_rule("chat.internal"), &metrics).await.unwrap();
        assert_eq!(router.list_rules().await.len(), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_port() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path(), false).await;
        let metrics = ProxyMetrics::default();
        let mut rule = test_rule("chat.internal");
        rule.target_port = 0;
        let err = router.add_rule(rule, &metrics).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn rejects_invalid_hostname() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path(), false).await;
        let metrics = ProxyMetrics::default();
        let mut rule = test_rule("not a hostname!");
        rule.target_port = 80;
        let err = router.add_rule(rule, &metrics).await.unwrap_err();
        assert!(matches!(err, ProxyError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn remove_missing_rule_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path(), false).await;
        let metrics = ProxyMetrics::default();
        router.remove_rule("ghost.internal", &metrics).await.unwrap();
    }

    #[tokio::test]
    async fn reload_failure_rolls_back_in_memory_rule_set() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path(), true).await;
        let metrics = ProxyMetrics::default();
        // reload_url points at an unreachable port, so add_rule should fail
        // and roll back; the rule set should remain empty.
        let err = router.add_rule(test_rule("chat.internal"), &metrics).await;
        assert!(err.is_err());
        assert!(router.list_rules().await.is_empty());
    }

    #[tokio::test]
    async fn restore_from_storage_reinstalls_persisted_rules() {
        let dir = tempfile::tempdir().unwrap();
        let router = test_router(dir.path(), false).await;
        let metrics = ProxyMetrics::default();
        router
            .store
            .save(&HashMap::from([(
                "chat.internal".to_owned(),
                test_rule("chat.internal"),
            )]))
            .await
            .unwrap();
        router.restore_from_storage(&metrics).await.unwrap();
        assert_eq!(router.list_rules().await.len(), 1);
    }
}
