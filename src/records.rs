//! Record Service (C9): the public facade for creating, listing, and
//! removing managed DNS names.
//!
//! A created record's `A` data always points at this process's own overlay
//! address — the proxy (C4) is what actually reaches the target device —
//! so `target_device` only ever selects the *proxy* backend, never the DNS
//! answer. Side effects within one request run DNS -> Proxy -> SAN, exactly
//! the order the spec requires; only the DNS step can fail the whole
//! operation.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::hostname::{Hostname, InvalidHostname};
use crate::inventory::{Inventory, InventoryError};
use crate::metrics::{ProxyMetrics, ResolverMetrics, ZoneMetrics};
use crate::persistence::PersistenceError;
use crate::proxy::{ProxyError, ProxyRouter, ProxyRule, Scheme};
use crate::resolver::Renderer;
use crate::san::SanReconciler;
use crate::zone::{ZoneError, ZoneStore};

const MAX_COLLISION_SUFFIX: u16 = 999;

//----------- Requests ----------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CreateRecordRequest {
    pub service: String,
    pub name: String,
    /// If set, install a proxy rule forwarding to `target_port` on
    /// `target_device` (or on this process itself if `target_device` is
    /// `None`).
    pub port: Option<u16>,
    pub target_device: Option<String>,
}

//----------- RecordEntry --------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub service: String,
    pub hostname: String,
    pub fqdn: String,
    pub address: IpAddr,
    pub proxied: bool,
    pub target_port: Option<u16>,
    pub created_at: Timestamp,
}

//----------- RecordStore -----------------------------------------------------------

/// Durable storage for the record table, implemented atop the Persistence
/// primitive (C5) in the wired-up daemon.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn load(&self) -> HashMap<String, RecordEntry>;
    async fn save(&self, all: &HashMap<String, RecordEntry>) -> Result<(), RecordError>;
}

//----------- RecordService ----------------------------------------------------------

pub struct RecordService {
    base_domain: String,
    zone: Arc<ZoneStore>,
    renderer: Arc<Renderer>,
    proxy: Arc<ProxyRouter>,
    inventory: Arc<Inventory>,
    san: Arc<SanReconciler>,
    store: Box<dyn RecordStore>,
    records: RwLock<HashMap<String, RecordEntry>>,
}

impl RecordService {
    pub async fn new(
        base_domain: String,
        zone: Arc<ZoneStore>,
        renderer: Arc<Renderer>,
        proxy: Arc<ProxyRouter>,
        inventory: Arc<Inventory>,
        san: Arc<SanReconciler>,
        store: Box<dyn RecordStore>,
    ) -> Self {
        let records = store.load().await;
        Self {
            base_domain,
            zone,
            renderer,
            proxy,
            inventory,
            san,
            store,
            records: RwLock::new(records),
        }
    }

    /// The unified view joining each record with whether a proxy rule is
    /// installed for it.
    pub async fn list_records(&self) -> Vec<RecordEntry> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn create_record(
        &self,
        request: CreateRecordRequest,
        zone_metrics: &ZoneMetrics,
        resolver_metrics: &ResolverMetrics,
        proxy_metrics: &ProxyMetrics,
    ) -> Result<RecordEntry, RecordError> {
        if request.port == Some(0) {
            return Err(RecordError::InvalidInput("port must be in 1..=65535".to_owned()));
        }

        let base = Hostname::normalize(&request.name)?;
        let self_address = self
            .inventory
            .self_device()
            .await?
            .primary_address()
            .ok_or_else(|| RecordError::TargetUnresolvable("self device has no overlay address".to_owned()))?;

        let (hostname, fqdn) = self.pick_available_name(&base).await?;

        self.zone
            .upsert_a(&request.service, hostname.as_str(), self_address, zone_metrics)
            .await?;

        if let Err(err) = self.renderer.add_domain(&fqdn, None, resolver_metrics).await {
            if let Err(rollback_err) = self
                .zone
                .remove_a(&request.service, hostname.as_str(), zone_metrics)
                .await
            {
                tracing::error!(
                    error = %rollback_err,
                    "failed to roll back A record after resolver registration failure",
                );
            }
            return Err(RecordError::Resolver(err.to_string()));
        }

        let proxied = match &request.port {
            Some(port) if self.proxy.is_enabled() => {
                self.install_proxy_rule(&fqdn, *port, request.target_device.as_deref(), self_address, proxy_metrics)
                    .await
            }
            _ => false,
        };

        self.san.add(fqdn.clone()).await;

        let entry = RecordEntry {
            service: request.service,
            hostname: hostname.as_str().to_owned(),
            fqdn: fqdn.clone(),
            address: self_address,
            proxied,
            target_port: request.port,
            created_at: Timestamp::now(),
        };

        let mut records = self.records.write().await;
        records.insert(fqdn, entry.clone());
        self.store.save(&records).await?;

        Ok(entry)
    }

    pub async fn remove_record(
        &self,
        service: &str,
        name: &str,
        zone_metrics: &ZoneMetrics,
        resolver_metrics: &ResolverMetrics,
        proxy_metrics: &ProxyMetrics,
    ) -> Result<(), RecordError> {
        let hostname = Hostname::normalize(name)?;
        let fqdn = hostname.fqdn(&self.base_domain);

        self.san.remove(&fqdn).await;

        if let Err(err) = self.proxy.remove_rule(&fqdn, proxy_metrics).await {
            tracing::warn!(hostname = %fqdn, error = %err, "failed to remove proxy rule during record removal");
        }

        if let Err(err) = self.renderer.remove_domain(&fqdn, resolver_metrics).await {
            tracing::warn!(hostname = %fqdn, error = %err, "failed to deregister resolver domain during record removal");
        }

        self.zone.remove_a(service, hostname.as_str(), zone_metrics).await?;

        let mut records = self.records.write().await;
        records.remove(&fqdn);
        self.store.save(&records).await?;
        Ok(())
    }

    async fn install_proxy_rule(
        &self,
        fqdn: &str,
        target_port: u16,
        target_device: Option<&str>,
        self_address: IpAddr,
        proxy_metrics: &ProxyMetrics,
    ) -> bool {
        let target_address = match target_device {
            Some(device) => match self.inventory.resolve_address(device).await {
                Ok(addr) => addr,
                Err(err) => {
                    tracing::warn!(hostname = %fqdn, target_device = %device, error = %err, "proxy target device unresolvable; DNS record retained");
                    return false;
                }
            },
            None => self_address,
        };

        let rule = ProxyRule {
            hostname_fqdn: fqdn.to_owned(),
            target_address,
            target_port,
            scheme: Scheme::Http,
            created_at: Timestamp::now(),
        };

        match self.proxy.add_rule(rule, proxy_metrics).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(hostname = %fqdn, error = %err, "proxy rule installation failed; DNS record retained");
                false
            }
        }
    }

    /// Starting from `base`, probe `base`, `base-2`, ... `base-999` against
    /// the record table's known FQDNs until an unused one is found.
    async fn pick_available_name(&self, base: &Hostname) -> Result<(Hostname, String), RecordError> {
        let records = self.records.read().await;

        let candidate_fqdn = base.fqdn(&self.base_domain);
        if !records.contains_key(&candidate_fqdn) {
            return Ok((base.clone(), candidate_fqdn));
        }

        for n in 2..=MAX_COLLISION_SUFFIX {
            let candidate = base.with_suffix(n);
            let fqdn = candidate.fqdn(&self.base_domain);
            if !records.contains_key(&fqdn) {
                return Ok((candidate, fqdn));
            }
        }

        Err(RecordError::Conflict(base.as_str().to_owned()))
    }
}

//----------- RecordError -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    InvalidInput(String),
    Conflict(String),
    TargetUnresolvable(String),
    Zone(String),
    Resolver(String),
    Storage(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid record request: {msg}"),
            Self::Conflict(name) => write!(f, "no available name for '{name}' after exhausting collision suffixes"),
            Self::TargetUnresolvable(msg) => write!(f, "record target unresolvable: {msg}"),
            Self::Zone(msg) => write!(f, "zone error: {msg}"),
            Self::Resolver(msg) => write!(f, "resolver error: {msg}"),
            Self::Storage(msg) => write!(f, "record storage error: {msg}"),
        }
    }
}

impl std::error::Error for RecordError {}

impl From<InvalidHostname> for RecordError {
    fn from(err: InvalidHostname) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<InventoryError> for RecordError {
    fn from(err: InventoryError) -> Self {
        Self::TargetUnresolvable(err.to_string())
    }
}

impl From<ZoneError> for RecordError {
    fn from(err: ZoneError) -> Self {
        Self::Zone(err.to_string())
    }
}

impl From<PersistenceError> for RecordError {
    fn from(err: PersistenceError) -> Self {
        Self::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::client::IssuedCertificate;
    use crate::acme::{AcmeCoordinator, AcmeCoordinatorConfig, AcmeError, CertificateIssuer};
    use crate::inventory::{AnnotationStore, DeviceAnnotation, OverlayClient, OverlayDevice};
    use crate::metrics::AcmeMetrics;
    use crate::persistence::Persistence;
    use crate::proxy::{ProxyRouterConfig, RuleStore};
    use crate::resolver::restart::RestartCoordinator;
    use crate::resolver::RendererConfig;
    use crate::san::SanReconcilerConfig;
    use crate::zone::ZoneStoreConfig;
    use camino::Utf8PathBuf;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct FakeClient {
        devices: Vec<OverlayDevice>,
    }

    #[async_trait]
    impl OverlayClient for FakeClient {
        async fn list_devices(&self, _network_id: &str) -> Result<Vec<OverlayDevice>, InventoryError> {
            Ok(self.devices.clone())
        }
    }

    #[derive(Default)]
    struct FakeAnnotationStore;

    #[async_trait]
    impl AnnotationStore for FakeAnnotationStore {
        async fn load(&self) -> HashMap<String, DeviceAnnotation> {
            HashMap::new()
        }
        async fn save(&self, _all: &HashMap<String, DeviceAnnotation>) -> Result<(), InventoryError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRuleStore {
        data: RwLock<HashMap<String, ProxyRule>>,
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

    #[derive(Default)]
    struct FakeRecordStore {
        data: RwLock<HashMap<String, RecordEntry>>,
    }

    #[async_trait]
    impl RecordStore for FakeRecordStore {
        async fn load(&self) -> HashMap<String, RecordEntry> {
            self.data.read().await.clone()
        }
        async fn save(&self, all: &HashMap<String, RecordEntry>) -> Result<(), RecordError> {
            *self.data.write().await = all.clone();
            Ok(())
        }
    }

    struct NoopIssuer;

    #[async_trait]
    impl CertificateIssuer for NoopIssuer {
        async fn issue(
            &self,
            _sans: &[String],
            _zone: &ZoneStore,
            _zone_metrics: &ZoneMetrics,
        ) -> Result<IssuedCertificate, AcmeError> {
            unreachable!("record service tests never drive an issuance");
        }
    }

    async fn test_service(dir: &std::path::Path, proxy_enabled: bool) -> RecordService {
        let zone = Arc::new(ZoneStore::new(ZoneStoreConfig {
            zone_dir: Utf8PathBuf::from_path_buf(dir.join("zones")).unwrap(),
            challenge_zone_path: Utf8PathBuf::from_path_buf(dir.join("challenge.zone")).unwrap(),
            primary_nameserver: "ns1.internal".to_owned(),
            hostmaster: "hostmaster.internal".to_owned(),
            soa_refresh: 3600,
            soa_retry: 600,
            soa_expire: 604_800,
            soa_minimum: 300,
        }));
        zone.ensure_zone(
            "internal",
            IpAddr::V4(Ipv4Addr::new(100, 72, 130, 7)),
            &ZoneMetrics::default(),
        )
        .await
        .unwrap();

        let template_path = Utf8PathBuf::from_path_buf(dir.join("resolver.tmpl")).unwrap();
        tokio::fs::write(&template_path, "{{ for d in domains }}{ d.marker }\n{{ endfor }}")
            .await
            .unwrap();
        let renderer = Arc::new(
            Renderer::load(
                RendererConfig {
                    template_path,
                    output_path: Utf8PathBuf::from_path_buf(dir.join("resolver.conf")).unwrap(),
                    zones_path: Utf8PathBuf::from_path_buf(dir.join("zones")).unwrap(),
                    base_domain: "internal".to_owned(),
                },
                RestartCoordinator::new(Vec::new(), Duration::from_secs(1)),
            )
            .await,
        );

        let proxy_template = Utf8PathBuf::from_path_buf(dir.join("proxy.tmpl")).unwrap();
        tokio::fs::write(&proxy_template, "{{ for r in rules }}{ r.hostname }\n{{ endfor }}")
            .await
            .unwrap();
        let proxy = Arc::new(ProxyRouter::new(
            ProxyRouterConfig {
                enabled: proxy_enabled,
                template_path: proxy_template,
                output_path: Utf8PathBuf::from_path_buf(dir.join("proxy.json")).unwrap(),
                reload_url: "http://127.0.0.1:0".to_owned(),
                reload_timeout: Duration::from_millis(50),
            },
            Box::new(FakeRuleStore::default()),
        ));

        let inventory = Arc::new(
            Inventory::new(
                Box::new(FakeClient {
                    devices: vec![
                        OverlayDevice {
                            id: "1".to_owned(),
                            name: "self-host".to_owned(),
                            addresses: vec![IpAddr::V4(Ipv4Addr::new(100, 72, 130, 7))],
                            online: true,
                        },
                        OverlayDevice {
                            id: "2".to_owned(),
                            name: "omnitron".to_owned(),
                            addresses: vec![IpAddr::V4(Ipv4Addr::new(100, 1, 1, 1))],
                            online: true,
                        },
                    ],
                }),
                "net1".to_owned(),
                "self-host".to_owned(),
                Box::new(FakeAnnotationStore::default()),
            )
            .await,
        );

        let acme_config = AcmeCoordinatorConfig {
            directory_url: "https://acme.example.com/directory".to_owned(),
            cert_path: Utf8PathBuf::from_path_buf(dir.join("cert.pem")).unwrap(),
            key_path: Utf8PathBuf::from_path_buf(dir.join("key.pem")).unwrap(),
            renew_before: Duration::from_secs(30 * 86400),
        };
        let metadata_store = Persistence::new(
            Utf8PathBuf::from_path_buf(dir.join("cert-metadata.json")).unwrap(),
            2,
        );
        let acme = Arc::new(
            AcmeCoordinator::new(acme_config, Box::new(NoopIssuer), zone.clone(), renderer.clone(), metadata_store)
                .await,
        );
        let san = SanReconciler::new(
            SanReconcilerConfig {
                debounce: Duration::from_secs(60),
                max_backoff: Duration::from_secs(5),
            },
            acme,
        );

        RecordService::new(
            "internal".to_owned(),
            zone,
            renderer,
            proxy,
            inventory,
            san,
            Box::new(FakeRecordStore::default()),
        )
        .await
    }

    #[tokio::test]
    async fn create_record_points_dns_at_self_address() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path(), false).await;
        let entry = service
            .create_record(
                CreateRecordRequest {
                    service: "internal".to_owned(),
                    name: "chat".to_owned(),
                    port: None,
                    target_device: None,
                },
                &ZoneMetrics::default(),
                &Default::default(),
                &Default::default(),
            )
            .await
            .unwrap();

        assert_eq!(entry.fqdn, "chat.internal");
        assert_eq!(entry.address, IpAddr::V4(Ipv4Addr::new(100, 72, 130, 7)));
        assert!(!entry.proxied);
    }

    #[tokio::test]
    async fn create_record_resolves_collision_with_numeric_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path(), false).await;
        let metrics = (ZoneMetrics::default(), Default::default(), Default::default());

        let first = service
            .create_record(
                CreateRecordRequest {
                    service: "internal".to_owned(),
                    name: "chat".to_owned(),
                    port: None,
                    target_device: None,
                },
                &metrics.0,
                &metrics.1,
                &metrics.2,
            )
            .await
            .unwrap();
        let second = service
            .create_record(
                CreateRecordRequest {
                    service: "internal".to_owned(),
                    name: "chat".to_owned(),
                    port: None,
                    target_device: None,
                },
                &metrics.0,
                &metrics.1,
                &metrics.2,
            )
            .await
            .unwrap();

        assert_eq!(first.fqdn, "chat.internal");
        assert_eq!(second.fqdn, "chat-2.internal");
    }

    #[tokio::test]
    async fn proxy_rule_targets_requested_device_when_proxying_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path(), true).await;
        let entry = service
            .create_record(
                CreateRecordRequest {
                    service: "internal".to_owned(),
                    name: "chat".to_owned(),
                    port: Some(8080),
                    target_device: Some("omnitron".to_owned()),
                },
                &ZoneMetrics::default(),
                &Default::default(),
                &Default::default(),
            )
            .await
            .unwrap();

        assert!(entry.proxied);
        let rules = service.proxy.list_rules().await;
        assert_eq!(rules[0].target_address, IpAddr::V4(Ipv4Addr::new(100, 1, 1, 1)));
        // the DNS answer still points at this process, not the backend
        assert_eq!(entry.address, IpAddr::V4(Ipv4Addr::new(100, 72, 130, 7)));
    }

    #[tokio::test]
    async fn unresolvable_proxy_target_is_non_fatal_and_dns_record_is_retained() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path(), true).await;
        let entry = service
            .create_record(
                CreateRecordRequest {
                    service: "internal".to_owned(),
                    name: "chat".to_owned(),
                    port: Some(8080),
                    target_device: Some("ghost".to_owned()),
                },
                &ZoneMetrics::default(),
                &Default::default(),
                &Default::default(),
            )
            .await
            .unwrap();

        assert!(!entry.proxied);
        assert_eq!(service.list_records().await.len(), 1);
    }

    #[tokio::test]
    async fn remove_record_clears_dns_proxy_and_san_state() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path(), true).await;
        service
            .create_record(
                CreateRecordRequest {
                    service: "internal".to_owned(),
                    name: "chat".to_owned(),
                    port: Some(8080),
                    target_device: None,
                },
                &ZoneMetrics::default(),
                &Default::default(),
                &Default::default(),
            )
            .await
            .unwrap();
        assert_eq!(service.list_records().await.len(), 1);

        service
            .remove_record(
                "internal",
                "chat",
                &ZoneMetrics::default(),
                &Default::default(),
                &Default::default(),
            )
            .await
            .unwrap();

        assert!(service.list_records().await.is_empty());
        assert!(service.proxy.list_rules().await.is_empty());
    }

    #[tokio::test]
    async fn zero_port_is_rejected_before_touching_any_backend() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path(), true).await;
        let err = service
            .create_record(
                CreateRecordRequest {
                    service: "internal".to_owned(),
                    name: "chat".to_owned(),
                    port: Some(0),
                    target_device: None,
                },
                &ZoneMetrics::default(),
                &Default::default(),
                &Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::InvalidInput(_)));
        assert!(service.list_records().await.is_empty());
    }

    #[tokio::test]
    async fn invalid_hostname_is_rejected_before_touching_any_backend() {
        let dir = tempfile::tempdir().unwrap();
        let service = test_service(dir.path(), false).await;
        let err = service
            .create_record(
                CreateRecordRequest {
                    service: "internal".to_owned(),
                    name: "@@@".to_owned(),
                    port: None,
                    target_device: None,
                },
                &ZoneMetrics::default(),
                &Default::default(),
                &Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::InvalidInput(_)));
    }
}
