//! Center: the assembled set of long-lived components (C1-C11), built once
//! at startup and shared by reference with every HTTP handler and
//! background unit.
//!
//! Mirrors the teacher's `Center`/unit-spawn split: this struct bundles the
//! components, `manager` spawns the handful that run their own background
//! loop, and the HTTP layer calls the rest synchronously per request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio::sync::mpsc;

use crate::acme::client::AcmeClient;
use crate::acme::{AcmeCoordinator, AcmeCoordinatorConfig, AcmeError, CertificateIssuer};
use crate::config::Config;
use crate::health::{environment, HealthAggregator, HealthChecker, ProxyChecker, ResolverChecker, SyncFreshnessChecker};
use crate::inventory::client::ReqwestOverlayClient;
use crate::inventory::{AnnotationStore, DeviceAnnotation, Inventory};
use crate::metrics::{MetricsCollection, ZoneMetrics};
use crate::persistence::{JsonStore, Persistence};
use crate::proxy::{ProxyError, ProxyRouter, ProxyRouterConfig, ProxyRule, RuleStore};
use crate::records::{RecordEntry, RecordService, RecordStore};
use crate::resolver::restart::RestartCoordinator;
use crate::resolver::{Renderer, RendererConfig};
use crate::san::{SanReconciler, SanReconcilerConfig};
use crate::sync::{BootstrapDevice, SyncLoop, SyncLoopConfig};
use crate::zone::{ZoneError, ZoneStore, ZoneStoreConfig};

const OVERLAY_API_TIMEOUT: Duration = Duration::from_secs(10);

//----------- Update ----------------------------------------------------------------

/// A notable event raised by a call site that already holds its outcome,
/// for the logging unit spawned by `manager` to record in one place.
#[derive(Debug, Clone)]
pub enum Update {
    RecordCreated { fqdn: String, proxied: bool },
    RecordRemoved { fqdn: String },
    CertificateRenewalAttempted { sans: Vec<String>, error: Option<String> },
}

//----------- Center ----------------------------------------------------------------

pub struct Center {
    pub config: Config,
    pub metrics: MetricsCollection,
    pub zone: Arc<ZoneStore>,
    pub renderer: Arc<Renderer>,
    pub proxy: Arc<ProxyRouter>,
    pub inventory: Arc<Inventory>,
    /// `Some` only when a deployment has ACME configured; `manager` spawns
    /// the SAN reconciler's loop and the renewal timer only in that case.
    pub acme: Option<Arc<AcmeCoordinator>>,
    pub san: Arc<SanReconciler>,
    pub records: Arc<RecordService>,
    pub sync: Arc<SyncLoop>,
    pub health: Arc<HealthAggregator>,
    pub updates: mpsc::UnboundedSender<Update>,
}

impl Center {
    /// Construct every component from a parsed configuration file. Returns
    /// the built `Center` alongside the receiving half of its update
    /// channel, which `manager` spawns a logging task against.
    pub async fn build(config: Config) -> Result<(Arc<Center>, mpsc::UnboundedReceiver<Update>), CenterError> {
        let metrics = MetricsCollection::new(env!("CARGO_PKG_VERSION"));
        let keep_count = config.storage.backup_count;

        let zone = Arc::new(ZoneStore::new(ZoneStoreConfig {
            zone_dir: config.zone.zone_dir.clone(),
            challenge_zone_path: config.zone.challenge_zone_path.clone(),
            primary_nameserver: config.zone.primary_nameserver.clone(),
            hostmaster: config.zone.hostmaster.clone(),
            soa_refresh: config.zone.soa_refresh,
            soa_retry: config.zone.soa_retry,
            soa_expire: config.zone.soa_expire,
            soa_minimum: config.zone.soa_minimum,
        }));

        let self_name = hostname::get()
            .map_err(CenterError::Hostname)?
            .to_string_lossy()
            .into_owned();

        let overlay_client = Box::new(ReqwestOverlayClient::new(
            config.overlay_network.api_base_url.clone(),
            config.overlay_network.api_token.clone(),
            OVERLAY_API_TIMEOUT,
        ));
        let annotation_store: Box<dyn AnnotationStore> = Box::new(JsonStore::<HashMap<String, DeviceAnnotation>>::new(
            state_path(&config.storage.state_dir, "devices.json"),
            keep_count,
        ));
        let inventory = Arc::new(
            Inventory::new(
                overlay_client,
                config.overlay_network.network_id.clone(),
                self_name,
                annotation_store,
            )
            .await,
        );

        let self_address = inventory.self_device().await.ok().and_then(|device| device.primary_address());
        if let Some(self_address) = self_address {
            zone.ensure_zone(&config.base_domain, self_address, &metrics.zone)
                .await
                .map_err(CenterError::Zone)?;
        }

        let resolver_addr = resolver_health_check_addr(&config);
        let restart_probe_checker = Arc::new(ResolverChecker::new(
            resolver_addr,
            Duration::from_secs(config.health.resolver_query_timeout_secs),
        ));
        let restart = RestartCoordinator::new(
            config.resolver.restart_command.clone(),
            Duration::from_secs(config.resolver.restart_timeout_secs),
        )
        .with_health_probe(Arc::new(move || {
            let checker = restart_probe_checker.clone();
            Box::pin(async move { checker.check().await.healthy })
        }));
        let renderer = Arc::new(
            Renderer::load(
                RendererConfig {
                    template_path: config.resolver.template_path.clone(),
                    output_path: config.resolver.output_path.clone(),
                    zones_path: config.zone.zone_dir.clone(),
                    base_domain: config.base_domain.clone(),
                },
                restart,
            )
            .await,
        );

        let rule_store: Box<dyn RuleStore> = Box::new(JsonStore::<HashMap<String, ProxyRule>>::new(
            state_path(&config.storage.state_dir, "proxy-rules.json"),
            keep_count,
        ));
        let proxy = Arc::new(ProxyRouter::new(
            ProxyRouterConfig {
                enabled: config.proxy.enabled,
                template_path: config.proxy.template_path.clone(),
                output_path: config.proxy.output_path.clone(),
                reload_url: config.proxy.reload_url.clone(),
                reload_timeout: Duration::from_secs(config.proxy.reload_timeout_secs),
            },
            rule_store,
        ));
        proxy.restore_from_storage(&metrics.proxy).await.map_err(CenterError::Proxy)?;

        // The SAN reconciler always exists: `RecordService::add`/`remove`
        // call it unconditionally. Without a configured ACME authority it
        // still tracks the desired hostname set, it's just never drained by
        // a `run()` loop (`manager` only spawns that when ACME is enabled),
        // so its backing coordinator's issuer is never actually invoked.
        let (acme, san_coordinator) = match &config.acme {
            Some(acme_config) => {
                zone.ensure_challenge_zone(&config.base_domain, &metrics.zone)
                    .await
                    .map_err(CenterError::Zone)?;

                let credentials_store = Persistence::new(acme_config.account_credentials_path.clone(), keep_count);
                let issuer: Box<dyn CertificateIssuer> = Box::new(AcmeClient::new(
                    acme_config.directory_url.clone(),
                    acme_config.contact_email.clone(),
                    credentials_store,
                ));
                let metadata_store = Persistence::new(acme_config.certificate_metadata_path.clone(), keep_count);
                let coordinator = Arc::new(
                    AcmeCoordinator::new(
                        AcmeCoordinatorConfig {
                            directory_url: acme_config.directory_url.clone(),
                            cert_path: acme_config.cert_path.clone(),
                            key_path: acme_config.key_path.clone(),
                            renew_before: Duration::from_secs(acme_config.renew_before_days as u64 * 86_400),
                        },
                        issuer,
                        zone.clone(),
                        renderer.clone(),
                        metadata_store,
                    )
                    .await,
                );
                (Some(coordinator.clone()), coordinator)
            }
            None => {
                let metadata_store = Persistence::new(state_path(&config.storage.state_dir, "acme-disabled.json"), keep_count);
                let coordinator = Arc::new(
                    AcmeCoordinator::new(
                        AcmeCoordinatorConfig {
                            directory_url: String::new(),
                            cert_path: state_path(&config.storage.state_dir, "acme-disabled.pem"),
                            key_path: state_path(&config.storage.state_dir, "acme-disabled.key"),
                            renew_before: Duration::from_secs(30 * 86_400),
                        },
                        Box::new(NoAcmeIssuer),
                        zone.clone(),
                        renderer.clone(),
                        metadata_store,
                    )
                    .await,
                );
                (None, coordinator)
            }
        };

        let san = SanReconciler::new(
            SanReconcilerConfig {
                debounce: Duration::from_secs(config.acme.as_ref().map_or(5, |a| a.san_debounce_secs)),
                max_backoff: Duration::from_secs(config.acme.as_ref().map_or(60, |a| a.renewal_check_interval_secs)),
            },
            san_coordinator,
        );
        san.seed(renderer.get_all_domains().await.into_iter().map(|d| d.name)).await;

        let record_store: Box<dyn RecordStore> = Box::new(JsonStore::<HashMap<String, RecordEntry>>::new(
            state_path(&config.storage.state_dir, "records.json"),
            keep_count,
        ));
        let records = Arc::new(
            RecordService::new(
                config.base_domain.clone(),
                zone.clone(),
                renderer.clone(),
                proxy.clone(),
                inventory.clone(),
                san.clone(),
                record_store,
            )
            .await,
        );

        let sync = Arc::new(SyncLoop::new(
            SyncLoopConfig {
                service: config.base_domain.clone(),
                interval: Duration::from_secs(config.sync.interval_secs),
                devices: config.sync.bootstrap_devices.iter().cloned().map(BootstrapDevice::from).collect(),
            },
            inventory.clone(),
            zone.clone(),
        ));

        let health_checkers = build_health_checkers(&config, resolver_addr, &proxy, &sync);
        let health = Arc::new(HealthAggregator::new(health_checkers));

        let (updates, updates_rx) = mpsc::unbounded_channel();

        Ok((
            Arc::new(Center {
                config,
                metrics,
                zone,
                renderer,
                proxy,
                inventory,
                acme,
                san,
                records,
                sync,
                health,
                updates,
            }),
            updates_rx,
        ))
    }
}

/// Backs the SAN reconciler when no ACME authority is configured; its
/// `run()` loop is never spawned in that case, so this is never called.
struct NoAcmeIssuer;

#[async_trait]
impl CertificateIssuer for NoAcmeIssuer {
    async fn issue(
        &self,
        _sans: &[String],
        _zone: &ZoneStore,
        _zone_metrics: &ZoneMetrics,
    ) -> Result<crate::acme::client::IssuedCertificate, AcmeError> {
        Err(AcmeError::Issuance("ACME is not configured for this deployment".to_owned()))
    }
}

fn state_path(state_dir: &Utf8PathBuf, file_name: &str) -> Utf8PathBuf {
    state_dir.join(file_name)
}

fn resolver_health_check_addr(config: &Config) -> std::net::SocketAddr {
    config
        .resolver
        .health_check_addr
        .as_ref()
        .and_then(|addr| addr.parse().ok())
        .unwrap_or_else(environment::default_resolver_address)
}

fn build_health_checkers(
    config: &Config,
    resolver_addr: std::net::SocketAddr,
    proxy: &Arc<ProxyRouter>,
    sync: &Arc<SyncLoop>,
) -> Vec<Box<dyn HealthChecker>> {
    let mut checkers: Vec<Box<dyn HealthChecker>> = vec![Box::new(ResolverChecker::new(
        resolver_addr,
        Duration::from_secs(config.health.resolver_query_timeout_secs),
    ))];

    if proxy.is_enabled() {
        checkers.push(Box::new(ProxyChecker::new(
            config.proxy.reload_url.clone(),
            Duration::from_secs(config.health.proxy_check_timeout_secs),
        )));
    }

    checkers.push(Box::new(SyncFreshnessChecker::new(
        sync.clone(),
        Duration::from_secs(config.sync.interval_secs),
    )));

    checkers
}

//----------- CenterError ----------------------------------------------------------

#[derive(Debug)]
pub enum CenterError {
    Hostname(std::io::Error),
    Zone(ZoneError),
    Proxy(ProxyError),
}

impl std::fmt::Display for CenterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hostname(err) => write!(f, "failed to determine local hostname: {err}"),
            Self::Zone(err) => write!(f, "failed to initialise zone state: {err}"),
            Self::Proxy(err) => write!(f, "failed to restore proxy state: {err}"),
        }
    }
}

impl std::error::Error for CenterError {}
