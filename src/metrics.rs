//! Maintaining and exposing Prometheus metrics.
//!
//! Relevant sources for selecting metrics, metric names, and labels:
//! - https://prometheus.io/docs/practices/naming/
//! - https://prometheus.io/docs/instrumenting/writing_exporters/#labels
//! - https://prometheus.io/docs/practices/instrumentation/
//!
//! Unlike the teacher's `MetricsCollection`, which recomputes most gauges
//! from `Center`'s state on every scrape, this daemon's components own
//! their metric handles directly and update them as events happen (zone
//! writes, sync runs, ACME renewals). `MetricsCollection` is just the
//! registry those handles are registered into, plus the text encoder.

use std::fmt;
use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::info::Info;
use prometheus_client::registry::{Metric, Registry, Unit};

const PROMETHEUS_PREFIX: &str = "meshgated";

//------------ MetricsCollection ---------------------------------------------

/// The process-wide metrics registry, plus every handle a component needs
/// to update a counter or gauge it owns.
#[derive(Debug)]
pub struct MetricsCollection {
    registry: Registry,

    pub zone: ZoneMetrics,
    pub resolver: ResolverMetrics,
    pub proxy: ProxyMetrics,
    pub acme: AcmeMetrics,
    pub sync: SyncMetrics,
    pub health: HealthMetrics,
}

impl MetricsCollection {
    pub fn new(version: &str) -> Self {
        let mut registry = Registry::with_prefix(PROMETHEUS_PREFIX);

        let build_info = Info::new(vec![("version", version.to_owned())]);
        registry.register("build", "Control plane build information", build_info);

        let zone = ZoneMetrics::default();
        let resolver = ResolverMetrics::default();
        let proxy = ProxyMetrics::default();
        let acme = AcmeMetrics::default();
        let sync = SyncMetrics::default();
        let health = HealthMetrics::default();

        zone.register(&mut registry);
        resolver.register(&mut registry);
        proxy.register(&mut registry);
        acme.register(&mut registry);
        sync.register(&mut registry);
        health.register(&mut registry);

        Self {
            registry,
            zone,
            resolver,
            proxy,
            acme,
            sync,
            health,
        }
    }

    /// Render the current state of every registered metric in the
    /// Prometheus text exposition format.
    pub fn render(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }

    /// Register an additional metric, for callers outside this module.
    pub fn register<N: Into<String>, H: Into<String>>(
        &mut self,
        name: N,
        help: H,
        metric: impl Metric,
    ) {
        self.registry.register(name, help, metric)
    }
}

//------------ ZoneMetrics (C1) -----------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct ZoneMetrics {
    /// Current number of A/TXT records held in the zone.
    pub records: Gauge,
    /// Number of times the zone file has been rewritten on disk.
    pub writes_total: Counter,
    pub write_failures_total: Counter,
    /// Current SOA serial number.
    pub serial: Gauge<i64, AtomicU64>,
}

impl ZoneMetrics {
    fn register(&self, reg: &mut Registry) {
        reg.register("zone_records", "Number of records in the zone", self.records.clone());
        reg.register(
            "zone_writes",
            "Number of times the zone file was rewritten",
            self.writes_total.clone(),
        );
        reg.register(
            "zone_write_failures",
            "Number of failed zone file writes",
            self.write_failures_total.clone(),
        );
        reg.register("zone_serial", "Current SOA serial number", self.serial.clone());
    }
}

//------------ ResolverMetrics (C2) -------------------------------------------

#[derive(Debug, Default)]
pub struct ResolverMetrics {
    pub config_renders_total: Counter,
    pub restarts_total: Counter,
    pub restart_failures_total: Counter,
    pub last_restart_duration_ms: Gauge<i64, AtomicU64>,
}

impl ResolverMetrics {
    fn register(&self, reg: &mut Registry) {
        reg.register(
            "resolver_config_renders",
            "Number of times the resolver config was rendered",
            self.config_renders_total.clone(),
        );
        reg.register(
            "resolver_restarts",
            "Number of resolver restarts triggered",
            self.restarts_total.clone(),
        );
        reg.register(
            "resolver_restart_failures",
            "Number of resolver restarts that failed",
            self.restart_failures_total.clone(),
        );
        reg.register_with_unit(
            "resolver_last_restart_duration",
            "Duration of the most recent resolver restart",
            Unit::Other("milliseconds".into()),
            self.last_restart_duration_ms.clone(),
        );
    }
}

//------------ ProxyMetrics (C4) -----------------------------------------------

#[derive(Debug, Default)]
pub struct ProxyMetrics {
    pub rules: Gauge,
    pub reloads_total: Counter,
    pub reload_failures_total: Counter,
}

impl ProxyMetrics {
    fn register(&self, reg: &mut Registry) {
        reg.register("proxy_rules", "Number of active proxy rules", self.rules.clone());
        reg.register(
            "proxy_reloads",
            "Number of proxy reloads triggered",
            self.reloads_total.clone(),
        );
        reg.register(
            "proxy_reload_failures",
            "Number of proxy reloads that failed",
            self.reload_failures_total.clone(),
        );
    }
}

//------------ AcmeMetrics (C6/C7) ---------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct AcmeMetrics {
    pub renewals_total: Counter,
    pub renewal_failures_total: Counter,
    /// Seconds until the current certificate expires; negative once expired.
    pub cert_expiry_seconds: Gauge<i64, AtomicU64>,
}

impl AcmeMetrics {
    fn register(&self, reg: &mut Registry) {
        reg.register(
            "acme_renewals",
            "Number of certificate renewals completed",
            self.renewals_total.clone(),
        );
        reg.register(
            "acme_renewal_failures",
            "Number of certificate renewal attempts that failed",
            self.renewal_failures_total.clone(),
        );
        reg.register_with_unit(
            "acme_cert_expiry",
            "Seconds until the current certificate expires",
            Unit::Seconds,
            self.cert_expiry_seconds.clone(),
        );
    }
}

//------------ SyncMetrics (C8) ------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct SyncMetrics {
    pub runs_total: Counter,
    pub failures_total: Counter,
    pub devices_known: Gauge,
    pub last_success_unix_seconds: Gauge<i64, AtomicU64>,
}

impl SyncMetrics {
    fn register(&self, reg: &mut Registry) {
        reg.register("sync_runs", "Number of overlay-network sync passes run", self.runs_total.clone());
        reg.register(
            "sync_failures",
            "Number of overlay-network sync passes that failed",
            self.failures_total.clone(),
        );
        reg.register(
            "sync_devices_known",
            "Number of devices known from the overlay network",
            self.devices_known.clone(),
        );
        reg.register_with_unit(
            "sync_last_success",
            "Unix timestamp of the last successful sync pass",
            Unit::Seconds,
            self.last_success_unix_seconds.clone(),
        );
    }
}

//------------ HealthMetrics (C10/C11) -----------------------------------------

#[derive(Debug, Default)]
pub struct HealthMetrics {
    pub checks_total: Counter,
    pub check_failures_total: Counter,
}

impl HealthMetrics {
    fn register(&self, reg: &mut Registry) {
        reg.register(
            "health_checks",
            "Number of health checks run across all components",
            self.checks_total.clone(),
        );
        reg.register(
            "health_check_failures",
            "Number of health checks that reported an unhealthy component",
            self.check_failures_total.clone(),
        );
    }
}
