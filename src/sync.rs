//! Sync Loop (C8): on a fixed interval, projects the configured bootstrap
//! devices into the zone directly, independent of the Record Service (C9).
//!
//! Unlike a Record Service `CreateRecord`, a bootstrap record's `A` data
//! points straight at the device's own overlay address rather than at this
//! process — there is no proxy termination involved for these entries, just
//! a standing name -> address projection the operator configured up front.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tokio::sync::RwLock;

use crate::config::BootstrapDeviceConfig;
use crate::inventory::Inventory;
use crate::metrics::{SyncMetrics, ZoneMetrics};
use crate::zone::ZoneStore;

//----------- BootstrapDevice ----------------------------------------------------

#[derive(Debug, Clone)]
pub struct BootstrapDevice {
    pub name: String,
    pub tailscale_name: String,
    pub aliases: Vec<String>,
    pub enabled: bool,
}

impl From<BootstrapDeviceConfig> for BootstrapDevice {
    fn from(cfg: BootstrapDeviceConfig) -> Self {
        Self {
            name: cfg.name,
            tailscale_name: cfg.tailscale_name,
            aliases: cfg.aliases,
            enabled: cfg.enabled,
        }
    }
}

//----------- SyncLoopConfig ----------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncLoopConfig {
    pub service: String,
    pub interval: Duration,
    pub devices: Vec<BootstrapDevice>,
}

//----------- Run results --------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOutcome {
    Resolved,
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct SyncRunResult {
    pub attempted: usize,
    pub resolved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<(String, DeviceOutcome)>,
    pub completed_at: Timestamp,
}

//----------- SyncLoop --------------------------------------------------------------

pub struct SyncLoop {
    config: SyncLoopConfig,
    inventory: Arc<Inventory>,
    zone: Arc<ZoneStore>,
    last_addresses: RwLock<HashMap<String, IpAddr>>,
    last_run: RwLock<Option<SyncRunResult>>,
}

impl SyncLoop {
    pub fn new(config: SyncLoopConfig, inventory: Arc<Inventory>, zone: Arc<ZoneStore>) -> Self {
        Self {
            config,
            inventory,
            zone,
            last_addresses: RwLock::new(HashMap::new()),
            last_run: RwLock::new(None),
        }
    }

    /// The most recently completed run's result, exposed for the Health
    /// Aggregator's sync-freshness checker (C11).
    pub async fn last_run(&self) -> Option<SyncRunResult> {
        self.last_run.read().await.clone()
    }

    /// Run the loop forever on `config.interval`. A tick with failures logs
    /// and continues; it never aborts future ticks.
    pub async fn run(self: Arc<Self>, metrics: SyncMetrics, zone_metrics: ZoneMetrics) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            interval.tick().await;
            let result = self.run_once(&metrics, &zone_metrics).await;
            if result.failed > 0 {
                tracing::warn!(
                    attempted = result.attempted,
                    resolved = result.resolved,
                    skipped = result.skipped,
                    failed = result.failed,
                    "bootstrap sync run completed with failures",
                );
            }
        }
    }

    pub async fn run_once(&self, metrics: &SyncMetrics, zone_metrics: &ZoneMetrics) -> SyncRunResult {
        let mut resolved = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;
        let mut outcomes = Vec::with_capacity(self.config.devices.len());

        for device in &self.config.devices {
            if !device.enabled {
                skipped += 1;
                outcomes.push((device.name.clone(), DeviceOutcome::Skipped));
                continue;
            }

            match self.inventory.resolve_address(&device.tailscale_name).await {
                Ok(address) => {
                    let mut names = Vec::with_capacity(1 + device.aliases.len());
                    names.push(device.name.as_str());
                    names.extend(device.aliases.iter().map(String::as_str));

                    let mut device_ok = true;
                    for name in names {
                        if let Err(err) = self.sync_one(name, address, zone_metrics).await {
                            tracing::warn!(hostname = %name, error = %err, "bootstrap record sync failed");
                            device_ok = false;
                        }
                    }

                    if device_ok {
                        resolved += 1;
                        outcomes.push((device.name.clone(), DeviceOutcome::Resolved));
                    } else {
                        failed += 1;
                        outcomes.push((
                            device.name.clone(),
                            DeviceOutcome::Failed("zone update failed".to_owned()),
                        ));
                    }
                }
                Err(err) => {
                    // Absence from the inventory is logged, not fatal, and
                    // existing records for this device are left in place —
                    // operator intent is preserved.
                    tracing::warn!(device = %device.tailscale_name, error = %err, "bootstrap device not found in inventory this tick");
                    failed += 1;
                    outcomes.push((device.name.clone(), DeviceOutcome::Failed(err.to_string())));
                }
            }
        }

        metrics.runs_total.inc();
        if failed > 0 {
            metrics.failures_total.inc();
        } else {
            metrics
                .last_success_unix_seconds
                .set(Timestamp::now().as_second());
        }
        metrics.devices_known.set(self.config.devices.len() as i64);

        let result = SyncRunResult {
            attempted: self.config.devices.len(),
            resolved,
            skipped,
            failed,
            outcomes,
            completed_at: Timestamp::now(),
        };

        *self.last_run.write().await = Some(result.clone());
        result
    }

    /// Upsert `hostname` -> `address`. If the device's address changed since
    /// the last tick, the old record is dropped first so stale `A` data
    /// from the previous address never lingers.
    async fn sync_one(
        &self,
        hostname: &str,
        address: IpAddr,
        zone_metrics: &ZoneMetrics,
    ) -> Result<(), crate::zone::ZoneError> {
        let previous = self.last_addresses.read().await.get(hostname).copied();
        if let Some(previous) = previous {
            if previous != address {
                self.zone
                    .drop_a(&self.config.service, hostname, previous, zone_metrics)
                    .await?;
            }
        }

        self.zone
            .upsert_a(&self.config.service, hostname, address, zone_metrics)
            .await?;

        self.last_addresses
            .write()
            .await
            .insert(hostname.to_owned(), address);
        Ok(())
    }
}
