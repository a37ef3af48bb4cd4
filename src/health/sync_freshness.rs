//! Sync-freshness checker: a synchronous, non-network checker comparing
//! `now` against the Sync Loop's last completed run. Catches a wedged or
//! panicked loop that the resolver/proxy checks can't see.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jiff::Timestamp;

use crate::sync::SyncLoop;

use super::{ComponentHealth, HealthChecker};

pub struct SyncFreshnessChecker {
    sync: Arc<SyncLoop>,
    max_age_secs: i64,
}

impl SyncFreshnessChecker {
    /// `sync_interval` is the configured polling interval; a run is
    /// considered stale once it's older than twice that.
    pub fn new(sync: Arc<SyncLoop>, sync_interval: Duration) -> Self {
        Self {
            sync,
            max_age_secs: sync_interval.as_secs() as i64 * 2,
        }
    }
}

#[async_trait]
impl HealthChecker for SyncFreshnessChecker {
    fn name(&self) -> &str {
        "sync"
    }

    async fn check(&self) -> ComponentHealth {
        let started = Instant::now();
        match self.sync.last_run().await {
            None => {
                // No run has completed yet. A freshly started daemon hasn't
                // had a chance to run one, so this isn't reported as a
                // failure — only an actually stale run is.
                ComponentHealth::healthy(started.elapsed())
            }
            Some(result) => {
                let age_secs = Timestamp::now().as_second() - result.completed_at.as_second();
                if age_secs > self.max_age_secs {
                    ComponentHealth::unhealthy(
                        started.elapsed(),
                        format!(
                            "last sync run completed {age_secs}s ago, exceeding the {}s freshness budget",
                            self.max_age_secs
                        ),
                    )
                } else {
                    ComponentHealth::healthy(started.elapsed())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{AnnotationStore, DeviceAnnotation, InventoryError, OverlayClient, OverlayDevice};
    use crate::metrics::{SyncMetrics, ZoneMetrics};
    use crate::sync::SyncLoopConfig;
    use crate::zone::{ZoneStore, ZoneStoreConfig};
    use async_trait::async_trait;
    use camino::Utf8PathBuf;
    use std::collections::HashMap;

    struct EmptyClient;

    #[async_trait]
    impl OverlayClient for EmptyClient {
        async fn list_devices(&self, _network_id: &str) -> Result<Vec<OverlayDevice>, InventoryError> {
            Ok(Vec::new())
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

    async fn test_sync_loop(dir: &std::path::Path) -> Arc<SyncLoop> {
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
        let inventory = Arc::new(
            crate::inventory::Inventory::new(
                Box::new(EmptyClient),
                "net1".to_owned(),
                "self-host".to_owned(),
                Box::new(FakeAnnotationStore::default()),
            )
            .await,
        );
        Arc::new(SyncLoop::new(
            SyncLoopConfig {
                service: "internal".to_owned(),
                interval: Duration::from_millis(10),
                devices: Vec::new(),
            },
            inventory,
            zone,
        ))
    }

    #[tokio::test]
    async fn healthy_before_any_run_has_completed() {
        let dir = tempfile::tempdir().unwrap();
        let sync = test_sync_loop(dir.path()).await;
        let checker = SyncFreshnessChecker::new(sync, Duration::from_secs(30));
        assert!(checker.check().await.healthy);
    }

    #[tokio::test]
    async fn healthy_immediately_after_a_fresh_run() {
        let dir = tempfile::tempdir().unwrap();
        let sync = test_sync_loop(dir.path()).await;
        sync.run_once(&SyncMetrics::default(), &ZoneMetrics::default()).await;
        let checker = SyncFreshnessChecker::new(sync, Duration::from_secs(30));
        assert!(checker.check().await.healthy);
    }

    #[tokio::test]
    async fn unhealthy_once_the_last_run_exceeds_the_freshness_budget() {
        let dir = tempfile::tempdir().unwrap();
        let sync = test_sync_loop(dir.path()).await;
        sync.run_once(&SyncMetrics::default(), &ZoneMetrics::default()).await;
        // A zero-width budget makes any completed run immediately stale
        // once at least a second has ticked by (freshness is second-grained).
        let checker = SyncFreshnessChecker::new(sync, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        let health = checker.check().await;
        assert!(!health.healthy);
        assert!(health.error.is_some());
    }
}
