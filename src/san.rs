//! SAN Reconciler (C7): folds `add(host)`/`remove(host)` events into
//! debounced `EnsureCertificate` requests against the ACME Coordinator.
//!
//! The desired SAN set is the union of all currently-live hostnames.
//! Bursts of adds/removes within the debounce window collapse into a
//! single issuance request; on coordinator failure the request is retried
//! with exponential backoff capped at the renewal-loop interval.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, RwLock};

use crate::acme::{AcmeCoordinator, AcmeError};
use crate::metrics::{AcmeMetrics, ZoneMetrics};

pub struct SanReconcilerConfig {
    pub debounce: Duration,
    pub max_backoff: Duration,
}

pub struct SanReconciler {
    desired: RwLock<BTreeSet<String>>,
    notify: Notify,
    config: SanReconcilerConfig,
    acme: Arc<AcmeCoordinator>,
}

impl SanReconciler {
    pub fn new(config: SanReconcilerConfig, acme: Arc<AcmeCoordinator>) -> Arc<Self> {
        Arc::new(Self {
            desired: RwLock::new(BTreeSet::new()),
            notify: Notify::new(),
            config,
            acme,
        })
    }

    /// Seed the desired set from the hostnames already live at startup
    /// (e.g. recovered from the resolver's rendered config), without
    /// triggering a reconciliation pass.
    pub async fn seed(&self, hostnames: impl IntoIterator<Item = String>) {
        let mut desired = self.desired.write().await;
        desired.extend(hostnames);
    }

    pub async fn add(&self, host: String) {
        let mut desired = self.desired.write().await;
        if desired.insert(host) {
            drop(desired);
            self.notify.notify_one();
        }
    }

    pub async fn remove(&self, host: &str) {
        let mut desired = self.desired.write().await;
        if desired.remove(host) {
            drop(desired);
            self.notify.notify_one();
        }
    }

    pub async fn desired_set(&self) -> Vec<String> {
        self.desired.read().await.iter().cloned().collect()
    }

    /// Run the debounce-then-reconcile loop forever. Intended to be spawned
    /// as a background task; `metrics`/`zone_metrics` are threaded through
    /// to the ACME Coordinator's issuance calls.
    pub async fn run(self: Arc<Self>, metrics: AcmeMetrics, zone_metrics: ZoneMetrics) {
        loop {
            self.notify.notified().await;
            self.drain_quiescence().await;

            let sans = self.desired_set().await;
            if sans.is_empty() {
                continue;
            }

            self.reconcile_with_backoff(&sans, &metrics, &zone_metrics).await;
        }
    }

    /// Wait until no further `add`/`remove` arrives for a full debounce
    /// window, restarting the wait on every new event.
    async fn drain_quiescence(&self) {
        loop {
            match tokio::time::timeout(self.config.debounce, self.notify.notified()).await {
                Ok(()) => continue,
                Err(_elapsed) => break,
            }
        }
    }

    async fn reconcile_with_backoff(
        &self,
        sans: &[String],
        metrics: &AcmeMetrics,
        zone_metrics: &ZoneMetrics,
    ) {
        let mut backoff = self.config.debounce;
        loop {
            match self.acme.ensure_certificate(sans, metrics, zone_metrics).await {
                Ok(()) => return,
                Err(AcmeError::EmptySanSet) => return,
                Err(err) => {
                    tracing::warn!(error = %err, "SAN reconciliation failed, retrying with backoff");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.config.max_backoff);

                    // If the desired set changed while we were retrying,
                    // pick up the latest snapshot rather than chase a stale
                    // target.
                    let latest = self.desired_set().await;
                    if latest.is_empty() {
                        return;
                    }
                    if latest != sans {
                        return; // the next notify_one already queued a fresh pass
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::client::IssuedCertificate;
    use crate::acme::{AcmeCoordinatorConfig, CertificateIssuer};
    use crate::persistence::Persistence;
    use crate::resolver::restart::RestartCoordinator;
    use crate::resolver::{Renderer, RendererConfig};
    use crate::zone::{ZoneStore, ZoneStoreConfig};
    use async_trait::async_trait;
    use camino::Utf8PathBuf;
    use jiff::Timestamp;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingIssuer {
        calls: AtomicU32,
    }

    #[async_trait]
    impl CertificateIssuer for CountingIssuer {
        async fn issue(
            &self,
            _sans: &[String],
            _zone: &ZoneStore,
            _zone_metrics: &ZoneMetrics,
        ) -> Result<IssuedCertificate, AcmeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(IssuedCertificate {
                cert_chain_pem: "CERT".to_owned(),
                private_key_pem: "KEY".to_owned(),
                not_after: Timestamp::now().checked_add(jiff::Span::new().days(90)).unwrap(),
            })
        }
    }

    async fn test_setup(dir: &std::path::Path) -> Arc<AcmeCoordinator> {
        let zone = ZoneStore::new(ZoneStoreConfig {
            zone_dir: Utf8PathBuf::from_path_buf(dir.join("zones")).unwrap(),
            challenge_zone_path: Utf8PathBuf::from_path_buf(dir.join("challenge.zone")).unwrap(),
            primary_nameserver: "ns1.internal".to_owned(),
            hostmaster: "hostmaster.internal".to_owned(),
            soa_refresh: 3600,
            soa_retry: 600,
            soa_expire: 604_800,
            soa_minimum: 300,
        });

        let template_path = Utf8PathBuf::from_path_buf(dir.join("resolver.tmpl")).unwrap();
        tokio::fs::write(&template_path, "{{ for d in domains }}{ d.marker }\n{{ endfor }}")
            .await
            .unwrap();
        let renderer = Renderer::load(
            RendererConfig {
                template_path,
                output_path: Utf8PathBuf::from_path_buf(dir.join("resolver.conf")).unwrap(),
                zones_path: Utf8PathBuf::from_path_buf(dir.join("zones")).unwrap(),
                base_domain: "internal".to_owned(),
            },
            RestartCoordinator::new(Vec::new(), Duration::from_secs(1)),
        )
        .await;
        renderer
            .add_domain("chat.internal", None, &Default::default())
            .await
            .unwrap();

        let config = AcmeCoordinatorConfig {
            directory_url: "https://acme.example.com/directory".to_owned(),
            cert_path: Utf8PathBuf::from_path_buf(dir.join("cert.pem")).unwrap(),
            key_path: Utf8PathBuf::from_path_buf(dir.join("key.pem")).unwrap(),
            renew_before: Duration::from_secs(30 * 86400),
        };
        let metadata_store = Persistence::new(
            Utf8PathBuf::from_path_buf(dir.join("cert-metadata.json")).unwrap(),
            2,
        );

        Arc::new(
            AcmeCoordinator::new(
                config,
                Box::new(CountingIssuer { calls: AtomicU32::new(0) }),
                Arc::new(zone),
                Arc::new(renderer),
                metadata_store,
            )
            .await,
        )
    }

    #[tokio::test]
    async fn add_then_remove_converges_to_ensure_certificate_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_setup(dir.path()).await;
        let reconciler = SanReconciler::new(
            SanReconcilerConfig {
                debounce: Duration::from_millis(20),
                max_backoff: Duration::from_secs(5),
            },
            coordinator.clone(),
        );

        let runner = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                reconciler.run(AcmeMetrics::default(), ZoneMetrics::default()).await;
            })
        };

        reconciler.add("chat.internal".to_owned()).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = coordinator.status().await;
        assert_eq!(status.current_sans, vec!["chat.internal".to_owned()]);

        runner.abort();
    }

    #[tokio::test]
    async fn desired_set_reflects_add_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = test_setup(dir.path()).await;
        let reconciler = SanReconciler::new(
            SanReconcilerConfig {
                debounce: Duration::from_secs(60),
                max_backoff: Duration::from_secs(5),
            },
            coordinator,
        );
        reconciler.add("a.internal".to_owned()).await;
        reconciler.add("b.internal".to_owned()).await;
        reconciler.remove("a.internal").await;
        assert_eq!(reconciler.desired_set().await, vec!["b.internal".to_owned()]);
    }
}
