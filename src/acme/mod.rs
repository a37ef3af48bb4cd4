//! ACME Coordinator (C6): obtains and renews a certificate whose SAN set
//! equals the live hostname set, publishing DNS-01 challenges via the Zone
//! Store.
//!
//! At most one ACME operation is in flight at a time: [`AcmeCoordinator`]'s
//! `tokio::sync::Mutex` is held across the entire issuance/renewal
//! sequence, including the ACME network round-trips, per the spec's
//! explicit exception to "no lock across a network call" for this
//! component alone.

pub mod client;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::metrics::{AcmeMetrics, ZoneMetrics};
use crate::persistence::Persistence;
use crate::resolver::{Renderer, ResolverError};
use crate::util;
use crate::zone::ZoneStore;
use client::IssuedCertificate;

//----------- CertificateIssuer ----------------------------------------------------

/// DNS-01 order orchestration, abstracted so the coordinator's retry and
/// bookkeeping logic can be tested without a real ACME authority.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(
        &self,
        sans: &[String],
        zone: &ZoneStore,
        zone_metrics: &ZoneMetrics,
    ) -> Result<IssuedCertificate, AcmeError>;
}

//----------- CertificateMetadata / CertificateStatus -------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CertificateMetadata {
    current_sans: Vec<String>,
    not_after: Option<Timestamp>,
    issuer: Option<String>,
    pending_sans: Vec<String>,
}

/// Public view of certificate state. Deliberately carries no key material,
/// satisfying "private_key_pem never serialised in API responses" by never
/// having one to serialise in the first place.
#[derive(Debug, Clone)]
pub struct CertificateStatus {
    pub current_sans: Vec<String>,
    pub not_after: Option<Timestamp>,
    pub issuer: Option<String>,
    pub pending_sans: Vec<String>,
}

//----------- AcmeCoordinatorConfig -----------------------------------------------

#[derive(Debug, Clone)]
pub struct AcmeCoordinatorConfig {
    pub directory_url: String,
    pub cert_path: Utf8PathBuf,
    pub key_path: Utf8PathBuf,
    pub renew_before: Duration,
}

//----------- AcmeCoordinator -----------------------------------------------------

pub struct AcmeCoordinator {
    config: AcmeCoordinatorConfig,
    issuer: Box<dyn CertificateIssuer>,
    zone: Arc<ZoneStore>,
    renderer: Arc<Renderer>,
    metadata_store: Persistence,
    state: Mutex<CertificateMetadata>,
}

impl AcmeCoordinator {
    pub async fn new(
        config: AcmeCoordinatorConfig,
        issuer: Box<dyn CertificateIssuer>,
        zone: Arc<ZoneStore>,
        renderer: Arc<Renderer>,
        metadata_store: Persistence,
    ) -> Self {
        let metadata = match metadata_store.read().await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_default(),
            _ => CertificateMetadata::default(),
        };
        Self {
            config,
            issuer,
            zone,
            renderer,
            metadata_store,
            state: Mutex::new(metadata),
        }
    }

    pub async fn status(&self) -> CertificateStatus {
        let meta = self.state.lock().await;
        CertificateStatus {
            current_sans: meta.current_sans.clone(),
            not_after: meta.not_after,
            issuer: meta.issuer.clone(),
            pending_sans: meta.pending_sans.clone(),
        }
    }

    /// Obtain a certificate whose SAN set equals `sans`, or renew the
    /// existing one if the set differs or expiry falls within the
    /// renew-before window. Refuses an empty SAN set.
    pub async fn ensure_certificate(
        &self,
        sans: &[String],
        metrics: &AcmeMetrics,
        zone_metrics: &ZoneMetrics,
    ) -> Result<(), AcmeError> {
        let mut sans = sans.to_vec();
        sans.sort();
        sans.dedup();
        if sans.is_empty() {
            return Err(AcmeError::EmptySanSet);
        }

        let mut meta = self.state.lock().await;
        let renewal_due = meta
            .not_after
            .map(|not_after| needs_renewal(not_after, self.config.renew_before))
            .unwrap_or(true);
        if meta.current_sans == sans && !renewal_due {
            return Ok(());
        }

        self.issue_and_install(&mut meta, &sans, metrics, zone_metrics).await
    }

    /// Called by the renewal timer: renews the current SAN set if its
    /// certificate is within the renew-before window of expiry. A failed
    /// renewal never invalidates the certificate already on disk.
    pub async fn renew_if_due(
        &self,
        metrics: &AcmeMetrics,
        zone_metrics: &ZoneMetrics,
    ) -> Result<(), AcmeError> {
        let mut meta = self.state.lock().await;
        let Some(not_after) = meta.not_after else {
            return Ok(());
        };
        if !needs_renewal(not_after, self.config.renew_before) {
            return Ok(());
        }
        let sans = meta.current_sans.clone();
        if sans.is_empty() {
            return Ok(());
        }
        self.issue_and_install(&mut meta, &sans, metrics, zone_metrics).await
    }

    async fn issue_and_install(
        &self,
        meta: &mut CertificateMetadata,
        sans: &[String],
        metrics: &AcmeMetrics,
        zone_metrics: &ZoneMetrics,
    ) -> Result<(), AcmeError> {
        let issued = match self.issuer.issue(sans, &self.zone, zone_metrics).await {
            Ok(issued) => issued,
            Err(err) => {
                metrics.renewal_failures_total.inc();
                return Err(err);
            }
        };

        util::write_file_async(self.config.key_path.clone(), issued.private_key_pem.into_bytes())
            .await
            .map_err(|err| AcmeError::Storage(err.to_string()))?;
        util::write_file_async(self.config.cert_path.clone(), issued.cert_chain_pem.into_bytes())
            .await
            .map_err(|err| AcmeError::Storage(err.to_string()))?;

        meta.current_sans = sans.to_vec();
        meta.not_after = Some(issued.not_after);
        meta.issuer = Some(self.config.directory_url.clone());
        meta.pending_sans.clear();
        self.persist_metadata(meta).await?;

        metrics.renewals_total.inc();
        metrics
            .cert_expiry_seconds
            .set(issued.not_after.as_second() - Timestamp::now().as_second());

        for hostname in sans {
            if let Err(err) = self
                .renderer
                .enable_tls(
                    hostname,
                    self.config.cert_path.clone(),
                    self.config.key_path.clone(),
                    &Default::default(),
                )
                .await
            {
                if !matches!(err, ResolverError::DomainNotFound(_)) {
                    tracing::warn!(hostname = %hostname, error = %err, "failed to signal renderer of new certificate");
                }
            }
        }

        Ok(())
    }

    async fn persist_metadata(&self, meta: &CertificateMetadata) -> Result<(), AcmeError> {
        let bytes = serde_json::to_vec_pretty(meta).map_err(|err| AcmeError::Storage(err.to_string()))?;
        self.metadata_store
            .write(&bytes)
            .await
            .map_err(|err| AcmeError::Storage(err.to_string()))
    }
}

fn needs_renewal(not_after: Timestamp, renew_before: Duration) -> bool {
    Timestamp::now().as_second() + renew_before.as_secs() as i64 >= not_after.as_second()
}

//----------- AcmeError -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcmeError {
    EmptySanSet,
    Issuance(String),
    Storage(String),
}

impl fmt::Display for AcmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySanSet => write!(f, "refusing to request a certificate with an empty SAN set"),
            Self::Issuance(msg) => write!(f, "certificate issuance failed: {msg}"),
            Self::Storage(msg) => write!(f, "ACME coordinator storage error: {msg}"),
        }
    }
}

impl std::error::Error for AcmeError {}
