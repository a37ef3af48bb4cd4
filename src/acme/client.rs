//! DNS-01 order orchestration against an ACME directory, using
//! `instant-acme` for protocol plumbing and `rcgen` to generate the
//! certificate key pair and CSR.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use jiff::{Span, Timestamp};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};

use crate::acme::{AcmeError, CertificateIssuer};
use crate::metrics::ZoneMetrics;
use crate::persistence::Persistence;
use crate::zone::ZoneStore;

/// Let's Encrypt and most public ACME authorities issue 90-day certificates;
/// `instant-acme`'s order/authorization types don't carry the issued
/// certificate's `notAfter` themselves, so the renewal loop tracks expiry
/// from issuance time plus this assumed validity window.
const ASSUMED_CERT_VALIDITY_DAYS: i64 = 90;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLLS: u32 = 30;

pub struct IssuedCertificate {
    pub cert_chain_pem: String,
    pub private_key_pem: String,
    pub not_after: Timestamp,
}

pub struct AcmeClient {
    directory_url: String,
    contact_email: String,
    credentials_store: Persistence,
}

impl AcmeClient {
    pub fn new(directory_url: String, contact_email: String, credentials_store: Persistence) -> Self {
        Self {
            directory_url,
            contact_email,
            credentials_store,
        }
    }

    /// Load a persisted ACME account, or register a new one and persist its
    /// credentials so a restart doesn't re-register.
    async fn load_or_create_account(&self) -> Result<Account, AcmeClientError> {
        let contact_email = &self.contact_email;
        let credentials_store = &self.credentials_store;
        if let Some(bytes) = credentials_store
            .read()
            .await
            .map_err(|err| AcmeClientError::Storage(err.to_string()))?
        {
            let credentials: AccountCredentials = serde_json::from_slice(&bytes)
                .map_err(|err| AcmeClientError::Storage(err.to_string()))?;
            return Account::from_credentials(credentials)
                .await
                .map_err(|err| AcmeClientError::Protocol(err.to_string()));
        }

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{contact_email}")],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(|err| AcmeClientError::Protocol(err.to_string()))?;

        let bytes = serde_json::to_vec_pretty(&credentials)
            .map_err(|err| AcmeClientError::Storage(err.to_string()))?;
        credentials_store
            .write(&bytes)
            .await
            .map_err(|err| AcmeClientError::Storage(err.to_string()))?;

        Ok(account)
    }

    /// Run a full DNS-01 order for `sans`, publishing and retracting
    /// `_acme-challenge` TXT records via `zone`.
    async fn issue_certificate(
        &self,
        account: &Account,
        sans: &[String],
        zone: &ZoneStore,
        zone_metrics: &ZoneMetrics,
    ) -> Result<IssuedCertificate, AcmeClientError> {
        let identifiers: Vec<Identifier> =
            sans.iter().map(|name| Identifier::Dns(name.clone())).collect();

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|err| AcmeClientError::Protocol(err.to_string()))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|err| AcmeClientError::Protocol(err.to_string()))?;

        let mut published_records = Vec::new();
        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let Identifier::Dns(domain) = &authz.identifier;
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| AcmeClientError::NoDns01Challenge(domain.clone()))?;

            let key_auth = order.key_authorization(challenge);
            let record_name = format!("_acme-challenge.{domain}");
            zone.upsert_txt(&record_name, key_auth.dns_value(), zone_metrics)
                .await
                .map_err(|err| AcmeClientError::ChallengePublish(err.to_string()))?;
            published_records.push(record_name);

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|err| AcmeClientError::Protocol(err.to_string()))?;
        }

        let finalize_result = self.finalize_order(&mut order, sans).await;

        // Challenge records are no longer needed once the order resolves,
        // win or lose; retraction failures are logged, not fatal.
        for record_name in &published_records {
            if let Err(err) = zone.remove_txt(record_name, zone_metrics).await {
                tracing::warn!(record = %record_name, error = %err, "failed to retract ACME challenge record");
            }
        }

        finalize_result
    }

    async fn finalize_order(
        &self,
        order: &mut instant_acme::Order,
        sans: &[String],
    ) -> Result<IssuedCertificate, AcmeClientError> {
        for _ in 0..MAX_POLLS {
            let state = order
                .poll()
                .await
                .map_err(|err| AcmeClientError::Protocol(err.to_string()))?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => return Err(AcmeClientError::OrderRejected),
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }

        let mut params = CertificateParams::new(sans.to_vec())
            .map_err(|err| AcmeClientError::Csr(err.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        let key_pair = KeyPair::generate().map_err(|err| AcmeClientError::Csr(err.to_string()))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|err| AcmeClientError::Csr(err.to_string()))?;

        order
            .finalize(csr.der())
            .await
            .map_err(|err| AcmeClientError::Protocol(err.to_string()))?;

        let cert_chain_pem = loop {
            match order
                .certificate()
                .await
                .map_err(|err| AcmeClientError::Protocol(err.to_string()))?
            {
                Some(pem) => break pem,
                None => tokio::time::sleep(POLL_INTERVAL).await,
            }
        };

        let not_after = Timestamp::now()
            .checked_add(Span::new().days(ASSUMED_CERT_VALIDITY_DAYS))
            .expect("90 days is a representable span");

        Ok(IssuedCertificate {
            cert_chain_pem,
            private_key_pem: key_pair.serialize_pem(),
            not_after,
        })
    }
}

#[async_trait]
impl CertificateIssuer for AcmeClient {
    async fn issue(
        &self,
        sans: &[String],
        zone: &ZoneStore,
        zone_metrics: &ZoneMetrics,
    ) -> Result<IssuedCertificate, AcmeError> {
        let account = self
            .load_or_create_account()
            .await
            .map_err(|err| AcmeError::Issuance(err.to_string()))?;
        self.issue_certificate(&account, sans, zone, zone_metrics)
            .await
            .map_err(|err| AcmeError::Issuance(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcmeClientError {
    Protocol(String),
    Storage(String),
    ChallengePublish(String),
    NoDns01Challenge(String),
    OrderRejected,
    Csr(String),
}

impl fmt::Display for AcmeClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "ACME protocol error: {msg}"),
            Self::Storage(msg) => write!(f, "ACME account storage error: {msg}"),
            Self::ChallengePublish(msg) => write!(f, "failed to publish DNS-01 challenge: {msg}"),
            Self::NoDns01Challenge(domain) => {
                write!(f, "authority offered no DNS-01 challenge for {domain}")
            }
            Self::OrderRejected => write!(f, "ACME authority rejected the order"),
            Self::Csr(msg) => write!(f, "failed to build certificate signing request: {msg}"),
        }
    }
}

impl std::error::Error for AcmeClientError {}
