//! Zone Store (C1): owns zone files for the configured domains, with
//! atomic record upsert/delete and idempotent record shape.
//!
//! All mutation flows through [`ZoneStore`]'s single mutation lock (the
//! spec calls the Zone Store "single-writer"): read the current file,
//! rewrite the line list in memory, write to a sibling temp file, rename
//! over the target. A [`tokio::sync::Mutex`] is used rather than
//! `std::sync::Mutex` because the critical section spans the file read,
//! the temp-write-rename, and (eventually) a reload notification — all
//! `.await` points — which a `std::sync::Mutex` guard cannot survive in an
//! async fn without making the future `!Send`.

pub mod file;

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

use camino::Utf8PathBuf;
use tokio::sync::Mutex;

use crate::metrics::ZoneMetrics;
use crate::util;
use file::ZoneLine;

//----------- ZoneStoreConfig ----------------------------------------------------

#[derive(Debug, Clone)]
pub struct ZoneStoreConfig {
    pub zone_dir: Utf8PathBuf,
    pub challenge_zone_path: Utf8PathBuf,
    pub primary_nameserver: String,
    pub hostmaster: String,
    pub soa_refresh: u32,
    pub soa_retry: u32,
    pub soa_expire: u32,
    pub soa_minimum: u32,
}

//----------- ZoneStore -----------------------------------------------------------

pub struct ZoneStore {
    config: ZoneStoreConfig,
    lock: Mutex<()>,
}

impl ZoneStore {
    pub fn new(config: ZoneStoreConfig) -> Self {
        Self {
            config,
            lock: Mutex::new(()),
        }
    }

    fn zone_path(&self, service: &str) -> Utf8PathBuf {
        self.config.zone_dir.join(format!("{service}.zone"))
    }

    /// Create the zone file for `service` if it doesn't already exist, with
    /// an SOA, NS, and a self `A` record pointed at `self_address`. Idempotent.
    pub async fn ensure_zone(
        &self,
        service: &str,
        self_address: IpAddr,
        metrics: &ZoneMetrics,
    ) -> Result<(), ZoneError> {
        validate_service_name(service)?;
        let _guard = self.lock.lock().await;

        let path = self.zone_path(service);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        let origin = format!("{service}.");
        let lines = vec![
            ZoneLine::Origin(origin.clone()),
            ZoneLine::Soa {
                primary_ns: format!("{}.", self.config.primary_nameserver),
                hostmaster: format!("{}.", self.config.hostmaster),
                serial: 1,
                refresh: self.config.soa_refresh,
                retry: self.config.soa_retry,
                expire: self.config.soa_expire,
                minimum: self.config.soa_minimum,
            },
            ZoneLine::Ns(format!("{}.", self.config.primary_nameserver)),
            ZoneLine::A {
                name: "@".to_owned(),
                address: self_address,
            },
        ];

        self.write_zone(&path, &lines, metrics).await?;
        Ok(())
    }

    /// Insert or update a single `A` record. No-op if an identical record
    /// already exists; replaces in place if the address differs; appends
    /// otherwise.
    pub async fn upsert_a(
        &self,
        service: &str,
        name: &str,
        address: IpAddr,
        metrics: &ZoneMetrics,
    ) -> Result<(), ZoneError> {
        validate_service_name(service)?;
        let _guard = self.lock.lock().await;
        let path = self.zone_path(service);
        let mut lines = self.read_zone(&path).await?;

        let existing = lines.iter_mut().find(
            |line| matches!(line, ZoneLine::A { name: n, .. } if n == name),
        );

        match existing {
            Some(ZoneLine::A { address: a, .. }) if *a == address => {
                // Already correct; idempotent no-op, no write.
                return Ok(());
            }
            Some(ZoneLine::A { address: a, .. }) => {
                *a = address;
            }
            _ => {
                lines.push(ZoneLine::A {
                    name: name.to_owned(),
                    address,
                });
            }
        }

        self.write_zone(&path, &lines, metrics).await
    }

    /// Remove every `A` record matching `name`. Absence is not an error.
    pub async fn remove_a(
        &self,
        service: &str,
        name: &str,
        metrics: &ZoneMetrics,
    ) -> Result<(), ZoneError> {
        validate_service_name(service)?;
        let _guard = self.lock.lock().await;
        let path = self.zone_path(service);
        let mut lines = self.read_zone(&path).await?;

        let before = lines.len();
        lines.retain(|line| !matches!(line, ZoneLine::A { name: n, .. } if n == name));
        if lines.len() == before {
            return Ok(());
        }

        self.write_zone(&path, &lines, metrics).await
    }

    /// Remove only the exact `(name, address)` pair, leaving any other `A`
    /// record for `name` (e.g. one just upserted for a new address) intact.
    pub async fn drop_a(
        &self,
        service: &str,
        name: &str,
        address: IpAddr,
        metrics: &ZoneMetrics,
    ) -> Result<(), ZoneError> {
        validate_service_name(service)?;
        let _guard = self.lock.lock().await;
        let path = self.zone_path(service);
        let mut lines = self.read_zone(&path).await?;

        let before = lines.len();
        lines.retain(
            |line| !matches!(line, ZoneLine::A { name: n, address: a } if n == name && *a == address),
        );
        if lines.len() == before {
            return Ok(());
        }

        self.write_zone(&path, &lines, metrics).await
    }

    /// Create the dedicated challenge zone file if it doesn't already
    /// exist, so `upsert_txt`/`remove_txt` have somewhere to write.
    /// Idempotent, mirroring [`Self::ensure_zone`].
    pub async fn ensure_challenge_zone(
        &self,
        base_domain: &str,
        metrics: &ZoneMetrics,
    ) -> Result<(), ZoneError> {
        let _guard = self.lock.lock().await;
        let path = self.config.challenge_zone_path.clone();
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        let origin = format!("_acme-challenge.{base_domain}.");
        let lines = vec![
            ZoneLine::Origin(origin),
            ZoneLine::Soa {
                primary_ns: format!("{}.", self.config.primary_nameserver),
                hostmaster: format!("{}.", self.config.hostmaster),
                serial: 1,
                refresh: self.config.soa_refresh,
                retry: self.config.soa_retry,
                expire: self.config.soa_expire,
                minimum: self.config.soa_minimum,
            },
            ZoneLine::Ns(format!("{}.", self.config.primary_nameserver)),
        ];

        self.write_zone(&path, &lines, metrics).await
    }

    /// Publish an `_acme-challenge` TXT record into the dedicated
    /// challenge zone, distinct from any production zone file.
    pub async fn upsert_txt(
        &self,
        name: &str,
        value: &str,
        metrics: &ZoneMetrics,
    ) -> Result<(), ZoneError> {
        let _guard = self.lock.lock().await;
        let path = self.config.challenge_zone_path.clone();
        let mut lines = self.read_zone(&path).await?;

        let existing = lines.iter_mut().find(
            |line| matches!(line, ZoneLine::Txt { name: n, .. } if n == name),
        );
        match existing {
            Some(ZoneLine::Txt { value: v, .. }) if v == value => return Ok(()),
            Some(ZoneLine::Txt { value: v, .. }) => *v = value.to_owned(),
            _ => lines.push(ZoneLine::Txt {
                name: name.to_owned(),
                value: value.to_owned(),
            }),
        }

        self.write_zone(&path, &lines, metrics).await
    }

    /// Retract an `_acme-challenge` TXT record. Absence is not an error.
    pub async fn remove_txt(&self, name: &str, metrics: &ZoneMetrics) -> Result<(), ZoneError> {
        let _guard = self.lock.lock().await;
        let path = self.config.challenge_zone_path.clone();
        let mut lines = self.read_zone(&path).await?;

        let before = lines.len();
        lines.retain(|line| !matches!(line, ZoneLine::Txt { name: n, .. } if n == name));
        if lines.len() == before {
            return Ok(());
        }

        self.write_zone(&path, &lines, metrics).await
    }

    async fn read_zone(&self, path: &Utf8PathBuf) -> Result<Vec<ZoneLine>, ZoneError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(file::parse(&contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(ZoneError::ZoneMissing(path.to_string()))
            }
            Err(err) => Err(ZoneError::IOError(err.to_string())),
        }
    }

    async fn write_zone(
        &self,
        path: &Utf8PathBuf,
        lines: &[ZoneLine],
        metrics: &ZoneMetrics,
    ) -> Result<(), ZoneError> {
        let mut lines = lines.to_vec();
        file::bump_serial(&mut lines);
        let rendered = file::render(&lines);

        let result = util::write_file_async(path.clone(), rendered.into_bytes()).await;
        match result {
            Ok(()) => {
                metrics.writes_total.inc();
                let record_count = lines
                    .iter()
                    .filter(|l| matches!(l, ZoneLine::A { .. } | ZoneLine::Txt { .. }))
                    .count();
                metrics.records.set(record_count as i64);
                if let Some(ZoneLine::Soa { serial, .. }) = lines
                    .iter()
                    .find(|l| matches!(l, ZoneLine::Soa { .. }))
                {
                    metrics.serial.set(*serial as i64);
                }
                Ok(())
            }
            Err(err) => {
                metrics.write_failures_total.inc();
                Err(ZoneError::IOError(err.to_string()))
            }
        }
    }
}

fn validate_service_name(service: &str) -> Result<(), ZoneError> {
    let valid = !service.is_empty()
        && service
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ZoneError::InvalidName(service.to_owned()))
    }
}

//----------- ZoneError -----------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZoneError {
    InvalidName(String),
    ZoneMissing(String),
    Malformed(String),
    IOError(String),
}

impl fmt::Display for ZoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid service name '{name}'"),
            Self::ZoneMissing(path) => write!(f, "zone file missing: {path}"),
            Self::Malformed(msg) => write!(f, "malformed zone data: {msg}"),
            Self::IOError(msg) => write!(f, "zone I/O error: {msg}"),
        }
    }
}

impl std::error::Error for ZoneError {}
