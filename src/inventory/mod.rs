//! Device Inventory (C3): polls the overlay-network API, caches devices
//! with a TTL, resolves name/address lookups, and identifies "self".

pub mod client;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Instant;

pub use client::{OverlayClient, OverlayDevice};

const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
const RESOLVE_RETRIES: u32 = 3;
const RESOLVE_RETRY_DELAY: Duration = Duration::from_millis(250);

//----------- Device ----------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub overlay_name: String,
    pub addresses: Vec<IpAddr>,
    pub online: bool,
    pub annotations: Option<DeviceAnnotation>,
}

impl Device {
    /// The "primary overlay address": the first address in the
    /// overlay-private prefix `100.64.0.0/10`.
    pub fn primary_address(&self) -> Option<IpAddr> {
        self.addresses.iter().copied().find(|addr| is_overlay_address(*addr))
    }
}

fn is_overlay_address(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            octets[0] == 100 && (octets[1] & 0b1100_0000) == 0b0100_0000
        }
        IpAddr::V6(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceAnnotation {
    pub dns_name: Option<String>,
    pub description: Option<String>,
}

//----------- AnnotationStore -------------------------------------------------------

/// Durable storage for operator-supplied device annotations. Implemented
/// atop the Persistence primitive (C5) in the wired-up daemon; kept as a
/// trait here so the Inventory can be tested without touching a real file.
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    async fn load(&self) -> HashMap<String, DeviceAnnotation>;
    async fn save(&self, all: &HashMap<String, DeviceAnnotation>) -> Result<(), InventoryError>;

    /// Where annotations are persisted, for `GET /device-storage-info`.
    /// Stores without a real on-disk backing (test fakes) keep the default.
    async fn storage_info(&self) -> crate::persistence::StorageInfo {
        crate::persistence::StorageInfo {
            path: String::new(),
            exists: false,
            backups: Vec::new(),
        }
    }
}

//----------- Inventory --------------------------------------------------------------

struct CacheEntry {
    device: Device,
    /// Number of consecutive refreshes this device has been absent from.
    /// Reset to 0 whenever the device is seen again.
    misses: u32,
}

/// A device absent from this many consecutive polls is evicted.
const MAX_CONSECUTIVE_MISSES: u32 = 2;

struct CacheState {
    devices: HashMap<String, CacheEntry>,
    last_refresh: Option<Instant>,
}

pub struct Inventory {
    client: Box<dyn OverlayClient>,
    network_id: String,
    self_name: String,
    ttl: Duration,
    cache: RwLock<CacheState>,
    annotations: Box<dyn AnnotationStore>,
}

impl Inventory {
    pub async fn new(
        client: Box<dyn OverlayClient>,
        network_id: String,
        self_name: String,
        annotations: Box<dyn AnnotationStore>,
    ) -> Self {
        Self {
            client,
            network_id,
            self_name,
            ttl: DEFAULT_TTL,
            cache: RwLock::new(CacheState {
                devices: HashMap::default(),
                last_refresh: None,
            }),
            annotations,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Return the cached snapshot, refreshing first if the TTL has expired.
    pub async fn list_devices(&self) -> Result<Vec<Device>, InventoryError> {
        self.refresh_if_stale().await?;
        let cache = self.cache.read().await;
        Ok(cache.devices.values().map(|e| e.device.clone()).collect())
    }

    pub async fn get_device_by_name(&self, name: &str) -> Result<Device, InventoryError> {
        self.refresh_if_stale().await?;
        let cache = self.cache.read().await;
        cache
            .devices
            .values()
            .find(|e| e.device.overlay_name == name)
            .map(|e| e.device.clone())
            .ok_or_else(|| InventoryError::NotFound(name.to_owned()))
    }

    pub async fn get_device_by_address(&self, address: IpAddr) -> Result<Device, InventoryError> {
        self.refresh_if_stale().await?;
        let cache = self.cache.read().await;
        cache
            .devices
            .values()
            .find(|e| e.device.addresses.contains(&address))
            .map(|e| e.device.clone())
            .ok_or_else(|| InventoryError::NotFound(address.to_string()))
    }

    /// Resolve a device's primary overlay address, retrying a bounded
    /// number of times on a miss (a fresh poll may simply not have seen the
    /// device yet).
    pub async fn resolve_address(&self, name: &str) -> Result<IpAddr, InventoryError> {
        for attempt in 0..=RESOLVE_RETRIES {
            match self.get_device_by_name(name).await {
                Ok(device) => {
                    return device
                        .primary_address()
                        .ok_or_else(|| InventoryError::NotFound(name.to_owned()))
                }
                Err(InventoryError::NotFound(_)) if attempt < RESOLVE_RETRIES => {
                    tokio::time::sleep(RESOLVE_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(InventoryError::NotFound(name.to_owned()))
    }

    /// The device representing the host this process runs on.
    pub async fn self_device(&self) -> Result<Device, InventoryError> {
        self.get_device_by_name(&self.self_name).await
    }

    /// Where device annotations are persisted on disk.
    pub async fn storage_info(&self) -> crate::persistence::StorageInfo {
        self.annotations.storage_info().await
    }

    /// Persist operator-supplied annotations for a device.
    pub async fn annotate(
        &self,
        id: &str,
        dns_name: Option<String>,
        description: Option<String>,
    ) -> Result<(), InventoryError> {
        {
            let cache = self.cache.read().await;
            if !cache.devices.contains_key(id) {
                return Err(InventoryError::NotFound(id.to_owned()));
            }
        }

        let mut all = self.annotations.load().await;
        let entry = all.entry(id.to_owned()).or_default();
        if dns_name.is_some() {
            entry.dns_name = dns_name;
        }
        if description.is_some() {
            entry.description = description;
        }
        self.annotations.save(&all).await?;

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.devices.get_mut(id) {
            cached.device.annotations = all.get(id).cloned();
        }
        Ok(())
    }

    async fn refresh_if_stale(&self) -> Result<(), InventoryError> {
        let needs_refresh = {
            let cache = self.cache.read().await;
            match cache.last_refresh {
                Some(last) => last.elapsed() >= self.ttl,
                None => true,
            }
        };
        if needs_refresh {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Merge a fresh poll into the existing cache: devices seen in this
    /// poll are inserted or updated with their miss count reset, devices
    /// absent from it have their miss count bumped and are evicted only
    /// once absent from `MAX_CONSECUTIVE_MISSES` polls in a row.
    async fn refresh(&self) -> Result<(), InventoryError> {
        let raw = self.client.list_devices(&self.network_id).await?;
        let annotations = self.annotations.load().await;

        let mut cache = self.cache.write().await;
        let now = Instant::now();

        let mut seen = HashSet::with_capacity(raw.len());
        for d in raw {
            seen.insert(d.id.clone());
            let annotation = annotations.get(&d.id).cloned();
            cache.devices.insert(
                d.id.clone(),
                CacheEntry {
                    device: Device {
                        id: d.id,
                        overlay_name: d.name,
                        addresses: d.addresses,
                        online: d.online,
                        annotations: annotation,
                    },
                    misses: 0,
                },
            );
        }

        cache.devices.retain(|id, entry| {
            if seen.contains(id) {
                true
            } else {
                entry.misses += 1;
                entry.misses < MAX_CONSECUTIVE_MISSES
            }
        });

        cache.last_refresh = Some(now);
        Ok(())
    }
}

//----------- InventoryError --------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryError {
    NotFound(String),
    UpstreamUnavailable(String),
    IOError(String),
}

impl fmt::Display for InventoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "device not found: {what}"),
            Self::UpstreamUnavailable(msg) => write!(f, "overlay network unavailable: {msg}"),
            Self::IOError(msg) => write!(f, "annotation store I/O error: {msg}"),
        }
    }
}

impl std::error::Error for InventoryError {}
