//! Wire types shared between the HTTP API and its callers.
//!
//! These mirror the JSON bodies documented for the control plane's HTTP
//! surface: requests and results for record management, device
//! administration, and health reporting.

use std::fmt::{self, Display};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

//----------- Records -----------------------------------------------------------

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AddRecordRequest {
    pub service_name: String,
    pub name: String,
    pub port: Option<u16>,
    pub target_device: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct RemoveRecordRequest {
    pub service_name: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub ip: IpAddr,
    pub proxy_rule: Option<ProxyRuleView>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
}

impl Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("A")
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "https")]
    Https,
}

impl Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ProxyRuleView {
    pub hostname: String,
    pub target_ip: IpAddr,
    pub target_port: u16,
    pub scheme: Scheme,
}

/// Error returned by `POST /add-record`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum CreateRecordError {
    InvalidInput(String),
    NotFound(String),
    Conflict(String),
    UpstreamUnavailable(String),
    IoError(String),
}

impl Display for CreateRecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::UpstreamUnavailable(msg) => write!(f, "upstream unavailable: {msg}"),
            Self::IoError(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for CreateRecordError {}

/// Error returned by `POST /remove-record`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum RemoveRecordError {
    InvalidInput(String),
    IoError(String),
}

impl Display for RemoveRecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Self::IoError(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for RemoveRecordError {}

//----------- Devices -------------------------------------------------------------

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceView {
    pub id: String,
    pub overlay_name: String,
    pub dns_name: Option<String>,
    pub description: Option<String>,
    pub addresses: Vec<IpAddr>,
    pub online: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ListDevicesResult {
    pub devices: Vec<DeviceView>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AnnotateDeviceRequest {
    pub id: String,
    pub dns_name: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub enum AnnotateDeviceError {
    NotFound(String),
    IoError(String),
}

impl Display for AnnotateDeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::IoError(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for AnnotateDeviceError {}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceStorageInfo {
    pub path: String,
    pub exists: bool,
    pub backups: Vec<String>,
}

//----------- Health --------------------------------------------------------------

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub latency_ms: Option<u64>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub components: Vec<(String, ComponentHealth)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_round_trips_through_json() {
        let json = serde_json::to_string(&Scheme::Https).unwrap();
        assert_eq!(json, "\"https\"");
        let back: Scheme = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Scheme::Https);
    }

    #[test]
    fn record_type_displays_as_a() {
        assert_eq!(RecordType::A.to_string(), "A");
    }
}
