//! The overlay-network API client trait and its `reqwest`-backed
//! implementation.
//!
//! Kept as a thin trait so tests can supply a fake device list without
//! reaching the network, following the same shape as the fake backends
//! used across the wider example corpus for exactly this kind of outbound
//! dependency.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::InventoryError;

/// The wire shape returned by the overlay-network control API; mapped into
/// this crate's own [`super::Device`] model by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayDevice {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<IpAddr>,
    #[serde(default)]
    pub online: bool,
}

#[async_trait]
pub trait OverlayClient: Send + Sync {
    async fn list_devices(&self, network_id: &str) -> Result<Vec<OverlayDevice>, InventoryError>;
}

//----------- ReqwestOverlayClient --------------------------------------------------

pub struct ReqwestOverlayClient {
    http: reqwest::Client,
    api_base_url: String,
    api_token: String,
}

impl ReqwestOverlayClient {
    pub fn new(api_base_url: String, api_token: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is valid");
        Self {
            http,
            api_base_url,
            api_token,
        }
    }
}

#[async_trait]
impl OverlayClient for ReqwestOverlayClient {
    async fn list_devices(&self, network_id: &str) -> Result<Vec<OverlayDevice>, InventoryError> {
        let url = format!("{}/network/{network_id}/member", self.api_base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .map_err(|err| InventoryError::UpstreamUnavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(InventoryError::UpstreamUnavailable(format!(
                "overlay API returned status {}",
                response.status()
            )));
        }

        response
            .json::<Vec<OverlayDevice>>()
            .await
            .map_err(|err| InventoryError::UpstreamUnavailable(err.to_string()))
    }
}
