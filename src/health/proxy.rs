//! Proxy health checker: an HTTP GET against the proxy's admin health
//! endpoint, the same local admin interface the Proxy Router (C4) posts
//! reload requests to.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{ComponentHealth, HealthChecker};

pub struct ProxyChecker {
    admin_base: String,
    http: reqwest::Client,
}

impl ProxyChecker {
    pub fn new(admin_base: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client configuration is valid");
        Self { admin_base, http }
    }

    async fn probe(&self) -> Result<(), String> {
        let url = format!("{}/health", self.admin_base.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| format!("proxy health request failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!(
                "proxy health endpoint returned {}",
                response.status()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl HealthChecker for ProxyChecker {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn check(&self) -> ComponentHealth {
        let started = Instant::now();
        match self.probe().await {
            Ok(()) => ComponentHealth::healthy(started.elapsed()),
            Err(err) => ComponentHealth::unhealthy(started.elapsed(), err),
        }
    }
}
