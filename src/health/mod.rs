//! Health Aggregator (C10) and Health Checkers (C11): each configured
//! checker is run once per request and folded into a combined report, with
//! no caching — every `/health` call re-probes every component.

pub mod environment;
pub mod proxy;
pub mod resolver;
pub mod sync_freshness;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::metrics::HealthMetrics;

pub use proxy::ProxyChecker;
pub use resolver::ResolverChecker;
pub use sync_freshness::SyncFreshnessChecker;

//----------- ComponentHealth ----------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            latency,
            error: None,
        }
    }

    pub fn unhealthy(latency: Duration, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency,
            error: Some(error.into()),
        }
    }
}

//----------- HealthChecker ----------------------------------------------------

/// A single component's liveness probe. Implemented by `ResolverChecker`,
/// `ProxyChecker`, and `SyncFreshnessChecker`; kept as a trait so the
/// aggregator can hold a heterogeneous list without knowing their transport.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> ComponentHealth;
}

//----------- HealthReport ----------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub overall_healthy: bool,
    pub components: HashMap<String, ComponentHealth>,
}

//----------- HealthAggregator ----------------------------------------------------

pub struct HealthAggregator {
    checkers: Vec<Box<dyn HealthChecker>>,
}

impl HealthAggregator {
    pub fn new(checkers: Vec<Box<dyn HealthChecker>>) -> Self {
        Self { checkers }
    }

    /// Run every configured checker once and fold the results into a
    /// single report. Checkers are independent of one another (a slow or
    /// failing one doesn't block the rest).
    pub async fn check_all(&self, metrics: &HealthMetrics) -> HealthReport {
        let mut components = HashMap::with_capacity(self.checkers.len());
        let mut overall_healthy = true;

        for checker in &self.checkers {
            metrics.checks_total.inc();
            let health = checker.check().await;
            if !health.healthy {
                metrics.check_failures_total.inc();
                overall_healthy = false;
            }
            components.insert(checker.name().to_owned(), health);
        }

        HealthReport {
            overall_healthy,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedChecker {
        name: &'static str,
        healthy: bool,
    }

    #[async_trait]
    impl HealthChecker for FixedChecker {
        fn name(&self) -> &str {
            self.name
        }

        async fn check(&self) -> ComponentHealth {
            if self.healthy {
                ComponentHealth::healthy(Duration::from_millis(1))
            } else {
                ComponentHealth::unhealthy(Duration::from_millis(1), "boom")
            }
        }
    }

    #[tokio::test]
    async fn overall_healthy_only_when_every_component_is_healthy() {
        let aggregator = HealthAggregator::new(vec![
            Box::new(FixedChecker { name: "a", healthy: true }),
            Box::new(FixedChecker { name: "b", healthy: true }),
        ]);
        let report = aggregator.check_all(&HealthMetrics::default()).await;
        assert!(report.overall_healthy);
        assert_eq!(report.components.len(), 2);
    }

    #[tokio::test]
    async fn one_unhealthy_component_flips_overall_status_without_masking_the_rest() {
        let aggregator = HealthAggregator::new(vec![
            Box::new(FixedChecker { name: "a", healthy: true }),
            Box::new(FixedChecker { name: "b", healthy: false }),
        ]);
        let report = aggregator.check_all(&HealthMetrics::default()).await;
        assert!(!report.overall_healthy);
        assert!(report.components["a"].healthy);
        assert!(!report.components["b"].healthy);
        assert_eq!(report.components["b"].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn no_checkers_configured_is_vacuously_healthy() {
        let aggregator = HealthAggregator::new(Vec::new());
        let report = aggregator.check_all(&HealthMetrics::default()).await;
        assert!(report.overall_healthy);
        assert!(report.components.is_empty());
    }
}
