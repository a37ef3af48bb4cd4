//! Resolver Config Renderer (C2): owns the resolver's main config file,
//! rendered from a template against the live domain set, with atomic
//! replace and a restart-coordinator handshake.

pub mod restart;
pub mod template;

use std::fmt;

use camino::Utf8PathBuf;
use jiff::Timestamp;

use crate::metrics::ResolverMetrics;
use crate::util;
use restart::RestartCoordinator;

//----------- Types ---------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: Utf8PathBuf,
    pub key_path: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEntry {
    pub name: String,
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub template_path: Utf8PathBuf,
    pub output_path: Utf8PathBuf,
    pub zones_path: Utf8PathBuf,
    pub base_domain: String,
}

struct RendererState {
    domains: Vec<DomainEntry>,
    version: u64,
    generated_at: Option<Timestamp>,
}

//----------- Renderer --------------------------------------------------------------

pub struct Renderer {
    config: RendererConfig,
    state: tokio::sync::RwLock<RendererState>,
    restart: RestartCoordinator,
}

impl Renderer {
    /// Construct a renderer, reconstructing its in-memory domain set from
    /// any previously rendered config file so operator-installed entries
    /// aren't dropped on the first render after a restart.
    pub async fn load(config: RendererConfig, restart: RestartCoordinator) -> Self {
        let domains = match tokio::fs::read_to_string(&config.output_path).await {
            Ok(contents) => template::recover_domains(&contents),
            Err(_) => Vec::new(),
        };

        Self {
            config,
            state: tokio::sync::RwLock::new(RendererState {
                domains,
                version: 0,
                generated_at: None,
            }),
            restart,
        }
    }

    pub async fn add_domain(
        &self,
        name: &str,
        tls: Option<TlsConfig>,
        metrics: &ResolverMetrics,
    ) -> Result<(), ResolverError> {
        let mut state = self.state.write().await;
        match state.domains.iter_mut().find(|d| d.name == name) {
            Some(existing) => existing.tls = tls,
            None => state.domains.push(DomainEntry {
                name: name.to_owned(),
                tls,
            }),
        }
        self.render_and_apply(&mut state, metrics).await
    }

    pub async fn remove_domain(
        &self,
        name: &str,
        metrics: &ResolverMetrics,
    ) -> Result<(), ResolverError> {
        let mut state = self.state.write().await;
        state.domains.retain(|d| d.name != name);
        self.render_and_apply(&mut state, metrics).await
    }

    pub async fn enable_tls(
        &self,
        name: &str,
        cert_path: Utf8PathBuf,
        key_path: Utf8PathBuf,
        metrics: &ResolverMetrics,
    ) -> Result<(), ResolverError> {
        let mut state = self.state.write().await;
        let Some(entry) = state.domains.iter_mut().find(|d| d.name == name) else {
            return Err(ResolverError::DomainNotFound(name.to_owned()));
        };
        entry.tls = Some(TlsConfig { cert_path, key_path });
        self.render_and_apply(&mut state, metrics).await
    }

    pub async fn disable_tls(
        &self,
        name: &str,
        metrics: &ResolverMetrics,
    ) -> Result<(), ResolverError> {
        let mut state = self.state.write().await;
        let Some(entry) = state.domains.iter_mut().find(|d| d.name == name) else {
            return Err(ResolverError::DomainNotFound(name.to_owned()));
        };
        entry.tls = None;
        self.render_and_apply(&mut state, metrics).await
    }

    pub async fn get_all_domains(&self) -> Vec<DomainEntry> {
        self.state.read().await.domains.clone()
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    async fn render_and_apply(
        &self,
        state: &mut RendererState,
        metrics: &ResolverMetrics,
    ) -> Result<(), ResolverError> {
        let template_src = tokio::fs::read_to_string(&self.config.template_path)
            .await
            .map_err(|err| ResolverError::IOError(err.to_string()))?;

        let domains: Vec<_> = state.domains.iter().map(template::DomainCtx::from).collect();

        // Render a comparison copy stamped with the version/timestamp
        // currently recorded in `state`, i.e. the ones already on disk if
        // nothing has changed since the last write. Comparing against this
        // rather than a freshly bumped version/timestamp is what lets an
        // unchanged domain set actually skip the write and restart below,
        // since `version`/`generated_at` would otherwise make the rendered
        // bytes differ from the existing file on every call.
        let comparison_context = template::RenderContext {
            base_domain: self.config.base_domain.clone(),
            domains: domains.clone(),
            zones_path: self.config.zones_path.to_string(),
            generated_at: state.generated_at.map(|t| t.to_string()).unwrap_or_default(),
            version: state.version,
        };
        let comparison_rendered = template::render(&template_src, &comparison_context)?;

        let existing = tokio::fs::read(&self.config.output_path).await.ok();
        if existing.as_deref() == Some(comparison_rendered.as_bytes()) {
            // Render-skip optimisation: nothing changed, no write or restart.
            return Ok(());
        }

        let new_version = state.version + 1;
        let new_generated_at = Timestamp::now();
        let context = template::RenderContext {
            base_domain: self.config.base_domain.clone(),
            domains,
            zones_path: self.config.zones_path.to_string(),
            generated_at: new_generated_at.to_string(),
            version: new_version,
        };
        let rendered = template::render(&template_src, &context)?;

        util::write_file_async(self.config.output_path.clone(), rendered.into_bytes())
            .await
            .map_err(|err| ResolverError::IOError(err.to_string()))?;
        metrics.config_renders_total.inc();

        state.version = new_version;
        state.generated_at = Some(new_generated_at);

        let start = std::time::Instant::now();
        match self.restart.restart().await {
            Ok(()) => {
                metrics.restarts_total.inc();
                metrics
                    .last_restart_duration_ms
                    .set(start.elapsed().as_millis() as i64);
                Ok(())
            }
            Err(err) => {
                metrics.restart_failures_total.inc();
                Err(err)
            }
        }
    }
}

//----------- ResolverError --------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverError {
    TemplateError(String),
    RestartError(String),
    RollbackNotImplemented,
    DomainNotFound(String),
    IOError(String),
}

impl fmt::Display for ResolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TemplateError(msg) => write!(f, "template error: {msg}"),
            Self::RestartError(msg) => write!(f, "restart error: {msg}"),
            Self::RollbackNotImplemented => write!(f, "configuration rollback is not implemented"),
            Self::DomainNotFound(name) => write!(f, "domain not found: {name}"),
            Self::IOError(msg) => write!(f, "resolver I/O error: {msg}"),
        }
    }
}

impl std::error::Error for ResolverError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const TEMPLATE: &str = "base={ base_domain }\nversion={ version }\n{{ for d in domains }}{ d.marker }\n{{ endfor }}";

    async fn test_renderer() -> (tempfile::TempDir, Renderer) {
        let dir = tempfile::tempdir().unwrap();
        let template_path = Utf8PathBuf::from_path_buf(dir.path().join("template.tmpl")).unwrap();
        let output_path = Utf8PathBuf::from_path_buf(dir.path().join("resolver.conf")).unwrap();
        tokio::fs::write(&template_path, TEMPLATE).await.unwrap();

        let config = RendererConfig {
            template_path,
            output_path,
            zones_path: Utf8PathBuf::from_path_buf(dir.path().join("zones")).unwrap(),
            base_domain: "internal".to_owned(),
        };
        let restart = RestartCoordinator::new(Vec::new(), Duration::from_secs(1));
        let renderer = Renderer::load(config, restart).await;
        (dir, renderer)
    }

    #[tokio::test]
    async fn add_domain_renders_and_bumps_version() {
        let (_dir, renderer) = test_renderer().await;
        let metrics = ResolverMetrics::default();
        renderer.add_domain("internal", None, &metrics).await.unwrap();
        assert_eq!(renderer.version().await, 1);
        let domains = renderer.get_all_domains().await;
        assert_eq!(domains.len(), 1);
    }

    #[tokio::test]
    async fn identical_add_domain_calls_skip_the_second_render() {
        let (_dir, renderer) = test_renderer().await;
        let metrics = ResolverMetrics::default();
        renderer.add_domain("internal", None, &metrics).await.unwrap();
        let version_after_first = renderer.version().await;
        renderer.add_domain("internal", None, &metrics).await.unwrap();
        assert_eq!(renderer.version().await, version_after_first);
    }

    #[tokio::test]
    async fn remove_domain_shrinks_the_set() {
        let (_dir, renderer) = test_renderer().await;
        let metrics = ResolverMetrics::default();
        renderer.add_domain("internal", None, &metrics).await.unwrap();
        renderer.add_domain("public", None, &metrics).await.unwrap();
        renderer.remove_domain("public", &metrics).await.unwrap();
        let domains = renderer.get_all_domains().await;
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].name, "internal");
    }

    #[tokio::test]
    async fn enable_tls_on_unknown_domain_fails() {
        let (_dir, renderer) = test_renderer().await;
        let metrics = ResolverMetrics::default();
        let err = renderer
            .enable_tls(
                "ghost",
                Utf8PathBuf::from("/tmp/cert.pem"),
                Utf8PathBuf::from("/tmp/key.pem"),
                &metrics,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ResolverError::DomainNotFound(_)));
    }

    #[tokio::test]
    async fn reloads_existing_domain_set_on_restart() {
        let (_dir, renderer) = test_renderer().await;
        let metrics = ResolverMetrics::default();
        renderer.add_domain("internal", None, &metrics).await.unwrap();

        let config = renderer.config.clone();
        let restart = RestartCoordinator::new(Vec::new(), Duration::from_secs(1));
        let reloaded = Renderer::load(config, restart).await;
        let domains = reloaded.get_all_domains().await;
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].name, "internal");
    }
}
