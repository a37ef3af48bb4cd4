//! Rendering the reverse-proxy's config file from the in-memory rule table.

use serde::Serialize;

use super::{ProxyError, ProxyRule, Scheme};

#[derive(Debug, Clone, Serialize)]
pub struct RuleCtx {
    pub hostname: String,
    pub target_ip: String,
    pub target_port: u16,
    pub scheme: String,
}

impl From<&ProxyRule> for RuleCtx {
    fn from(rule: &ProxyRule) -> Self {
        Self {
            hostname: rule.hostname_fqdn.clone(),
            target_ip: rule.target_address.to_string(),
            target_port: rule.target_port,
            scheme: match rule.scheme {
                Scheme::Http => "http".to_owned(),
                Scheme::Https => "https".to_owned(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderContext {
    pub rules: Vec<RuleCtx>,
}

pub fn render(template_src: &str, rules: &[ProxyRule]) -> Result<String, ProxyError> {
    let mut tt = tinytemplate::TinyTemplate::new();
    tt.add_template("proxy_config", template_src)
        .map_err(|err| ProxyError::TemplateError(err.to_string()))?;

    let context = RenderContext {
        rules: rules.iter().map(RuleCtx::from).collect(),
    };

    tt.render("proxy_config", &context)
        .map_err(|err| ProxyError::TemplateError(err.to_string()))
}
