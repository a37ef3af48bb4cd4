//! Rendering context and validation for the resolver config template.
//!
//! The template is rendered with `tinytemplate`, the small, dependency-light
//! templating crate used by `zeronsd` for the equivalent step — not a
//! general web-templating engine, since the output here is a plain
//! resolver config file, not HTML.

use serde::Serialize;
use tinytemplate::TinyTemplate;

use super::{DomainEntry, ResolverError};

/// One domain, projected into the shape the template iterates over.
///
/// Each rendered entry carries a `# meshgated-domain: <name> tls=<bool>`
/// marker comment; this is the only way the renderer can reconstruct its
/// in-memory domain set from the file alone on startup, since the template
/// itself is operator-authored and otherwise opaque to us.
#[derive(Debug, Clone, Serialize)]
pub struct DomainCtx {
    pub name: String,
    pub has_tls: bool,
    pub cert_path: String,
    pub key_path: String,
    pub marker: String,
}

impl From<&DomainEntry> for DomainCtx {
    fn from(entry: &DomainEntry) -> Self {
        let has_tls = entry.tls.is_some();
        let (cert_path, key_path) = match &entry.tls {
            Some(tls) => (tls.cert_path.to_string(), tls.key_path.to_string()),
            None => (String::new(), String::new()),
        };
        Self {
            marker: format!("# meshgated-domain: {} tls={has_tls}", entry.name),
            name: entry.name.clone(),
            has_tls,
            cert_path,
            key_path,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RenderContext {
    pub base_domain: String,
    pub domains: Vec<DomainCtx>,
    pub zones_path: String,
    pub generated_at: String,
    pub version: u64,
}

/// Render `template_src` against `context`, then validate the result has no
/// unresolved template markers and balanced braces.
pub fn render(template_src: &str, context: &RenderContext) -> Result<String, ResolverError> {
    let mut tt = TinyTemplate::new();
    tt.add_template("resolver_config", template_src)
        .map_err(|err| ResolverError::TemplateError(err.to_string()))?;

    let rendered = tt
        .render("resolver_config", context)
        .map_err(|err| ResolverError::TemplateError(err.to_string()))?;

    validate(&rendered)?;
    Ok(rendered)
}

fn validate(rendered: &str) -> Result<(), ResolverError> {
    if rendered.contains("{{") || rendered.contains("}}") {
        return Err(ResolverError::TemplateError(
            "rendered output still contains unresolved template block markers".to_owned(),
        ));
    }

    let opens = rendered.matches('{').count();
    let closes = rendered.matches('}').count();
    if opens != closes {
        return Err(ResolverError::TemplateError(format!(
            "unbalanced braces in rendered output ({opens} open, {closes} close)"
        )));
    }

    Ok(())
}

/// Recover the domain set from a previously rendered config file by
/// scanning for this renderer's own marker comments.
pub fn recover_domains(rendered: &str) -> Vec<DomainEntry> {
    let mut domains = Vec::new();
    for line in rendered.lines() {
        let Some(rest) = line.trim().strip_prefix("# meshgated-domain: ") else {
            continue;
        };
        let Some((name, tls_part)) = rest.split_once(" tls=") else {
            continue;
        };
        let has_tls = tls_part.trim() == "true";
        // TLS paths aren't recoverable from the marker alone; a domain
        // recovered with `has_tls` set is left without TLS configured
        // until `EnableTLS` is called again.
        let _ = has_tls;
        domains.push(DomainEntry {
            name: name.to_owned(),
            tls: None,
        });
    }
    domains
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "base={ base_domain }\n{{ for d in domains }}{ d.marker }\n{{ endfor }}";

    #[test]
    fn renders_and_validates_clean_output() {
        let ctx = RenderContext {
            base_domain: "internal".to_owned(),
            domains: vec![DomainCtx {
                name: "internal".to_owned(),
                has_tls: false,
                cert_path: String::new(),
                key_path: String::new(),
                marker: "# meshgated-domain: internal tls=false".to_owned(),
            }],
            zones_path: "/var/lib/meshgated/zones".to_owned(),
            generated_at: "2026-01-01T00:00:00Z".to_owned(),
            version: 1,
        };
        let rendered = render(TEMPLATE, &ctx).unwrap();
        assert!(rendered.contains("internal"));
        assert!(!rendered.contains("{{"));
    }

    #[test]
    fn recovers_domains_from_marker_comments() {
        let rendered = "base=internal\n# meshgated-domain: internal tls=false\n# meshgated-domain: public tls=true\n";
        let recovered = recover_domains(rendered);
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].name, "internal");
        assert_eq!(recovered[1].name, "public");
    }
}
