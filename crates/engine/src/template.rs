//! Message templates: `{{placeholder}}` substitution over bound event values.
//!
//! Placeholders may carry surrounding whitespace and a leading dot
//! (`{{ .stock_name }}`). Values missing from the candidate render as the
//! empty string. An unterminated `{{` is left in the output verbatim.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use herald_common::types::{BoundVariables, CandidateNotification, RenderedMessage, Template};

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template '{0}' not found")]
    NotFound(String),

    #[error("invalid template: {0}")]
    Invalid(String),

    #[error("failed to read template file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("malformed template definitions: {0}")]
    Json(#[from] serde_json::Error),
}

/// Registry of templates keyed by id. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct TemplateStore {
    templates: Arc<RwLock<HashMap<String, Template>>>,
}

impl TemplateStore {
    pub fn new(templates: Vec<Template>) -> Self {
        let map = templates.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            templates: Arc::new(RwLock::new(map)),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(default_templates())
    }

    /// Load templates from a JSON array on disk.
    pub fn from_file(path: &str) -> Result<Self, TemplateError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.to_string(),
            source,
        })?;
        let templates: Vec<Template> = serde_json::from_str(&raw)?;
        Ok(Self::new(templates))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates.read().contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Template> {
        self.templates.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<Template> {
        let mut templates: Vec<_> = self.templates.read().values().cloned().collect();
        templates.sort_by(|a, b| a.id.cmp(&b.id));
        templates
    }

    /// Insert or replace a template. Returns true if it replaced an existing one.
    pub fn upsert(&self, template: Template) -> Result<bool, TemplateError> {
        if template.id.trim().is_empty() {
            return Err(TemplateError::Invalid("template id must not be empty".into()));
        }
        if template.title_pattern.is_empty() && template.body_pattern.is_empty() {
            return Err(TemplateError::Invalid(format!(
                "template '{}' has neither title nor body",
                template.id
            )));
        }

        let id = template.id.clone();
        let replaced = self.templates.write().insert(id.clone(), template).is_some();
        tracing::info!(template_id = %id, replaced, "Template stored");
        Ok(replaced)
    }

    /// Render the candidate's template with its bound variables.
    pub fn render(&self, candidate: &CandidateNotification) -> Result<RenderedMessage, TemplateError> {
        let template = self
            .get(&candidate.template_id)
            .ok_or_else(|| TemplateError::NotFound(candidate.template_id.clone()))?;

        let vars = &candidate.bound_variables;
        Ok(RenderedMessage {
            message_id: candidate.id,
            title: render_pattern(&template.title_pattern, vars),
            body: render_pattern(&template.body_pattern, vars),
            priority: candidate.priority,
            category: candidate.primary_category().map(str::to_string),
            data: serde_json::Value::Object(vars.values.clone()),
        })
    }
}

/// Substitute every `{{name}}` in `pattern`.
pub fn render_pattern(pattern: &str, vars: &BoundVariables) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];

        let Some(close) = after_open.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };

        let raw = &after_open[..close];
        let name = raw.trim().trim_start_matches('.');
        if is_placeholder_name(name) {
            out.push_str(&vars.render(name));
        } else {
            out.push_str("{{");
            out.push_str(raw);
            out.push_str("}}");
        }
        rest = &after_open[close + 2..];
    }

    out.push_str(rest);
    out
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Built-in templates used when no template file is configured.
pub fn default_templates() -> Vec<Template> {
    let template = |id: &str, title: &str, body: &str, variables: &[&str]| Template {
        id: id.to_string(),
        title_pattern: title.to_string(),
        body_pattern: body.to_string(),
        variables: variables.iter().map(|v| v.to_string()).collect(),
    };

    vec![
        template(
            "news_breakout",
            "Breaking: {{stock_name}}",
            "{{title}}\n\n{{summary}}",
            &["stock_name", "title", "summary"],
        ),
        template(
            "price_alert",
            "{{stock_name}} price alert",
            "Current price: {{current_price}}\nChange: {{change_pct}}%",
            &["stock_name", "current_price", "change_pct"],
        ),
        template(
            "technical_signal",
            "{{stock_name}} technical signal",
            "{{signal_name}}\nPrice: {{price}}\nRecommendation: {{recommendation}}",
            &["stock_name", "signal_name", "price", "recommendation"],
        ),
        template(
            "portfolio_update",
            "Portfolio update",
            "{{portfolio_name}}\nTotal return: {{total_return}}%",
            &["portfolio_name", "total_return"],
        ),
        template(
            "market_analysis",
            "Daily market analysis",
            "Advancers: {{up_count}}\nDecliners: {{down_count}}\nUnchanged: {{flat_count}}",
            &["up_count", "down_count", "flat_count"],
        ),
        template(
            "system_message",
            "{{title}}",
            "{{body}}",
            &["title", "body"],
        ),
    ]
}
