//! Template expansion for message content
//!
//! Subject and bodies are Handlebars templates expanded against the
//! message's variable map. Compiled templates are cached by their raw text,
//! so the same template shared by many messages compiles once.

use std::collections::{HashMap, VecDeque};

use courier_common::Variables;
use handlebars::Handlebars;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{error, trace};

use crate::error::{RenderError, RenderField};

pub const DEFAULT_CACHE_SIZE: usize = 1000;

/// Unexpanded message content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderInput<'a> {
    pub subject: &'a str,
    pub html_body: &'a str,
    pub text_body: Option<&'a str>,
}

/// Expanded message content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RendererConfig {
    /// Compiled templates kept before the oldest is evicted
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

const fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

/// Compiled templates keyed by raw text, evicted oldest-inserted first
///
/// Lookups do not refresh an entry's position: this is FIFO, not LRU.
struct TemplateCache {
    registry: Handlebars<'static>,
    /// raw template text -> registered name
    names: HashMap<String, String>,
    /// raw template text in insertion order
    order: VecDeque<String>,
    next_name: u64,
    capacity: usize,
}

impl std::fmt::Debug for TemplateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateCache")
            .field("cached", &self.names.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl TemplateCache {
    fn new(capacity: usize) -> Self {
        Self {
            registry: Handlebars::new(),
            names: HashMap::new(),
            order: VecDeque::new(),
            next_name: 0,
            capacity: capacity.max(1),
        }
    }

    /// Registered name for `template`, compiling it on first sight
    fn compiled(&mut self, template: &str) -> Result<String, String> {
        if let Some(name) = self.names.get(template) {
            return Ok(name.clone());
        }

        self.next_name += 1;
        let name = format!("template-{}", self.next_name);
        self.registry
            .register_template_string(&name, template)
            .map_err(|e| e.to_string())?;

        while self.order.len() >= self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.names.remove(&oldest) {
                self.registry.unregister_template(&evicted);
                trace!(template = %evicted, "Evicted compiled template");
            }
        }

        self.names.insert(template.to_string(), name.clone());
        self.order.push_back(template.to_string());
        Ok(name)
    }

    fn render(
        &mut self,
        template: &str,
        data: &serde_json::Value,
        field: RenderField,
    ) -> Result<String, RenderError> {
        self.compiled(template)
            .and_then(|name| {
                self.registry
                    .render(&name, data)
                    .map_err(|e| e.to_string())
            })
            .map_err(|message| {
                error!(%field, error = %message, "Rendering failed");
                RenderError { field, message }
            })
    }
}

/// Expands message content against its variables
#[derive(Debug)]
pub struct TemplateRenderer {
    cache: Mutex<TemplateCache>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new(&RendererConfig::default())
    }
}

impl TemplateRenderer {
    #[must_use]
    pub fn new(config: &RendererConfig) -> Self {
        Self {
            cache: Mutex::new(TemplateCache::new(config.cache_size)),
        }
    }

    /// Number of compiled templates currently cached
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.lock().names.len()
    }

    /// Whether the compiled form of `template` is cached
    #[must_use]
    pub fn is_cached(&self, template: &str) -> bool {
        self.cache.lock().names.contains_key(template)
    }

    /// Expand subject, HTML body and optional text body.
    ///
    /// Without variables (absent or empty) the content is returned
    /// unchanged and nothing is compiled.
    ///
    /// # Errors
    /// The first field whose template is malformed or fails to expand.
    pub fn render(
        &self,
        input: RenderInput<'_>,
        variables: Option<&Variables>,
    ) -> Result<Rendered, RenderError> {
        let Some(variables) = variables.filter(|v| !v.is_empty()) else {
            return Ok(Rendered {
                subject: input.subject.to_string(),
                html: input.html_body.to_string(),
                text: input.text_body.map(str::to_string),
            });
        };

        let data = serde_json::Value::Object(variables.clone());
        let mut cache = self.cache.lock();

        let subject = cache.render(input.subject, &data, RenderField::Subject)?;
        let html = cache.render(input.html_body, &data, RenderField::HtmlBody)?;
        let text = input
            .text_body
            .map(|text| cache.render(text, &data, RenderField::TextBody))
            .transpose()?;

        Ok(Rendered {
            subject,
            html,
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn variables(value: serde_json::Value) -> Variables {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Variables::new(),
        }
    }

    #[test]
    fn test_passthrough_without_variables() {
        let renderer = TemplateRenderer::default();
        let input = RenderInput {
            subject: "Hi {{name}}",
            html_body: "<p>{{#if x}}</p>",
            text_body: Some("plain {{name}}"),
        };

        let expected = Rendered {
            subject: "Hi {{name}}".to_string(),
            html: "<p>{{#if x}}</p>".to_string(),
            text: Some("plain {{name}}".to_string()),
        };
        assert_eq!(renderer.render(input, None).expect("render"), expected);
        assert_eq!(
            renderer.render(input, Some(&Variables::new())).expect("render"),
            expected
        );
        assert_eq!(renderer.cached(), 0);
    }

    #[test]
    fn test_expands_every_field() {
        let renderer = TemplateRenderer::default();
        let vars = variables(json!({ "name": "Ada", "order": { "id": 42 } }));

        let rendered = renderer
            .render(
                RenderInput {
                    subject: "Order {{order.id}}",
                    html_body: "<p>Thanks {{name}}</p>",
                    text_body: Some("Thanks {{name}}"),
                },
                Some(&vars),
            )
            .expect("render");

        assert_eq!(rendered.subject, "Order 42");
        assert_eq!(rendered.html, "<p>Thanks Ada</p>");
        assert_eq!(rendered.text.as_deref(), Some("Thanks Ada"));
    }

    #[test]
    fn test_missing_variables_render_empty() {
        let renderer = TemplateRenderer::default();
        let vars = variables(json!({ "unused": true }));
        let rendered = renderer
            .render(
                RenderInput {
                    subject: "Hi {{name}}!",
                    html_body: "x",
                    text_body: None,
                },
                Some(&vars),
            )
            .expect("render");
        assert_eq!(rendered.subject, "Hi !");
        assert_eq!(rendered.text, None);
    }

    #[test]
    fn test_malformed_template_names_field() {
        let renderer = TemplateRenderer::default();
        let vars = variables(json!({ "name": "Ada" }));

        let err = renderer
            .render(
                RenderInput {
                    subject: "fine {{name}}",
                    html_body: "<p>{{#if name}}unclosed</p>",
                    text_body: None,
                },
                Some(&vars),
            )
            .expect_err("malformed html body");
        assert_eq!(err.field, RenderField::HtmlBody);
        assert!(err.to_string().starts_with("Failed to render htmlBody: "));
    }

    #[test]
    fn test_cache_is_fifo() {
        let renderer = TemplateRenderer::new(&RendererConfig { cache_size: 2 });
        let vars = variables(json!({ "n": 1 }));
        let render = |subject: &str| {
            renderer
                .render(
                    RenderInput {
                        subject,
                        html_body: subject,
                        text_body: None,
                    },
                    Some(&vars),
                )
                .expect("render")
        };

        render("a {{n}}");
        render("b {{n}}");
        // Reuse does not refresh insertion order
        render("a {{n}}");
        render("c {{n}}");

        assert_eq!(renderer.cached(), 2);
        assert!(!renderer.is_cached("a {{n}}"));
        assert!(renderer.is_cached("b {{n}}"));
        assert!(renderer.is_cached("c {{n}}"));
        assert_eq!(render("a {{n}}").subject, "a 1");
    }
}
