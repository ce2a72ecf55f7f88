//! Structured extraction run over the final page content.
//!
//! Extraction never fails a fetch: the engine stores `{}` when a hook errors.

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("invalid selector for field {field}: {message}")]
    Selector { field: String, message: String },
    #[error("extraction failed: {0}")]
    Other(String),
}

/// Called once per invocation with the final content.
pub trait ExtractionHook: Send + Sync {
    fn extract(&self, html: &str, url: &str) -> Result<Value, ExtractionError>;
}

impl<F> ExtractionHook for F
where
    F: Fn(&str, &str) -> Result<Value, ExtractionError> + Send + Sync,
{
    fn extract(&self, html: &str, url: &str) -> Result<Value, ExtractionError> {
        self(html, url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorKind {
    #[default]
    Css,
    Xpath,
}

fn default_attr() -> String {
    "text".into()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionField {
    pub name: String,
    pub selector: String,
    #[serde(default, rename = "type")]
    pub kind: SelectorKind,
    /// `text` for the text content, otherwise an attribute name.
    #[serde(default = "default_attr")]
    pub attr: String,
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionSchema {
    #[serde(default)]
    pub fields: Vec<ExtractionField>,
}

/// Evaluates an [`ExtractionSchema`] with CSS selectors.
#[derive(Debug, Clone)]
pub struct SchemaExtractor {
    schema: ExtractionSchema,
}

impl SchemaExtractor {
    pub fn new(schema: ExtractionSchema) -> Self {
        Self { schema }
    }

    pub fn from_json(value: &Value) -> Result<Self, ExtractionError> {
        let schema = serde_json::from_value(value.clone())
            .map_err(|err| ExtractionError::Other(format!("invalid schema: {err}")))?;
        Ok(Self::new(schema))
    }
}

impl ExtractionHook for SchemaExtractor {
    fn extract(&self, html: &str, _url: &str) -> Result<Value, ExtractionError> {
        let document = Html::parse_document(html);
        let mut data = Map::new();

        for field in &self.schema.fields {
            if field.name.is_empty() || field.selector.is_empty() {
                continue;
            }
            if field.kind == SelectorKind::Xpath {
                log::warn!("xpath selector for field {} is not supported; skipped", field.name);
                continue;
            }

            let (css, attr) = split_pseudo(&field.selector, &field.attr);
            let selector = Selector::parse(css).map_err(|err| ExtractionError::Selector {
                field: field.name.clone(),
                message: err.to_string(),
            })?;

            let mut nodes = document.select(&selector);
            let value = if field.all {
                Value::Array(
                    nodes
                        .map(|node| Value::String(node_value(node, &attr)))
                        .collect(),
                )
            } else {
                Value::String(nodes.next().map(|node| node_value(node, &attr)).unwrap_or_default())
            };
            data.insert(field.name.clone(), value);
        }

        Ok(Value::Object(data))
    }
}

/// Accepts `::text` and `::attr(name)` suffixes on CSS selectors.
fn split_pseudo<'a>(selector: &'a str, attr: &str) -> (&'a str, String) {
    if let Some(css) = selector.strip_suffix("::text") {
        return (css.trim(), "text".into());
    }
    if let Some((css, rest)) = selector.rsplit_once("::attr(") {
        if let Some(name) = rest.strip_suffix(')') {
            return (css.trim(), name.trim().to_string());
        }
    }
    (selector, attr.to_string())
}

fn node_value(node: ElementRef<'_>, attr: &str) -> String {
    if attr == "text" {
        node.text().collect::<String>().trim().to_string()
    } else {
        node.value().attr(attr).unwrap_or_default().trim().to_string()
    }
}
