//! Build variables and Kilnfile placeholder substitution.
//!
//! Variables come from `--var KEY=VALUE` arguments and from `--vars` files
//! (JSON or YAML mappings). A Kilnfile refers to them as `{{ .Name }}`.

use crate::error::{KilnError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Named build variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vars(BTreeMap<String, String>);

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `other` on top of these variables. Later values win.
    pub fn merge(&mut self, other: Vars) {
        self.0.extend(other.0);
    }

    /// Parse `KEY=VALUE` assignments.
    pub fn from_assignments(args: &[String]) -> Result<Self> {
        let mut vars = Vars::new();
        for arg in args {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                KilnError::ConfigError(format!(
                    "invalid variable '{}': expected KEY=VALUE",
                    arg
                ))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(KilnError::ConfigError(format!(
                    "invalid variable '{}': empty name",
                    arg
                )));
            }
            vars.insert(key, value);
        }
        Ok(vars)
    }

    /// Load a JSON or YAML mapping from a file.
    ///
    /// Non-string scalars are kept in their textual form; nested values are
    /// stored as JSON.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KilnError::ConfigError(format!("failed to read vars file {}: {}", path.display(), e))
        })?;
        // YAML is a superset of JSON, one parser covers both
        let parsed: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&content)?;

        let mut vars = Vars::new();
        for (key, value) in parsed {
            let text = match value {
                serde_yaml::Value::Null => String::new(),
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::String(s) => s,
                other => serde_json::to_string(&other)?,
            };
            vars.insert(key, text);
        }
        Ok(vars)
    }
}

/// Replace `{{ .Name }}` placeholders with variable values.
///
/// Unknown variables and unterminated placeholders are errors, so a typo in
/// a Kilnfile never silently produces an empty string.
pub fn render(template: &str, vars: &Vars) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            KilnError::TemplateError(format!(
                "unterminated placeholder at line {}",
                line_of(template, template.len() - rest.len() + start)
            ))
        })?;

        let expr = after[..end].trim();
        let name = expr.strip_prefix('.').ok_or_else(|| {
            KilnError::TemplateError(format!("unsupported placeholder '{{{{ {} }}}}'", expr))
        })?;
        let value = vars
            .get(name)
            .ok_or_else(|| KilnError::TemplateError(format!("undefined variable '{}'", name)))?;
        out.push_str(value);

        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn line_of(s: &str, offset: usize) -> usize {
    s[..offset].matches('\n').count() + 1
}
