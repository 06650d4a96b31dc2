//! Substitution engine for `${NAME}` placeholders and identifier prefixing

use crate::config::ConfigValue;
use regex::{Captures, Regex};
use serde_yaml::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Regex for matching placeholders: ${NAME}
static PLACEHOLDER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Regex for a cell that is exactly one placeholder
static WHOLE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\$\{([A-Za-z_][A-Za-z0-9_]*)\}$").unwrap());

/// Keys whose string value is an identifier
const ID_KEYS: &[&str] = &["uid", "channel"];

/// Keys whose sequence values are identifiers
const ID_LIST_KEYS: &[&str] = &["start", "update", "group"];

/// Keys whose sequence values are `uid/key` endpoint references
const ENDPOINT_LIST_KEYS: &[&str] = &["signals", "slots"];

/// Keys holding opaque service configuration, never rewritten
const OPAQUE_KEYS: &[&str] = &["config"];

/// Substitution context containing all available fields
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    /// Field adaptor values, keyed by placeholder name
    pub fields: HashMap<String, ConfigValue>,
}

impl SubstitutionContext {
    /// Create a new substitution context
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Add multiple fields
    pub fn with_fields(mut self, fields: HashMap<String, ConfigValue>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Check whether a field is defined
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Substitute all placeholders in a string, concatenating values as text
    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut error: Option<SubstitutionError> = None;

        let result = PLACEHOLDER_PATTERN.replace_all(input, |caps: &Captures| {
            if error.is_some() {
                return String::new();
            }

            match self.resolve(&caps[1]) {
                Ok(value) => value.as_string(),
                Err(e) => {
                    error = Some(e);
                    String::new()
                }
            }
        });

        if let Some(e) = error {
            return Err(e);
        }

        Ok(result.into_owned())
    }

    /// Substitute a single cell. A cell holding exactly one placeholder takes the
    /// field value verbatim (keeping its type); otherwise text is concatenated.
    pub fn substitute_cell(&self, input: &str) -> Result<Value, SubstitutionError> {
        if let Some(caps) = WHOLE_PLACEHOLDER.captures(input) {
            return self.resolve(&caps[1]).map(|v| v.to_yaml());
        }

        if !input.contains("${") {
            return Ok(Value::String(input.to_string()));
        }

        self.substitute(input).map(Value::String)
    }

    /// Substitute every cell of a tree, depth-first. The input is left untouched.
    pub fn substitute_tree(&self, tree: &Value) -> Result<Value, SubstitutionError> {
        match tree {
            Value::String(s) => self.substitute_cell(s),
            Value::Sequence(items) => items
                .iter()
                .map(|item| self.substitute_tree(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Sequence),
            Value::Mapping(map) => {
                let mut out = serde_yaml::Mapping::with_capacity(map.len());
                for (key, value) in map {
                    out.insert(key.clone(), self.substitute_tree(value)?);
                }
                Ok(Value::Mapping(out))
            }
            Value::Tagged(tagged) => {
                let mut tagged = tagged.as_ref().clone();
                tagged.value = self.substitute_tree(&tagged.value)?;
                Ok(Value::Tagged(Box::new(tagged)))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolve a field reference
    fn resolve(&self, name: &str) -> Result<&ConfigValue, SubstitutionError> {
        self.fields
            .get(name)
            .ok_or_else(|| SubstitutionError::Unresolved(name.to_string()))
    }
}

/// Names of all placeholders referenced by a tree, in traversal order
pub fn placeholders(tree: &Value) -> Vec<String> {
    fn collect(tree: &Value, out: &mut Vec<String>) {
        match tree {
            Value::String(s) => {
                for caps in PLACEHOLDER_PATTERN.captures_iter(s) {
                    let name = caps[1].to_string();
                    if !out.contains(&name) {
                        out.push(name);
                    }
                }
            }
            Value::Sequence(items) => items.iter().for_each(|item| collect(item, out)),
            Value::Mapping(map) => map.values().for_each(|value| collect(value, out)),
            Value::Tagged(tagged) => collect(&tagged.value, out),
            _ => {}
        }
    }

    let mut out = Vec::new();
    collect(tree, &mut out);
    out
}

/// Rewrite every literal identifier of a configuration tree as `<prefix>_<uid>`.
///
/// An identifier that is exactly one placeholder references an object living
/// outside the configuration and is left as it is. Identifiers merely
/// containing a placeholder are still local and get the prefix.
pub fn prefix_identifiers(tree: &Value, prefix: &str) -> Value {
    match tree {
        Value::Sequence(items) => Value::Sequence(
            items
                .iter()
                .map(|item| prefix_identifiers(item, prefix))
                .collect(),
        ),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::with_capacity(map.len());
            for (key, value) in map {
                let rewritten = match key.as_str() {
                    Some(k) if OPAQUE_KEYS.contains(&k) => value.clone(),
                    Some(k) if ID_KEYS.contains(&k) => prefix_cell(value, prefix, prefix_id),
                    Some(k) if ID_LIST_KEYS.contains(&k) => prefix_cell(value, prefix, prefix_id),
                    Some(k) if ENDPOINT_LIST_KEYS.contains(&k) => {
                        prefix_cell(value, prefix, prefix_endpoint)
                    }
                    _ => prefix_identifiers(value, prefix),
                };
                out.insert(key.clone(), rewritten);
            }
            Value::Mapping(out)
        }
        other => other.clone(),
    }
}

/// Apply `rewrite` to a string cell or to every string of a sequence cell
fn prefix_cell(value: &Value, prefix: &str, rewrite: fn(&str, &str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(rewrite(s, prefix)),
        Value::Sequence(items) => Value::Sequence(
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Value::String(rewrite(s, prefix)),
                    other => other.clone(),
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn prefix_id(uid: &str, prefix: &str) -> String {
    if WHOLE_PLACEHOLDER.is_match(uid) {
        uid.to_string()
    } else {
        format!("{}_{}", prefix, uid)
    }
}

fn prefix_endpoint(endpoint: &str, prefix: &str) -> String {
    match endpoint.split_once('/') {
        Some((uid, key)) => format!("{}/{}", prefix_id(uid, prefix), key),
        None => endpoint.to_string(),
    }
}

/// Errors that can occur during substitution
#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("Unresolved placeholder: ${{{0}}}")]
    Unresolved(String),
}
