//! Application configuration file YAML schema definitions

use crate::config::ConfigValue;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root application configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfigFile {
    /// File format version
    #[serde(default = "default_version")]
    pub version: String,

    /// Configuration templates keyed by configuration id (ordered for deterministic loading)
    pub configs: IndexMap<String, TemplateDefinition>,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// A configuration template as written in the file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDefinition {
    /// Group tag used to enumerate related configurations
    #[serde(default)]
    pub group: String,

    /// Optional description
    #[serde(default)]
    pub description: String,

    /// Declared template parameters
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,

    /// Module providing the configuration resources
    #[serde(default)]
    pub module: Option<String>,

    /// The configuration tree itself: objects, services, connections, start, update
    #[serde(flatten)]
    pub tree: serde_yaml::Mapping,
}

/// Template parameter declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    /// Placeholder name, referenced as `${name}`
    pub name: String,

    /// Default value; a parameter without default is mandatory
    #[serde(default)]
    pub default: Option<ConfigValue>,
}

impl ParameterDefinition {
    /// Mandatory parameter
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    /// Optional parameter with a default value
    pub fn with_default(name: impl Into<String>, default: impl Into<ConfigValue>) -> Self {
        Self {
            name: name.into(),
            default: Some(default.into()),
        }
    }

    pub fn is_mandatory(&self) -> bool {
        self.default.is_none()
    }
}

impl AppConfigFile {
    /// Load a configuration file from disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| AppConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_yaml(&content)
    }

    /// Parse a configuration file from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, AppConfigFileError> {
        let file: AppConfigFile = serde_yaml::from_str(content)?;
        file.validate()?;
        Ok(file)
    }

    /// Validate the declarations that do not depend on parameter values
    pub fn validate(&self) -> Result<(), AppConfigFileError> {
        for (id, template) in &self.configs {
            let mut seen = Vec::new();
            for param in &template.parameters {
                if param.name.is_empty() {
                    return Err(AppConfigFileError::Validation(format!(
                        "Config '{}': parameter with empty name",
                        id
                    )));
                }
                if seen.contains(&param.name) {
                    return Err(AppConfigFileError::Validation(format!(
                        "Config '{}': parameter '{}' declared twice",
                        id, param.name
                    )));
                }
                seen.push(param.name.clone());
            }
        }

        Ok(())
    }

    /// Get all unique group names
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .configs
            .values()
            .filter(|c| !c.group.is_empty())
            .map(|c| c.group.clone())
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }
}

/// Errors that can occur when loading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum AppConfigFileError {
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
