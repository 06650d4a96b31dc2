//! Configuration store: registered templates and their adaptation

use crate::config::{
    placeholders, prefix_identifiers, AppConfigFile, AppConfigFileError, ConfigValue,
    ParameterDefinition, SubstitutionContext, SubstitutionError,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// A parsed configuration tree
pub type ConfigTree = serde_yaml::Value;

/// Placeholder → value map applied to a template
pub type FieldAdaptor = HashMap<String, ConfigValue>;

/// Placeholder bound to the generated instance identifier
pub const GENERIC_UID: &str = "GENERIC_UID";

/// Process-wide counter behind generated identifiers
static NEXT_IDENTIFIER: AtomicU64 = AtomicU64::new(1);

/// Generate a fresh identifier `<base>_<n>`, unique for the process lifetime
pub fn unique_identifier(base: &str) -> String {
    let n = NEXT_IDENTIFIER.fetch_add(1, Ordering::Relaxed);
    let base = if base.is_empty() { "sight" } else { base };
    format!("{}_{}", base, n)
}

/// An immutable registered configuration template
#[derive(Debug, Clone, PartialEq)]
pub struct AppTemplate {
    pub id: String,
    pub group: String,
    pub description: String,
    pub parameters: Vec<ParameterDefinition>,
    pub tree: ConfigTree,
    pub module: Option<String>,
}

/// A template after field adaptation
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptedConfig {
    /// Template the tree was produced from
    pub config_id: String,
    /// Generated identifier used to prefix uids, when auto-prefixing
    pub instance_id: Option<String>,
    /// The adapted tree
    pub tree: ConfigTree,
}

impl AdaptedConfig {
    /// Identifier a uid declared in the template resolves to in this adaptation
    pub fn resolve_uid(&self, uid: &str) -> String {
        match &self.instance_id {
            Some(prefix) => format!("{}_{}", prefix, uid),
            None => uid.to_string(),
        }
    }
}

/// Thread-safe store of configuration templates
#[derive(Debug, Default)]
pub struct ConfigStore {
    templates: RwLock<HashMap<String, Arc<AppTemplate>>>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template
    pub fn add_template(
        &self,
        id: impl Into<String>,
        group: impl Into<String>,
        description: impl Into<String>,
        parameters: Vec<ParameterDefinition>,
        tree: ConfigTree,
        module: Option<String>,
    ) -> Result<(), ConfigError> {
        self.add(AppTemplate {
            id: id.into(),
            group: group.into(),
            description: description.into(),
            parameters,
            tree,
            module,
        })
    }

    /// Register an already built template
    pub fn add(&self, template: AppTemplate) -> Result<(), ConfigError> {
        let mut templates = self
            .templates
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if templates.contains_key(&template.id) {
            return Err(ConfigError::DuplicateConfig(template.id));
        }

        log::debug!("Registered configuration '{}'", template.id);
        templates.insert(template.id.clone(), Arc::new(template));
        Ok(())
    }

    /// Register every template of a configuration file
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Vec<String>, ConfigError> {
        let file = AppConfigFile::from_file(path)?;
        self.load(file)
    }

    /// Register every template of a YAML document
    pub fn load_yaml(&self, content: &str) -> Result<Vec<String>, ConfigError> {
        let file = AppConfigFile::from_yaml(content)?;
        self.load(file)
    }

    /// Register every template of a parsed file, returning their ids in file order
    pub fn load(&self, file: AppConfigFile) -> Result<Vec<String>, ConfigError> {
        let mut ids = Vec::with_capacity(file.configs.len());
        for (id, def) in file.configs {
            self.add_template(
                id.clone(),
                def.group,
                def.description,
                def.parameters,
                ConfigTree::Mapping(def.tree),
                def.module,
            )?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Look up a registered template
    pub fn template(&self, id: &str) -> Result<Arc<AppTemplate>, ConfigError> {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownConfig(id.to_string()))
    }

    /// Produce the adapted tree of a template.
    ///
    /// Without `auto_prefix` this is a pure function of its arguments. With it,
    /// every literal uid is rewritten with a freshly generated identifier and
    /// `${GENERIC_UID}` resolves to that identifier.
    pub fn get_adapted_config(
        &self,
        id: &str,
        fields: &FieldAdaptor,
        auto_prefix: bool,
    ) -> Result<AdaptedConfig, ConfigError> {
        let template = self.template(id)?;

        let mut ctx = SubstitutionContext::new();
        for param in &template.parameters {
            let value = fields
                .get(&param.name)
                .or(param.default.as_ref())
                .cloned()
                .ok_or_else(|| ConfigError::MissingParameter {
                    config: id.to_string(),
                    name: param.name.clone(),
                })?;
            ctx = ctx.with_field(param.name.clone(), value);
        }
        for (name, value) in fields {
            if !ctx.contains(name) {
                ctx = ctx.with_field(name.clone(), value.clone());
            }
        }

        let (instance_id, tree) = if auto_prefix {
            let instance_id = unique_identifier(id);
            if !ctx.contains(GENERIC_UID) {
                ctx = ctx.with_field(GENERIC_UID, instance_id.clone());
            }
            let tree = prefix_identifiers(&template.tree, &instance_id);
            (Some(instance_id), tree)
        } else {
            (None, template.tree.clone())
        };

        let tree = ctx.substitute_tree(&tree).map_err(|e| match e {
            SubstitutionError::Unresolved(name) => ConfigError::MissingParameter {
                config: id.to_string(),
                name,
            },
        })?;

        Ok(AdaptedConfig {
            config_id: id.to_string(),
            instance_id,
            tree,
        })
    }

    /// Placeholders a template references without a declared default
    pub fn required_fields(&self, id: &str) -> Result<Vec<String>, ConfigError> {
        let template = self.template(id)?;
        Ok(placeholders(&template.tree)
            .into_iter()
            .filter(|name| {
                name != GENERIC_UID
                    && !template
                        .parameters
                        .iter()
                        .any(|p| &p.name == name && !p.is_mandatory())
            })
            .collect())
    }

    /// Ids of all registered configurations
    pub fn get_all_configs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Ids of the configurations tagged with `group`
    pub fn get_configs_by_group(&self, group: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|t| t.group == group)
            .map(|t| t.id.clone())
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Module providing a configuration
    pub fn module(&self, id: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.template(id)?.module.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.templates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every template
    pub fn clear(&self) {
        self.templates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Errors raised by the configuration store
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration '{0}' is already registered")]
    DuplicateConfig(String),

    #[error("Unknown configuration: {0}")]
    UnknownConfig(String),

    #[error("Configuration '{config}': no value for parameter '{name}'")]
    MissingParameter { config: String, name: String },

    #[error(transparent)]
    File(#[from] AppConfigFileError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_yaml::Value;

    fn tree(s: &str) -> ConfigTree {
        serde_yaml::from_str(s).unwrap()
    }

    fn store_with_template() -> ConfigStore {
        let store = ConfigStore::new();
        store
            .add_template(
                "viewer",
                "viewers",
                "Shows an image",
                vec![
                    ParameterDefinition::required("IMAGE"),
                    ParameterDefinition::with_default("STEP", 2i64),
                ],
                tree(
                    r#"
objects:
  - uid: "${IMAGE}"
    type: sight::data::integer
services:
  - uid: counter
    type: sight::service::counter
    config:
      step: "${STEP}"
start: [counter]
"#,
                ),
                Some("sight::module::viewer".into()),
            )
            .unwrap();
        store
    }

    #[test]
    fn test_add_and_enumerate() {
        let store = store_with_template();
        assert_eq!(store.get_all_configs(), vec!["viewer".to_string()]);
        assert_eq!(store.get_configs_by_group("viewers"), vec!["viewer".to_string()]);
        assert!(store.get_configs_by_group("other").is_empty());
        assert_eq!(
            store.module("viewer").unwrap().as_deref(),
            Some("sight::module::viewer")
        );
    }

    #[test]
    fn test_duplicate_config_rejected() {
        let store = store_with_template();
        let result = store.add_template("viewer", "", "", vec![], Value::Null, None);
        assert!(matches!(result, Err(ConfigError::DuplicateConfig(id)) if id == "viewer"));
    }

    #[test]
    fn test_adaptation_is_pure() {
        let store = store_with_template();
        let original = store.template("viewer").unwrap();

        let mut fields = FieldAdaptor::new();
        fields.insert("IMAGE".into(), "external".into());

        let first = store.get_adapted_config("viewer", &fields, false).unwrap();
        let second = store.get_adapted_config("viewer", &fields, false).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.tree["objects"][0]["uid"], Value::String("external".into()));
        assert_eq!(first.tree["services"][0]["config"]["step"], Value::from(2));
        assert_eq!(*store.template("viewer").unwrap(), *original);
    }

    #[test]
    fn test_missing_mandatory_parameter() {
        let store = store_with_template();
        let result = store.get_adapted_config("viewer", &FieldAdaptor::new(), false);
        assert!(matches!(
            result,
            Err(ConfigError::MissingParameter { name, .. }) if name == "IMAGE"
        ));
    }

    #[test]
    fn test_undeclared_placeholder_is_an_error() {
        let store = ConfigStore::new();
        store
            .add_template("loose", "", "", vec![], tree("a: \"${NOPE}\""), None)
            .unwrap();
        let result = store.get_adapted_config("loose", &FieldAdaptor::new(), false);
        assert!(matches!(result, Err(ConfigError::MissingParameter { .. })));
    }

    #[test]
    fn test_unknown_config() {
        let store = ConfigStore::new();
        let result = store.get_adapted_config("ghost", &FieldAdaptor::new(), false);
        assert!(matches!(result, Err(ConfigError::UnknownConfig(id)) if id == "ghost"));
    }

    #[test]
    fn test_auto_prefix_generates_distinct_ids() {
        let store = store_with_template();
        let mut fields = FieldAdaptor::new();
        fields.insert("IMAGE".into(), "external".into());

        let a = store.get_adapted_config("viewer", &fields, true).unwrap();
        let b = store.get_adapted_config("viewer", &fields, true).unwrap();
        assert_ne!(a.instance_id, b.instance_id);

        let a_uid = a.tree["services"][0]["uid"].as_str().unwrap().to_string();
        assert_eq!(a_uid, a.resolve_uid("counter"));
        assert!(a_uid.starts_with("viewer_"));
        assert_ne!(a.tree["services"][0]["uid"], b.tree["services"][0]["uid"]);
        // External objects keep their id
        assert_eq!(a.tree["objects"][0]["uid"], Value::String("external".into()));
    }

    #[test]
    fn test_generic_uid_resolves_to_instance() {
        let store = ConfigStore::new();
        store
            .add_template("gen", "", "", vec![], tree("name: \"${GENERIC_UID}_view\""), None)
            .unwrap();
        let adapted = store
            .get_adapted_config("gen", &FieldAdaptor::new(), true)
            .unwrap();
        let expected = format!("{}_view", adapted.instance_id.unwrap());
        assert_eq!(adapted.tree["name"], Value::String(expected));
    }

    #[test]
    fn test_required_fields() {
        let store = store_with_template();
        assert_eq!(store.required_fields("viewer").unwrap(), vec!["IMAGE".to_string()]);
    }

    #[test]
    fn test_load_yaml_and_clear() {
        let store = ConfigStore::new();
        let ids = store
            .load_yaml("configs:\n  a: {}\n  b:\n    group: g\n")
            .unwrap();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.len(), 2);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn test_unique_identifier_is_monotonic() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| unique_identifier("cfg")))
            .collect();
        let mut ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 8);
    }
}
