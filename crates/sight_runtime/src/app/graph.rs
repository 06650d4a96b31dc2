//! Typed view of an adapted configuration tree: the graph of objects,
//! services and connections an application instance builds

use crate::config::{AdaptedConfig, ConfigTree, ConfigValue};
use crate::service::{Access, Binding};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Objects, services, connections and start/update lists of one configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppGraph {
    #[serde(default)]
    pub objects: Vec<ObjectDecl>,

    #[serde(default)]
    pub services: Vec<ServiceDecl>,

    #[serde(default)]
    pub connections: Vec<ConnectionDecl>,

    /// Services started, in order, once the graph is built
    #[serde(default)]
    pub start: Vec<String>,

    /// Services updated, in order, after the start list
    #[serde(default)]
    pub update: Vec<String>,
}

/// Where an object comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectSource {
    /// Created by the configuration and released with it
    #[default]
    New,
    /// Already registered by someone else
    Ref,
    /// Published later, usually as a service output; services requiring it
    /// exist only while it is registered
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObjectDecl {
    pub uid: String,

    /// Object type; required for created objects
    #[serde(rename = "type", default)]
    pub type_name: Option<String>,

    #[serde(default)]
    pub src: ObjectSource,

    /// Initial value of a created object
    #[serde(default)]
    pub value: Option<ConfigValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceDecl {
    pub uid: String,

    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default)]
    pub auto_connect: bool,

    /// Named worker; the default worker otherwise
    #[serde(default)]
    pub worker: Option<String>,

    #[serde(rename = "in", default)]
    pub inputs: Vec<BindingDecl>,

    #[serde(default)]
    pub inout: Vec<BindingDecl>,

    #[serde(rename = "out", default)]
    pub outputs: Vec<BindingDecl>,

    /// Service-specific configuration, passed verbatim to `configuring`
    #[serde(default)]
    pub config: ConfigTree,
}

impl ServiceDecl {
    /// Uids of the non-optional `in`/`inout` bindings
    pub fn required_uids(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .chain(&self.inout)
            .filter(|b| !b.optional)
            .flat_map(|b| b.uid.iter().chain(b.group.iter().flatten()))
            .map(String::as_str)
    }

    /// Resolved bindings in declaration order: in, inout, out
    pub fn bindings(&self) -> Vec<Binding> {
        let declared = self
            .inputs
            .iter()
            .map(|b| (Access::In, b))
            .chain(self.inout.iter().map(|b| (Access::InOut, b)))
            .chain(self.outputs.iter().map(|b| (Access::Out, b)));

        declared
            .map(|(access, decl)| {
                let binding = match (&decl.uid, &decl.group) {
                    (_, Some(group)) => Binding::group(access, decl.key.clone(), group.clone()),
                    (Some(uid), None) => Binding::new(access, decl.key.clone(), uid.clone()),
                    (None, None) => Binding::group(access, decl.key.clone(), Vec::new()),
                };
                if decl.optional {
                    binding.optional()
                } else {
                    binding
                }
            })
            .collect()
    }
}

/// `key` bound to one `uid` or to a `group` of uids
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingDecl {
    pub key: String,

    #[serde(default)]
    pub uid: Option<String>,

    #[serde(default)]
    pub group: Option<Vec<String>>,

    #[serde(default)]
    pub optional: bool,
}

/// Every listed signal connected to every listed slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectionDecl {
    #[serde(default)]
    pub channel: Option<String>,

    #[serde(default)]
    pub signals: Vec<String>,

    #[serde(default)]
    pub slots: Vec<String>,
}

impl ConnectionDecl {
    /// Label used in logs
    pub fn label(&self) -> String {
        self.channel
            .clone()
            .unwrap_or_else(|| format!("{} -> {}", self.signals.join(","), self.slots.join(",")))
    }
}

/// A `uid/key` reference to a signal or slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub uid: String,
    pub key: String,
}

impl Endpoint {
    pub fn parse(s: &str) -> Result<Self, GraphError> {
        match s.split_once('/') {
            Some((uid, key)) if !uid.is_empty() && !key.is_empty() => Ok(Self {
                uid: uid.to_string(),
                key: key.to_string(),
            }),
            _ => Err(GraphError::MalformedEndpoint(s.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.uid, self.key)
    }
}

impl AppGraph {
    /// Read the graph of an adapted configuration and validate it
    pub fn from_adapted(adapted: &AdaptedConfig) -> Result<Self, GraphError> {
        let graph = Self::from_tree(&adapted.tree)?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn from_tree(tree: &ConfigTree) -> Result<Self, GraphError> {
        match tree {
            ConfigTree::Null => Ok(Self::default()),
            tree => serde_yaml::from_value(tree.clone()).map_err(GraphError::Parse),
        }
    }

    /// Check identifiers, bindings, endpoints and start/update references
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut uids = HashSet::new();
        for uid in self
            .objects
            .iter()
            .map(|o| &o.uid)
            .chain(self.services.iter().map(|s| &s.uid))
        {
            if uid.is_empty() {
                return Err(GraphError::EmptyUid);
            }
            if !uids.insert(uid.as_str()) {
                return Err(GraphError::DuplicateUid(uid.clone()));
            }
        }

        for object in &self.objects {
            if object.src == ObjectSource::New && object.type_name.is_none() {
                return Err(GraphError::MissingType(object.uid.clone()));
            }
        }

        for service in &self.services {
            for binding in service
                .inputs
                .iter()
                .chain(&service.inout)
                .chain(&service.outputs)
            {
                if binding.uid.is_some() == binding.group.is_some() {
                    return Err(GraphError::InvalidBinding {
                        service: service.uid.clone(),
                        key: binding.key.clone(),
                    });
                }
            }
            if let Some(binding) = service.outputs.iter().find(|b| b.group.is_some()) {
                return Err(GraphError::InvalidBinding {
                    service: service.uid.clone(),
                    key: binding.key.clone(),
                });
            }
        }

        for connection in &self.connections {
            for endpoint in connection.signals.iter().chain(&connection.slots) {
                Endpoint::parse(endpoint)?;
            }
        }

        let services: HashSet<&str> = self.services.iter().map(|s| s.uid.as_str()).collect();
        for uid in self.start.iter().chain(&self.update) {
            if !services.contains(uid.as_str()) {
                return Err(GraphError::UnknownService(uid.clone()));
            }
        }

        Ok(())
    }

    pub fn service(&self, uid: &str) -> Option<&ServiceDecl> {
        self.services.iter().find(|s| s.uid == uid)
    }

    /// Uids of the objects declared `src: deferred`
    pub fn deferred_objects(&self) -> HashSet<&str> {
        self.objects
            .iter()
            .filter(|o| o.src == ObjectSource::Deferred)
            .map(|o| o.uid.as_str())
            .collect()
    }

    /// Deferred objects a service cannot run without
    pub fn deferred_requirements(&self, service: &ServiceDecl) -> Vec<String> {
        let deferred = self.deferred_objects();
        let mut required: Vec<String> = Vec::new();
        for uid in service.required_uids().filter(|uid| deferred.contains(uid)) {
            if !required.iter().any(|r| r == uid) {
                required.push(uid.to_string());
            }
        }
        required
    }
}

/// Human-readable build plan, printed by dry runs
impl fmt::Display for AppGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.objects.is_empty() {
            writeln!(f, "Objects:")?;
            for object in &self.objects {
                let kind = match object.src {
                    ObjectSource::Ref => "ref".to_string(),
                    ObjectSource::Deferred => "deferred".to_string(),
                    ObjectSource::New => object.type_name.clone().unwrap_or_default(),
                };
                write!(f, "  {} ({})", object.uid, kind)?;
                if let Some(value) = &object.value {
                    write!(f, " = {}", value)?;
                }
                writeln!(f)?;
            }
            writeln!(f)?;
        }

        writeln!(f, "Services (in creation order):")?;
        for (i, service) in self.services.iter().enumerate() {
            writeln!(
                f,
                "  {}. {} [{}]{}",
                i + 1,
                service.uid,
                service.type_name,
                if service.auto_connect { " auto-connect" } else { "" }
            )?;
            for binding in service.bindings() {
                writeln!(f, "       {} {} -> {}", binding.access, binding.key, binding.uids.join(", "))?;
            }
        }

        if !self.connections.is_empty() {
            writeln!(f)?;
            writeln!(f, "Connections:")?;
            for connection in &self.connections {
                writeln!(f, "  {}", connection.label())?;
            }
        }

        if !self.start.is_empty() {
            writeln!(f)?;
            writeln!(f, "Start: {}", self.start.join(", "))?;
        }
        if !self.update.is_empty() {
            writeln!(f, "Update: {}", self.update.join(", "))?;
        }
        Ok(())
    }
}

/// Errors raised while reading a configuration graph
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Invalid configuration graph: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("Empty uid in configuration graph")]
    EmptyUid,

    #[error("Duplicate uid: {0}")]
    DuplicateUid(String),

    #[error("Object '{0}' has no type")]
    MissingType(String),

    #[error("Service '{service}': binding '{key}' needs exactly one of uid or group")]
    InvalidBinding { service: String, key: String },

    #[error("Malformed endpoint '{0}', expected uid/key")]
    MalformedEndpoint(String),

    #[error("Start/update list names an undeclared service: {0}")]
    UnknownService(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(yaml: &str) -> Result<AppGraph, GraphError> {
        let tree: ConfigTree = serde_yaml::from_str(yaml).unwrap();
        let graph = AppGraph::from_tree(&tree)?;
        graph.validate()?;
        Ok(graph)
    }

    const VIEWER: &str = r#"
objects:
  - uid: image
    type: sight::data::composite
  - uid: threshold
    type: sight::data::integer
    value: 128
  - uid: ${series}
    src: ref
services:
  - uid: reader
    type: sight::service::copy
    in:
      - key: source
        uid: ${series}
    out:
      - key: target
        uid: image
  - uid: logger
    type: sight::service::logger
    auto_connect: true
    worker: io
    in:
      - key: meshes
        group: [image, threshold]
    config:
      message: hello
connections:
  - channel: refresh
    signals: [reader/updated]
    slots: [logger/update]
start: [reader, logger]
update: [reader]
"#;

    #[test]
    fn test_parse_graph() {
        let g = graph(&VIEWER.replace("${series}", "series_1")).unwrap();
        assert_eq!(g.objects.len(), 3);
        assert_eq!(g.objects[1].value, Some(ConfigValue::Int(128)));
        assert_eq!(g.objects[2].src, ObjectSource::Ref);
        assert_eq!(g.services.len(), 2);

        let logger = g.service("logger").unwrap();
        assert!(logger.auto_connect);
        assert_eq!(logger.worker.as_deref(), Some("io"));
        let bindings = logger.bindings();
        assert!(bindings[0].group);
        assert_eq!(bindings[0].uids, vec!["image".to_string(), "threshold".to_string()]);

        let reader = g.service("reader").unwrap();
        let bindings = reader.bindings();
        assert_eq!(bindings[0].access, Access::In);
        assert_eq!(bindings[1].access, Access::Out);

        assert_eq!(g.connections[0].label(), "refresh");
        assert_eq!(g.start, vec!["reader".to_string(), "logger".to_string()]);
    }

    #[test]
    fn test_empty_tree() {
        assert_eq!(graph("~").unwrap(), AppGraph::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = graph("services:\n  - uid: a\n    type: t\n    autoconnect: true\n");
        assert!(matches!(result, Err(GraphError::Parse(_))));
    }

    #[test]
    fn test_duplicate_uid() {
        let result = graph(
            "objects:\n  - uid: a\n    type: t\nservices:\n  - uid: a\n    type: s\n",
        );
        assert!(matches!(result, Err(GraphError::DuplicateUid(uid)) if uid == "a"));
    }

    #[test]
    fn test_binding_needs_uid_or_group() {
        let result = graph("services:\n  - uid: a\n    type: s\n    in:\n      - key: image\n");
        assert!(matches!(result, Err(GraphError::InvalidBinding { .. })));
    }

    #[test]
    fn test_start_list_must_name_service() {
        let result = graph("services:\n  - uid: a\n    type: s\nstart: [b]\n");
        assert!(matches!(result, Err(GraphError::UnknownService(uid)) if uid == "b"));
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint = Endpoint::parse("srv/update").unwrap();
        assert_eq!(endpoint.uid, "srv");
        assert_eq!(endpoint.key, "update");
        assert!(Endpoint::parse("srv").is_err());
        assert!(Endpoint::parse("/update").is_err());
    }

    #[test]
    fn test_plan_display() {
        let g = graph(&VIEWER.replace("${series}", "series_1")).unwrap();
        let plan = g.to_string();
        assert!(plan.contains("1. reader [sight::service::copy]"));
        assert!(plan.contains("auto-connect"));
        assert!(plan.contains("Start: reader, logger"));
    }

    #[test]
    fn test_deferred_requirements() {
        let g = graph(
            r#"
objects:
  - uid: frame
    src: deferred
  - uid: mask
    src: deferred
    type: sight::data::integer
services:
  - uid: grabber
    type: sight::service::copy
    out:
      - key: target
        uid: frame
  - uid: viewer
    type: sight::service::logger
    in:
      - key: frame
        uid: frame
      - key: overlay
        group: [mask, frame]
      - key: extra
        uid: mask
        optional: true
"#,
        )
        .unwrap();
        assert_eq!(g.objects[0].src, ObjectSource::Deferred);
        assert!(g.deferred_requirements(g.service("grabber").unwrap()).is_empty());
        assert_eq!(
            g.deferred_requirements(g.service("viewer").unwrap()),
            vec!["frame".to_string(), "mask".to_string()]
        );
        assert!(g.to_string().contains("frame (deferred)"));
    }
}
