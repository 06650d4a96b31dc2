//! Core service trait, lifecycle states, object bindings and the service context

use crate::com::{
    Arg, BlockGuard, Connection, DispatchError, OwnerId, Signature, SignalSource,
};
use crate::config::{ConfigTree, ConfigValue};
use crate::data::{
    DataError, DataObject, ADDED_FIELDS_SIG, CHANGED_FIELDS_SIG, MODIFIED_SIG, REMOVED_FIELDS_SIG,
};
use crate::runtime::{RegistryError, Runtime, Worker, WorkerError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

pub const STARTED_SIG: &str = "started";
pub const UPDATED_SIG: &str = "updated";
pub const STOPPED_SIG: &str = "stopped";

pub const START_SLOT: &str = "start";
pub const STOP_SLOT: &str = "stop";
pub const UPDATE_SLOT: &str = "update";

/// A unit of behavior driven through the lifecycle
/// `configuring → starting → updating* → stopping`.
///
/// Every hook runs on the service's worker, never concurrently with another
/// hook or slot of the same service. A hook returning an error aborts the
/// transition: the service keeps its previous state.
///
/// # Example
///
/// ```rust,ignore
/// use sight_runtime::prelude::*;
///
/// #[derive(Default)]
/// struct Threshold {
///     level: i64,
/// }
///
/// #[async_trait]
/// impl Service for Threshold {
///     async fn configuring(&mut self, _ctx: &ServiceContext, config: &ConfigTree) -> Result<(), ServiceError> {
///         self.level = config.get("level").and_then(|v| v.as_i64()).unwrap_or(128);
///         Ok(())
///     }
///
///     async fn updating(&mut self, ctx: &ServiceContext) -> Result<(), ServiceError> {
///         let image = ctx.input("image")?;
///         log::info!("[{}] thresholding {} at {}", ctx.id(), image.id(), self.level);
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Service: Send + 'static {
    /// Signals emitted besides `started`, `updated` and `stopped`
    fn signals(&self) -> Vec<(&'static str, Signature)> {
        Vec::new()
    }

    /// Slots exposed besides `start`, `stop` and `update`.
    ///
    /// Deliveries reach [`Service::call_slot`].
    fn slots(&self) -> Vec<(&'static str, Signature)> {
        Vec::new()
    }

    /// `(object signal, service slot)` pairs wired for every bound input
    /// when the service is auto-connected
    fn auto_connections(&self) -> Vec<(&'static str, &'static str)> {
        vec![(MODIFIED_SIG, UPDATE_SLOT)]
    }

    async fn configuring(
        &mut self,
        _ctx: &ServiceContext,
        _config: &ConfigTree,
    ) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn starting(&mut self, _ctx: &ServiceContext) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Primary computation
    async fn updating(&mut self, ctx: &ServiceContext) -> Result<(), ServiceError>;

    async fn stopping(&mut self, _ctx: &ServiceContext) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Run a custom slot declared by [`Service::slots`]
    async fn call_slot(
        &mut self,
        _ctx: &ServiceContext,
        key: &str,
        _args: Vec<Arg>,
    ) -> Result<(), ServiceError> {
        Err(ServiceError::UnknownSlot(key.to_string()))
    }
}

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Created,
    Configured,
    Started,
    Stopped,
    Destroyed,
}

impl ServiceState {
    pub fn is_started(&self) -> bool {
        *self == ServiceState::Started
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Created => write!(f, "created"),
            ServiceState::Configured => write!(f, "configured"),
            ServiceState::Started => write!(f, "started"),
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// How a service accesses a bound object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    In,
    InOut,
    Out,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::In => write!(f, "in"),
            Access::InOut => write!(f, "inout"),
            Access::Out => write!(f, "out"),
        }
    }
}

/// Association of a service role (`key`) with registry identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub key: String,
    pub access: Access,
    /// One uid, or the members of a group in index order
    pub uids: Vec<String>,
    pub group: bool,
    pub optional: bool,
}

impl Binding {
    pub fn new(access: Access, key: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            access,
            uids: vec![uid.into()],
            group: false,
            optional: false,
        }
    }

    pub fn input(key: impl Into<String>, uid: impl Into<String>) -> Self {
        Self::new(Access::In, key, uid)
    }

    pub fn inout(key: impl Into<String>, uid: impl Into<String>) -> Self {
        Self::new(Access::InOut, key, uid)
    }

    pub fn output(key: impl Into<String>, uid: impl Into<String>) -> Self {
        Self::new(Access::Out, key, uid)
    }

    pub fn group(access: Access, key: impl Into<String>, uids: Vec<String>) -> Self {
        Self {
            key: key.into(),
            access,
            uids,
            group: true,
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// The runtime as seen by one service: its identity, bindings and signals.
///
/// Bound objects are looked up in the registry on every access; the service
/// never owns them.
pub struct ServiceContext {
    id: String,
    owner: OwnerId,
    runtime: Runtime,
    worker: Worker,
    bindings: Vec<Binding>,
    signals: HashMap<String, Signature>,
    outputs: Mutex<HashSet<String>>,
    auto_connections: Mutex<Vec<Connection>>,
}

impl ServiceContext {
    pub(crate) fn new(
        id: String,
        runtime: Runtime,
        worker: Worker,
        bindings: Vec<Binding>,
        custom_signals: Vec<(&'static str, Signature)>,
    ) -> Self {
        let mut signals: HashMap<String, Signature> = [STARTED_SIG, UPDATED_SIG, STOPPED_SIG]
            .into_iter()
            .map(|key| (key.to_string(), Signature::empty()))
            .collect();
        for (key, signature) in custom_signals {
            signals.insert(key.to_string(), signature);
        }

        Self {
            id,
            owner: OwnerId::next(),
            runtime,
            worker,
            bindings,
            signals,
            outputs: Mutex::new(HashSet::new()),
            auto_connections: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn binding(&self, key: &str) -> Option<&Binding> {
        self.bindings.iter().find(|b| b.key == key)
    }

    /// Object bound as `in` or `inout` under `key`
    pub fn input(&self, key: &str) -> Result<Arc<DataObject>, ServiceError> {
        self.input_at(key, 0)
    }

    /// Like [`ServiceContext::input`], returning `None` for an absent optional binding
    pub fn try_input(&self, key: &str) -> Result<Option<Arc<DataObject>>, ServiceError> {
        match self.binding(key) {
            None => Ok(None),
            Some(binding) if binding.optional => match self.input(key) {
                Ok(object) => Ok(Some(object)),
                Err(ServiceError::Registry(RegistryError::NotFound(_))) => Ok(None),
                Err(e) => Err(e),
            },
            Some(_) => self.input(key).map(Some),
        }
    }

    /// Object bound as `inout` under `key`
    pub fn inout(&self, key: &str) -> Result<Arc<DataObject>, ServiceError> {
        let binding = self.expect_binding(key, &[Access::InOut])?;
        self.lookup(binding, 0)
    }

    /// Member `index` of the group bound under `key`
    pub fn input_at(&self, key: &str, index: usize) -> Result<Arc<DataObject>, ServiceError> {
        let binding = self.expect_binding(key, &[Access::In, Access::InOut])?;
        self.lookup(binding, index)
    }

    /// Number of members in the group bound under `key`
    pub fn group_len(&self, key: &str) -> usize {
        self.binding(key).map(|b| b.uids.len()).unwrap_or(0)
    }

    /// Identifier an output is published under
    pub fn output_uid(&self, key: &str) -> Result<&str, ServiceError> {
        let binding = self.expect_binding(key, &[Access::Out])?;
        Ok(binding.uids.first().map(String::as_str).unwrap_or_default())
    }

    /// Create an object with the output identifier and publish it
    pub fn create_output(
        &self,
        key: &str,
        type_name: &str,
        value: Option<ConfigValue>,
    ) -> Result<Arc<DataObject>, ServiceError> {
        let uid = self.output_uid(key)?.to_string();
        let object = self.runtime.objects().create(type_name, &uid, value)?;
        self.set_output(key, Some(object.clone()))?;
        Ok(object)
    }

    /// Publish (`Some`) or withdraw (`None`) the output bound under `key`.
    ///
    /// A published object must carry the output identifier.
    pub fn set_output(
        &self,
        key: &str,
        object: Option<Arc<DataObject>>,
    ) -> Result<(), ServiceError> {
        let uid = self.output_uid(key)?.to_string();
        let registry = self.runtime.registry();
        if let Some(object) = &object {
            if object.id() != uid {
                return Err(ServiceError::OutputId {
                    key: key.to_string(),
                    expected: uid,
                    found: object.id().to_string(),
                });
            }
        }

        let mut outputs = self.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        if outputs.remove(&uid) {
            registry.unregister(&uid)?;
        }

        if let Some(object) = object {
            registry.register_object(&uid, object)?;
            log::debug!("[{}] Published output '{}'", self.id, uid);
            outputs.insert(uid);
        }
        Ok(())
    }

    /// Withdraw every published output
    pub(crate) fn clear_outputs(&self) {
        let mut outputs = self.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        for uid in outputs.drain() {
            if let Err(e) = self.runtime.registry().unregister(&uid) {
                log::warn!("[{}] Output '{}' already gone: {}", self.id, uid, e);
            }
        }
    }

    /// Deliver a signal of this service in the caller's context.
    ///
    /// A slot of this same service connected to the signal must not be
    /// reached this way from inside one of its own hooks; use
    /// [`ServiceContext::async_emit`] there. Launcher slots only queue their
    /// work and are safe to reach from a hook.
    pub async fn emit(&self, signal: &str, args: Vec<Arg>) -> Result<(), ServiceError> {
        self.runtime.dispatch().emit(self, signal, args).await?;
        Ok(())
    }

    /// Queue a signal of this service to the workers of its connected slots
    pub fn async_emit(&self, signal: &str, args: Vec<Arg>) -> Result<usize, ServiceError> {
        Ok(self.runtime.dispatch().async_emit(self, signal, args)?)
    }

    /// Set a field of `object` and queue `added_fields` or `changed_fields`
    /// with its name. Returns the replaced field.
    pub fn set_field(
        &self,
        object: &DataObject,
        name: &str,
        field: Arc<DataObject>,
    ) -> Result<Option<Arc<DataObject>>, ServiceError> {
        let replaced = object.set_field(name, field);
        let signal = if replaced.is_some() {
            CHANGED_FIELDS_SIG
        } else {
            ADDED_FIELDS_SIG
        };
        self.runtime
            .dispatch()
            .async_emit(object, signal, vec![Arg::from(name)])?;
        Ok(replaced)
    }

    /// Remove a field of `object`, queueing `removed_fields` if it existed
    pub fn remove_field(
        &self,
        object: &DataObject,
        name: &str,
    ) -> Result<Option<Arc<DataObject>>, ServiceError> {
        let removed = object.remove_field(name);
        if removed.is_some() {
            self.runtime
                .dispatch()
                .async_emit(object, REMOVED_FIELDS_SIG, vec![Arg::from(name)])?;
        }
        Ok(removed)
    }

    /// Queue the `modified` signal of an object
    pub fn notify_modified(&self, object: &DataObject) -> Result<usize, ServiceError> {
        Ok(self
            .runtime
            .dispatch()
            .async_emit(object, MODIFIED_SIG, Vec::new())?)
    }

    /// Block the connections made by auto-connect until the guards drop
    pub fn block_auto_connections(&self) -> Vec<BlockGuard> {
        let dispatch = self.runtime.dispatch();
        self.auto_connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|c| dispatch.block(c).ok())
            .collect()
    }

    pub(crate) fn set_auto_connections(&self, connections: Vec<Connection>) {
        *self
            .auto_connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = connections;
    }

    pub(crate) fn take_auto_connections(&self) -> Vec<Connection> {
        std::mem::take(
            &mut *self
                .auto_connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn expect_binding(&self, key: &str, allowed: &[Access]) -> Result<&Binding, ServiceError> {
        let binding = self
            .binding(key)
            .ok_or_else(|| ServiceError::MissingBinding(key.to_string()))?;
        if !allowed.contains(&binding.access) {
            return Err(ServiceError::WrongAccess {
                key: key.to_string(),
                declared: binding.access,
            });
        }
        Ok(binding)
    }

    fn lookup(&self, binding: &Binding, index: usize) -> Result<Arc<DataObject>, ServiceError> {
        let uid = binding
            .uids
            .get(index)
            .ok_or_else(|| ServiceError::GroupIndex {
                key: binding.key.clone(),
                index,
            })?;
        Ok(self.runtime.registry().get_object(uid)?)
    }
}

impl SignalSource for ServiceContext {
    fn owner_id(&self) -> OwnerId {
        self.owner
    }

    fn label(&self) -> &str {
        &self.id
    }

    fn signal_signature(&self, key: &str) -> Option<Signature> {
        self.signals.get(key).cloned()
    }
}

/// Errors raised by service implementations and their context
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Unknown service type: {0}")]
    UnknownType(String),

    #[error("No binding for key '{0}'")]
    MissingBinding(String),

    #[error("Binding '{key}' is declared as {declared}")]
    WrongAccess { key: String, declared: Access },

    #[error("Binding '{key}' has no member {index}")]
    GroupIndex { key: String, index: usize },

    #[error("Output '{key}' must carry id '{expected}', got '{found}'")]
    OutputId {
        key: String,
        expected: String,
        found: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unknown slot: {0}")]
    UnknownSlot(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("{0}")]
    Other(String),
}

/// Errors raised by lifecycle transitions
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("[{id}] Cannot {operation} while {state}")]
    InvalidState {
        id: String,
        operation: &'static str,
        state: ServiceState,
    },

    #[error("[{id}] {operation} failed: {source}")]
    Failed {
        id: String,
        operation: &'static str,
        #[source]
        source: ServiceError,
    },

    #[error("[{id}] Still has {count} live connection(s)")]
    DanglingConnections { id: String, count: usize },

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceState::Configured.to_string(), "configured");
        assert!(ServiceState::Started.is_started());
        assert!(!ServiceState::Stopped.is_started());
    }

    #[test]
    fn test_binding_builders() {
        let binding = Binding::input("image", "img1").optional();
        assert_eq!(binding.access, Access::In);
        assert_eq!(binding.uids, vec!["img1".to_string()]);
        assert!(binding.optional);
        assert!(!binding.group);

        let group = Binding::group(Access::InOut, "meshes", vec!["a".into(), "b".into()]);
        assert!(group.group);
        assert_eq!(group.uids.len(), 2);
    }

    #[test]
    fn test_lifecycle_error_message() {
        let err = LifecycleError::InvalidState {
            id: "srv1".to_string(),
            operation: "start",
            state: ServiceState::Created,
        };
        assert_eq!(err.to_string(), "[srv1] Cannot start while created");
    }
}
