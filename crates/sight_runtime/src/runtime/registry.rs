//! Registry of live objects and services, keyed by textual identifier

use crate::data::DataObject;
use crate::service::ServiceHandle;
use crate::com::{OwnerId, SignalSource};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Capacity of the event channel; slower subscribers observe `Lagged`
const EVENT_CAPACITY: usize = 256;

/// A registered object or service
#[derive(Debug, Clone)]
pub enum Entry {
    Object(Arc<DataObject>),
    Service(ServiceHandle),
}

impl Entry {
    pub fn kind(&self) -> &'static str {
        match self {
            Entry::Object(_) => "object",
            Entry::Service(_) => "service",
        }
    }

    /// Signal owner identity of the entry
    pub fn owner_id(&self) -> OwnerId {
        match self {
            Entry::Object(object) => object.owner_id(),
            Entry::Service(service) => SignalSource::owner_id(service),
        }
    }
}

/// Change notification published by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(String),
    Unregistered(String),
}

impl RegistryEvent {
    pub fn id(&self) -> &str {
        match self {
            RegistryEvent::Registered(id) | RegistryEvent::Unregistered(id) => id,
        }
    }
}

/// Thread-safe identifier → entry map.
///
/// The registry only holds references; it never stops, destroys or removes
/// anything on its own. Every change is published to [`Registry::subscribe`]
/// after the table lock is released.
#[derive(Debug)]
pub struct Registry {
    entries: RwLock<HashMap<String, Entry>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for Registry {
    fn default() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive the registrations and removals made from now on
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register an entry under a free identifier
    pub fn register(&self, id: &str, entry: Entry) -> Result<(), RegistryError> {
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if entries.contains_key(id) {
                return Err(RegistryError::DuplicateId(id.to_string()));
            }
            log::trace!("Registered {} '{}'", entry.kind(), id);
            entries.insert(id.to_string(), entry);
        }
        self.publish(RegistryEvent::Registered(id.to_string()));
        Ok(())
    }

    pub fn register_object(&self, id: &str, object: Arc<DataObject>) -> Result<(), RegistryError> {
        self.register(id, Entry::Object(object))
    }

    pub fn register_service(&self, id: &str, service: ServiceHandle) -> Result<(), RegistryError> {
        self.register(id, Entry::Service(service))
    }

    pub fn get(&self, id: &str) -> Result<Entry, RegistryError> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn get_object(&self, id: &str) -> Result<Arc<DataObject>, RegistryError> {
        match self.get(id)? {
            Entry::Object(object) => Ok(object),
            other => Err(RegistryError::WrongKind {
                id: id.to_string(),
                expected: "object",
                found: other.kind(),
            }),
        }
    }

    pub fn get_service(&self, id: &str) -> Result<ServiceHandle, RegistryError> {
        match self.get(id)? {
            Entry::Service(service) => Ok(service),
            other => Err(RegistryError::WrongKind {
                id: id.to_string(),
                expected: "service",
                found: other.kind(),
            }),
        }
    }

    /// Remove an entry, returning it
    pub fn unregister(&self, id: &str) -> Result<Entry, RegistryError> {
        let entry = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        log::trace!("Unregistered {} '{}'", entry.kind(), id);
        self.publish(RegistryEvent::Unregistered(id.to_string()));
        Ok(entry)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    /// Registered identifiers, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry, returning them
    pub fn clear(&self) -> Vec<(String, Entry)> {
        let entries: Vec<(String, Entry)> = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, _) in &entries {
            self.publish(RegistryEvent::Unregistered(id.clone()));
        }
        entries
    }

    fn publish(&self, event: RegistryEvent) {
        // No receiver is not an error
        let _ = self.events.send(event);
    }
}

/// Errors raised by registry lookups and mutations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Identifier '{0}' is already registered")]
    DuplicateId(String),

    #[error("No entry registered under '{0}'")]
    NotFound(String),

    #[error("Entry '{id}' is a {found}, expected a {expected}")]
    WrongKind {
        id: String,
        expected: &'static str,
        found: &'static str,
    },
}
