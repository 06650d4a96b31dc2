//! Service factory: constructs services from the type names used in configurations

use crate::service::builtin::{CopyService, CounterService, LoggerService};
use crate::service::{Service, ServiceError};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

pub const LOGGER_TYPE: &str = "sight::service::logger";
pub const COUNTER_TYPE: &str = "sight::service::counter";
pub const COPY_TYPE: &str = "sight::service::copy";

type Constructor = Arc<dyn Fn() -> Box<dyn Service> + Send + Sync>;

/// Table of service constructors keyed by type name
pub struct ServiceFactory {
    constructors: RwLock<HashMap<String, Constructor>>,
}

impl ServiceFactory {
    pub fn new() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
        }
    }

    /// Factory knowing the services shipped with the runtime
    pub fn with_builtins() -> Self {
        let factory = Self::new();
        factory.register_default::<LoggerService>(LOGGER_TYPE);
        factory.register_default::<CounterService>(COUNTER_TYPE);
        factory.register_default::<CopyService>(COPY_TYPE);
        factory
    }

    /// Register or replace the constructor of `type_name`
    pub fn register<F>(&self, type_name: &str, constructor: F)
    where
        F: Fn() -> Box<dyn Service> + Send + Sync + 'static,
    {
        self.constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_name.to_string(), Arc::new(constructor));
    }

    /// Register a service built with `Default`
    pub fn register_default<S: Service + Default>(&self, type_name: &str) {
        self.register(type_name, || Box::new(S::default()));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(type_name)
    }

    pub fn create(&self, type_name: &str) -> Result<Box<dyn Service>, ServiceError> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_name)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownType(type_name.to_string()))?;
        Ok(constructor())
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort_unstable();
        types
    }
}

impl Default for ServiceFactory {
    fn default() -> Self {
        Self::with_builtins()
    }
}
