//! Runtime context shared by every component of an application

use crate::com::DispatchCore;
use crate::config::{ConfigStore, ConfigValue};
use crate::data::{DataError, DataObject, ObjectFactory};
use crate::runtime::{Entry, Registry, Workers, DEFAULT_WORKER};
use crate::service::{ServiceError, ServiceFactory, ServiceHandle, ServiceOptions, ServiceState};
use std::fmt;
use std::sync::Arc;

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name of the worker used by services that do not name one
    pub default_worker: String,
    /// Register the built-in object and service types
    pub builtin_types: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_worker: DEFAULT_WORKER.to_string(),
            builtin_types: true,
        }
    }
}

struct RuntimeInner {
    config: RuntimeConfig,
    registry: Registry,
    configs: ConfigStore,
    dispatch: DispatchCore,
    objects: ObjectFactory,
    services: ServiceFactory,
    workers: Workers,
}

/// Registry, configuration store, dispatch core, factories and workers of
/// one application.
///
/// Cheap to clone. Services keep a clone, so a runtime lives until
/// [`Runtime::shutdown`] released them. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        let (objects, services) = if config.builtin_types {
            (ObjectFactory::with_builtins(), ServiceFactory::with_builtins())
        } else {
            (ObjectFactory::new(), ServiceFactory::new())
        };
        let workers = Workers::with_default(&config.default_worker);

        Self {
            inner: Arc::new(RuntimeInner {
                config,
                registry: Registry::new(),
                configs: ConfigStore::new(),
                dispatch: DispatchCore::new(),
                objects,
                services,
                workers,
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn configs(&self) -> &ConfigStore {
        &self.inner.configs
    }

    pub fn dispatch(&self) -> &DispatchCore {
        &self.inner.dispatch
    }

    pub fn objects(&self) -> &ObjectFactory {
        &self.inner.objects
    }

    pub fn services(&self) -> &ServiceFactory {
        &self.inner.services
    }

    pub fn workers(&self) -> &Workers {
        &self.inner.workers
    }

    /// Create an object by type name; it is not registered
    pub fn create_object(
        &self,
        type_name: &str,
        id: &str,
        value: Option<ConfigValue>,
    ) -> Result<Arc<DataObject>, DataError> {
        self.inner.objects.create(type_name, id, value)
    }

    /// Create a service by type name; it is not registered
    pub fn create_service(
        &self,
        type_name: &str,
        id: &str,
        options: ServiceOptions,
    ) -> Result<ServiceHandle, ServiceError> {
        let service = self.inner.services.create(type_name)?;
        Ok(ServiceHandle::new(type_name, id, service, self.clone(), options))
    }

    /// Stop and destroy every registered service, then empty the registry,
    /// the configuration store and the named workers
    pub async fn shutdown(&self) {
        let entries = self.inner.registry.clear();
        let services: Vec<ServiceHandle> = entries
            .into_iter()
            .filter_map(|(_, entry)| match entry {
                Entry::Service(service) => Some(service),
                Entry::Object(_) => None,
            })
            .collect();

        for service in &services {
            if service.state() == ServiceState::Started {
                if let Err(e) = service.stop().await {
                    log::error!("[{}] Error stopping service: {}", service.id(), e);
                }
            }
        }

        for service in &services {
            let dropped = self
                .inner
                .dispatch
                .disconnect_owner(crate::com::SignalSource::owner_id(service));
            if dropped > 0 {
                log::warn!("[{}] Severed {} connection(s) at shutdown", service.id(), dropped);
            }
            if service.state() != ServiceState::Destroyed {
                if let Err(e) = service.destroy().await {
                    log::error!("[{}] Error destroying service: {}", service.id(), e);
                }
            }
        }

        self.inner.configs.clear();
        self.inner.workers.clear();
        log::debug!("Runtime shut down ({} service(s) released)", services.len());
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.inner.config)
            .field("registered", &self.inner.registry.len())
            .field("configs", &self.inner.configs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::STRING_TYPE;
    use crate::service::LOGGER_TYPE;

    #[tokio::test]
    async fn test_create_by_type_name() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let obj = runtime
            .create_object(STRING_TYPE, "name", Some(ConfigValue::from("x")))
            .unwrap();
        assert_eq!(obj.value(), Some(ConfigValue::from("x")));

        let srv = runtime
            .create_service(LOGGER_TYPE, "log", ServiceOptions::default())
            .unwrap();
        assert_eq!(srv.type_name(), LOGGER_TYPE);
        assert_eq!(srv.worker().name(), DEFAULT_WORKER);
        assert!(runtime.registry().is_empty());
    }

    #[tokio::test]
    async fn test_named_worker() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let options = ServiceOptions {
            worker: Some("io".to_string()),
            ..Default::default()
        };
        let srv = runtime.create_service(LOGGER_TYPE, "log", options).unwrap();
        assert_eq!(srv.worker().name(), "io");
        assert_eq!(runtime.workers().names(), vec!["io".to_string()]);
    }

    #[tokio::test]
    async fn test_without_builtins() {
        let runtime = Runtime::new(RuntimeConfig {
            builtin_types: false,
            ..Default::default()
        });
        assert!(matches!(
            runtime.create_service(LOGGER_TYPE, "log", ServiceOptions::default()),
            Err(ServiceError::UnknownType(_))
        ));
        assert!(runtime.create_object(STRING_TYPE, "s", None).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_releases_services() {
        let runtime = Runtime::new(RuntimeConfig::default());
        let srv = runtime
            .create_service(LOGGER_TYPE, "log", ServiceOptions::default())
            .unwrap();
        runtime.registry().register_service("log", srv.clone()).unwrap();
        srv.configure(crate::config::ConfigTree::Null).await.unwrap();
        srv.start().await.unwrap();

        runtime.shutdown().await;
        assert!(runtime.registry().is_empty());
        assert_eq!(srv.state(), ServiceState::Destroyed);
    }
}
