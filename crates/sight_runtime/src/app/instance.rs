//! A built application graph: the objects, services and channels created
//! for one adapted configuration

use crate::app::deferred::{DeferredSet, DeferredWatcher, Role};
use crate::app::{AppGraph, Endpoint, LauncherError, ObjectSource};
use crate::com::{ChannelMember, SignalSource};
use crate::config::{unique_identifier, AdaptedConfig};
use crate::data::{DataError, DataObject};
use crate::runtime::{Entry, RegistryError, RegistryEvent, Runtime};
use crate::service::{Access, ServiceError, ServiceHandle, ServiceOptions, ServiceState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

/// An object held by an instance
#[derive(Debug, Clone)]
pub struct InstanceObject {
    /// Uid as declared in the template, before prefixing
    pub local_uid: String,
    /// Identifier the object is registered under
    pub uid: String,
    pub object: Arc<DataObject>,
    /// Registered by this instance, as opposed to referenced
    pub owned: bool,
}

/// The live graph of one configuration.
///
/// Built all-or-nothing: a failure while building tears down whatever was
/// created so far before the error is returned. Every connection declaration
/// is a channel, named or generated. Services requiring deferred objects are
/// handed to a background watcher that creates and removes them as those
/// objects come and go.
pub struct AppInstance {
    runtime: Runtime,
    config_id: String,
    instance_id: Option<String>,
    objects: Vec<InstanceObject>,
    services: Vec<ServiceHandle>,
    members: Vec<ChannelMember>,
    started: Vec<ServiceHandle>,
    deferred: Option<DeferredWatcher>,
}

impl AppInstance {
    /// Build the graph of `adapted`.
    ///
    /// Objects found in `survivors` under their local uid are reused instead
    /// of being created.
    pub async fn build(
        runtime: Runtime,
        adapted: &AdaptedConfig,
        survivors: &HashMap<String, Arc<DataObject>>,
    ) -> Result<Self, LauncherError> {
        let graph = AppGraph::from_adapted(adapted)?;
        let events = runtime.registry().subscribe();
        let mut instance = Self {
            runtime,
            config_id: adapted.config_id.clone(),
            instance_id: adapted.instance_id.clone(),
            objects: Vec::new(),
            services: Vec::new(),
            members: Vec::new(),
            started: Vec::new(),
            deferred: None,
        };

        match instance.populate(&graph, survivors, events).await {
            Ok(()) => {
                log::info!(
                    "[{}] Built {} object(s), {} service(s), {} channel member(s)",
                    instance.label(),
                    instance.objects.len(),
                    instance.services.len(),
                    instance.members.len()
                );
                Ok(instance)
            }
            Err(e) => {
                log::warn!("[{}] Build failed, unwinding: {}", instance.label(), e);
                instance.teardown().await;
                Err(e)
            }
        }
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    /// Generated prefix of the instance identifiers, when auto-prefixed
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Identifier a uid declared in the template was registered under
    pub fn resolve_uid(&self, local_uid: &str) -> String {
        match &self.instance_id {
            Some(prefix) => format!("{}_{}", prefix, local_uid),
            None => local_uid.to_string(),
        }
    }

    pub fn objects(&self) -> &[InstanceObject] {
        &self.objects
    }

    /// Services in creation order
    pub fn services(&self) -> &[ServiceHandle] {
        &self.services
    }

    pub fn service(&self, local_uid: &str) -> Option<&ServiceHandle> {
        let uid = self.resolve_uid(local_uid);
        self.services.iter().find(|s| s.id() == uid)
    }

    /// Signals and slots joined to channels at build time
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Whether some services or endpoints wait on deferred objects
    pub fn has_deferred(&self) -> bool {
        self.deferred.is_some()
    }

    fn label(&self) -> &str {
        self.instance_id.as_deref().unwrap_or(&self.config_id)
    }

    fn local_uid(&self, uid: &str) -> String {
        self.instance_id
            .as_ref()
            .and_then(|prefix| uid.strip_prefix(prefix.as_str()))
            .and_then(|rest| rest.strip_prefix('_'))
            .unwrap_or(uid)
            .to_string()
    }

    async fn populate(
        &mut self,
        graph: &AppGraph,
        survivors: &HashMap<String, Arc<DataObject>>,
        events: broadcast::Receiver<RegistryEvent>,
    ) -> Result<(), LauncherError> {
        let runtime = self.runtime.clone();
        let registry = runtime.registry();
        let dispatch = runtime.dispatch();
        let deferred_objects = graph.deferred_objects();
        let mut deferred = DeferredSet::new(
            runtime.clone(),
            self.label(),
            deferred_objects.iter().map(|uid| uid.to_string()).collect(),
        );

        for decl in &graph.objects {
            let local_uid = self.local_uid(&decl.uid);
            let (object, owned) = match decl.src {
                ObjectSource::Deferred => continue,
                ObjectSource::Ref => {
                    let object = registry.get_object(&decl.uid).map_err(missing_as_unknown)?;
                    (object, false)
                }
                ObjectSource::New => {
                    let object = match survivors.get(&local_uid) {
                        Some(object) => {
                            log::debug!(
                                "[{}] Reusing surviving object '{}'",
                                self.label(),
                                local_uid
                            );
                            object.clone()
                        }
                        None => {
                            let type_name = decl.type_name.as_deref().unwrap_or_default();
                            runtime
                                .create_object(type_name, &decl.uid, decl.value.clone())
                                .map_err(|e| match e {
                                    DataError::UnknownType(t) => LauncherError::UnknownObjectType(t),
                                    other => LauncherError::Build(format!(
                                        "object '{}': {}",
                                        decl.uid, other
                                    )),
                                })?
                        }
                    };
                    registry.register_object(&decl.uid, object.clone())?;
                    (object, true)
                }
            };
            self.objects.push(InstanceObject {
                local_uid,
                uid: decl.uid.clone(),
                object,
                owned,
            });
        }

        for decl in &graph.services {
            let required = graph.deferred_requirements(decl);
            if !required.is_empty() {
                deferred.add_service(
                    decl.clone(),
                    required,
                    graph.start.contains(&decl.uid),
                    graph.update.contains(&decl.uid),
                );
                continue;
            }

            for output in decl.outputs.iter().filter_map(|b| b.uid.as_deref()) {
                if !deferred_objects.contains(output) {
                    log::warn!(
                        "[{}] Output '{}' of '{}' is not declared deferred",
                        self.label(),
                        output,
                        decl.uid
                    );
                }
            }

            let options = ServiceOptions {
                worker: decl.worker.clone(),
                auto_connect: decl.auto_connect,
                bindings: decl.bindings(),
            };
            for binding in options
                .bindings
                .iter()
                .filter(|b| !b.optional && b.access != Access::Out)
            {
                if let Some(missing) = binding.uids.iter().find(|uid| !registry.contains(uid)) {
                    return Err(LauncherError::UnknownObject(missing.clone()));
                }
            }

            let service = runtime
                .create_service(&decl.type_name, &decl.uid, options)
                .map_err(|e| match e {
                    ServiceError::UnknownType(t) => LauncherError::UnknownServiceType(t),
                    other => LauncherError::Build(format!("service '{}': {}", decl.uid, other)),
                })?;
            registry.register_service(&decl.uid, service.clone())?;
            self.services.push(service.clone());
            service.configure(decl.config.clone()).await?;
        }

        for decl in &graph.connections {
            let channel = decl
                .channel
                .clone()
                .unwrap_or_else(|| unique_identifier(&format!("{}_proxy", self.label())));

            for signal in &decl.signals {
                let signal = Endpoint::parse(signal)?;
                if deferred.is_deferred(&signal.uid) {
                    deferred.add_endpoint(&channel, signal, Role::Signal);
                    continue;
                }
                let entry = registry.get(&signal.uid).map_err(missing_as_unknown)?;
                let source: &dyn SignalSource = match &entry {
                    Entry::Object(object) => object.as_ref(),
                    Entry::Service(service) => service,
                };
                self.members
                    .push(dispatch.join_signal(&channel, source, &signal.key)?);
            }

            for slot in &decl.slots {
                let slot = Endpoint::parse(slot)?;
                if deferred.is_deferred(&slot.uid) {
                    deferred.add_endpoint(&channel, slot, Role::Slot);
                    continue;
                }
                let target = registry.get_service(&slot.uid).map_err(missing_as_unknown)?;
                self.members
                    .push(dispatch.join_slot(&channel, &target, &slot.key)?);
            }
            log::debug!("[{}] Channel '{}': {}", self.label(), channel, decl.label());
        }

        for uid in graph.start.iter().filter(|uid| !deferred.is_deferred(uid)) {
            let service = registry.get_service(uid)?;
            service.start().await?;
            self.started.push(service);
        }

        for uid in graph.update.iter().filter(|uid| !deferred.is_deferred(uid)) {
            registry.get_service(uid)?.update().await?;
        }

        if !deferred.is_empty() {
            deferred.reconcile().await;
            self.deferred = Some(DeferredWatcher::spawn(deferred, events));
        }

        Ok(())
    }

    /// Disconnect, stop, destroy and unregister everything the instance created
    pub async fn teardown(&mut self) {
        let runtime = self.runtime.clone();
        let dispatch = runtime.dispatch();
        let registry = runtime.registry();

        if let Some(watcher) = self.deferred.take() {
            if let Some(mut deferred) = watcher.stop().await {
                deferred.teardown().await;
            }
        }

        for member in self.members.drain(..) {
            dispatch.leave(&member);
        }

        for service in self.started.drain(..).rev() {
            if let Err(e) = service.stop().await {
                log::error!("[{}] Error stopping service: {}", service.id(), e);
            }
        }
        for service in self.services.iter().rev() {
            if service.state() == ServiceState::Started {
                if let Err(e) = service.stop().await {
                    log::error!("[{}] Error stopping service: {}", service.id(), e);
                }
            }
        }

        for service in self.services.iter().rev() {
            let dangling = dispatch.disconnect_owner(SignalSource::owner_id(service));
            if dangling > 0 {
                log::warn!("[{}] Severed {} dangling connection(s)", service.id(), dangling);
            }
            if let Err(e) = service.destroy().await {
                log::error!("[{}] Error destroying service: {}", service.id(), e);
            }
        }

        for service in self.services.drain(..).rev() {
            if let Err(e) = registry.unregister(service.id()) {
                log::warn!("[{}] {}", service.id(), e);
            }
        }

        for object in self.objects.drain(..).rev().filter(|o| o.owned) {
            if let Err(e) = registry.unregister(&object.uid) {
                log::warn!("[{}] {}", object.uid, e);
            }
        }

        log::info!("[{}] Torn down", self.label());
    }
}

impl Drop for AppInstance {
    fn drop(&mut self) {
        if let Some(watcher) = &self.deferred {
            watcher.abort();
        }
        if !self.services.is_empty() || !self.objects.is_empty() {
            log::warn!(
                "[{}] Dropped without teardown; {} service(s) still registered",
                self.label(),
                self.services.len()
            );
        }
    }
}

/// A missing identifier is an unknown object; any other registry failure is reported as is
fn missing_as_unknown(e: RegistryError) -> LauncherError {
    match e {
        RegistryError::NotFound(uid) => LauncherError::UnknownObject(uid),
        other => LauncherError::Registry(other),
    }
}
