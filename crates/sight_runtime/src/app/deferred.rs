//! Deferred part of an application instance: services waiting on objects
//! that are published later, and channel endpoints whose owner is one of
//! those objects or services.
//!
//! The set is reconciled against the registry whenever a watched identifier
//! is registered or unregistered. A service runs only while every deferred
//! object it requires is registered; when one of them disappears or is
//! replaced, the service is stopped and destroyed, and recreated once the
//! objects are back.

use crate::app::{Endpoint, LauncherError, ServiceDecl};
use crate::com::{ChannelMember, OwnerId, SignalSource};
use crate::runtime::{Entry, RegistryError, RegistryEvent, Runtime};
use crate::service::{ServiceHandle, ServiceOptions, ServiceState};
use std::collections::HashSet;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Which side of a channel an endpoint joins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Signal,
    Slot,
}

struct PendingEndpoint {
    channel: String,
    endpoint: Endpoint,
    role: Role,
    joined: Option<(OwnerId, ChannelMember)>,
}

struct Active {
    handle: ServiceHandle,
    /// Owners of the required objects when the service was created
    owners: Vec<OwnerId>,
}

struct DeferredService {
    decl: ServiceDecl,
    required: Vec<String>,
    start: bool,
    update: bool,
    active: Option<Active>,
}

pub(crate) struct DeferredSet {
    runtime: Runtime,
    label: String,
    objects: HashSet<String>,
    services: Vec<DeferredService>,
    endpoints: Vec<PendingEndpoint>,
}

impl DeferredSet {
    pub fn new(runtime: Runtime, label: &str, objects: HashSet<String>) -> Self {
        Self {
            runtime,
            label: label.to_string(),
            objects,
            services: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.endpoints.is_empty()
    }

    /// Whether `uid` names a deferred object or a deferred service
    pub fn is_deferred(&self, uid: &str) -> bool {
        self.objects.contains(uid) || self.services.iter().any(|s| s.decl.uid == uid)
    }

    pub fn add_service(&mut self, decl: ServiceDecl, required: Vec<String>, start: bool, update: bool) {
        log::debug!(
            "[{}] '{}' waits for {}",
            self.label,
            decl.uid,
            required.join(", ")
        );
        self.services.push(DeferredService {
            decl,
            required,
            start,
            update,
            active: None,
        });
    }

    pub fn add_endpoint(&mut self, channel: &str, endpoint: Endpoint, role: Role) {
        self.endpoints.push(PendingEndpoint {
            channel: channel.to_string(),
            endpoint,
            role,
            joined: None,
        });
    }

    fn watches(&self, uid: &str) -> bool {
        self.objects.contains(uid) || self.endpoints.iter().any(|e| e.endpoint.uid == uid)
    }

    /// Bring services and endpoints in line with the registry
    pub async fn reconcile(&mut self) {
        for index in 0..self.services.len() {
            let current = self.required_owners(&self.services[index].required);
            let stale = match &self.services[index].active {
                Some(active) => current.as_ref() != Some(&active.owners),
                None => false,
            };
            if stale {
                self.deactivate(index).await;
            }
        }

        let dispatch = self.runtime.dispatch();
        let registry = self.runtime.registry();
        for pending in &mut self.endpoints {
            if let Some((owner, member)) = &pending.joined {
                let current = registry.get(&pending.endpoint.uid).ok().map(|e| e.owner_id());
                if current != Some(*owner) {
                    dispatch.leave(member);
                    pending.joined = None;
                }
            }
        }

        let mut activated = Vec::new();
        for index in 0..self.services.len() {
            if self.services[index].active.is_some() {
                continue;
            }
            let Some(owners) = self.required_owners(&self.services[index].required) else {
                continue;
            };
            match self.activate(index, owners).await {
                Ok(()) => activated.push(index),
                Err(e) => log::error!(
                    "[{}] Cannot create deferred service '{}': {}",
                    self.label,
                    self.services[index].decl.uid,
                    e
                ),
            }
        }

        self.join_endpoints();

        for &index in &activated {
            self.run(index).await;
        }
    }

    /// Leave every channel and remove every deferred service
    pub async fn teardown(&mut self) {
        let dispatch = self.runtime.dispatch();
        for pending in &mut self.endpoints {
            if let Some((_, member)) = pending.joined.take() {
                dispatch.leave(&member);
            }
        }
        for index in (0..self.services.len()).rev() {
            self.deactivate(index).await;
        }
    }

    /// Owners of every required object, `None` while one is missing
    fn required_owners(&self, required: &[String]) -> Option<Vec<OwnerId>> {
        let registry = self.runtime.registry();
        required
            .iter()
            .map(|uid| registry.get_object(uid).ok().map(|o| o.owner_id()))
            .collect()
    }

    async fn activate(&mut self, index: usize, owners: Vec<OwnerId>) -> Result<(), LauncherError> {
        let runtime = self.runtime.clone();
        let decl = &self.services[index].decl;
        let options = ServiceOptions {
            worker: decl.worker.clone(),
            auto_connect: decl.auto_connect,
            bindings: decl.bindings(),
        };

        let service = runtime
            .create_service(&decl.type_name, &decl.uid, options)
            .map_err(|e| LauncherError::Build(format!("service '{}': {}", decl.uid, e)))?;
        runtime.registry().register_service(&decl.uid, service.clone())?;
        if let Err(e) = service.configure(decl.config.clone()).await {
            Self::remove(&runtime, &service).await;
            return Err(e.into());
        }

        log::info!("[{}] Created deferred service '{}'", self.label, decl.uid);
        self.services[index].active = Some(Active {
            handle: service,
            owners,
        });
        Ok(())
    }

    async fn run(&self, index: usize) {
        let deferred = &self.services[index];
        let Some(active) = &deferred.active else {
            return;
        };
        if deferred.start {
            if let Err(e) = active.handle.start().await {
                log::error!("[{}] {}", self.label, e);
                return;
            }
            if deferred.update {
                if let Err(e) = active.handle.update().await {
                    log::error!("[{}] {}", self.label, e);
                }
            }
        }
    }

    async fn deactivate(&mut self, index: usize) {
        let Some(active) = self.services[index].active.take() else {
            return;
        };
        let owner = SignalSource::owner_id(&active.handle);
        for pending in &mut self.endpoints {
            if matches!(&pending.joined, Some((o, _)) if *o == owner) {
                pending.joined = None;
            }
        }

        log::info!(
            "[{}] Removing deferred service '{}'",
            self.label,
            active.handle.id()
        );
        Self::remove(&self.runtime, &active.handle).await;
    }

    async fn remove(runtime: &Runtime, service: &ServiceHandle) {
        if service.state() == ServiceState::Started {
            if let Err(e) = service.stop().await {
                log::error!("[{}] Error stopping service: {}", service.id(), e);
            }
        }
        runtime
            .dispatch()
            .disconnect_owner(SignalSource::owner_id(service));
        if let Err(e) = service.destroy().await {
            log::error!("[{}] Error destroying service: {}", service.id(), e);
        }
        if let Err(e) = runtime.registry().unregister(service.id()) {
            log::warn!("[{}] {}", service.id(), e);
        }
    }

    fn join_endpoints(&mut self) {
        let dispatch = self.runtime.dispatch();
        let registry = self.runtime.registry();
        for pending in self.endpoints.iter_mut().filter(|e| e.joined.is_none()) {
            let uid = &pending.endpoint.uid;
            let entry = match registry.get(uid) {
                Ok(entry) => entry,
                Err(RegistryError::NotFound(_)) => continue,
                Err(e) => {
                    log::error!("[{}] {}", self.label, e);
                    continue;
                }
            };

            let key = &pending.endpoint.key;
            let joined = match (pending.role, &entry) {
                (Role::Signal, Entry::Object(object)) => {
                    dispatch.join_signal(&pending.channel, object.as_ref(), key)
                }
                (Role::Signal, Entry::Service(service)) => {
                    dispatch.join_signal(&pending.channel, service, key)
                }
                (Role::Slot, Entry::Service(service)) => {
                    dispatch.join_slot(&pending.channel, service, key)
                }
                (Role::Slot, Entry::Object(_)) => {
                    log::error!(
                        "[{}] {}",
                        self.label,
                        RegistryError::WrongKind {
                            id: uid.clone(),
                            expected: "service",
                            found: "object",
                        }
                    );
                    continue;
                }
            };

            match joined {
                Ok(member) => pending.joined = Some((entry.owner_id(), member)),
                Err(e) => log::error!("[{}] {}: {}", self.label, pending.endpoint, e),
            }
        }
    }
}

/// Background task reconciling a [`DeferredSet`] on registry changes
pub(crate) struct DeferredWatcher {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<DeferredSet>,
}

impl DeferredWatcher {
    /// Move `set` into a task driven by `events`
    pub fn spawn(mut set: DeferredSet, mut events: broadcast::Receiver<RegistryEvent>) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.changed() => break,
                    event = events.recv() => match event {
                        Ok(event) if set.watches(event.id()) => set.reconcile().await,
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::debug!("[{}] Missed {} registry event(s)", set.label, skipped);
                            set.reconcile().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            set
        });
        Self { shutdown, task }
    }

    /// Stop watching and hand the set back
    pub async fn stop(self) -> Option<DeferredSet> {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(set) => Some(set),
            Err(e) => {
                log::error!("Deferred watcher failed: {}", e);
                None
            }
        }
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}
