//! Service handles: the lifecycle state machine around a [`Service`]

use crate::com::{Arg, Connection, OwnerId, Signature, SignalSource, Slot, SlotError, SlotTarget};
use crate::config::ConfigTree;
use crate::runtime::{RegistryError, Runtime, Worker};
use crate::service::{
    Access, Binding, LifecycleError, Service, ServiceContext, ServiceError, ServiceState,
    START_SLOT, STARTED_SIG, STOPPED_SIG, STOP_SLOT, UPDATED_SIG, UPDATE_SLOT,
};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Options applied when a service is created
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Named worker to run on; the runtime's default worker otherwise
    pub worker: Option<String>,
    /// Wire bound inputs to the service slots while started
    pub auto_connect: bool,
    pub bindings: Vec<Binding>,
}

struct ServiceCell {
    type_name: String,
    me: Weak<ServiceCell>,
    ctx: ServiceContext,
    service: tokio::sync::Mutex<Box<dyn Service>>,
    state: Mutex<ServiceState>,
    config: Mutex<ConfigTree>,
    auto_connect: bool,
    auto_pairs: Vec<(&'static str, &'static str)>,
    slots: HashMap<String, Signature>,
}

/// Shared handle to a live service.
///
/// Lifecycle operations are queued to the service worker as soon as they
/// are called; the returned future resolves once the operation completed.
#[derive(Clone)]
pub struct ServiceHandle {
    cell: Arc<ServiceCell>,
}

impl ServiceHandle {
    pub fn new(
        type_name: &str,
        id: &str,
        service: Box<dyn Service>,
        runtime: Runtime,
        options: ServiceOptions,
    ) -> Self {
        let worker = match &options.worker {
            Some(name) => runtime.workers().get_or_spawn(name),
            None => runtime.workers().default_worker(),
        };
        let slots = service
            .slots()
            .into_iter()
            .map(|(key, signature)| (key.to_string(), signature))
            .collect();
        let auto_pairs = service.auto_connections();
        let ctx = ServiceContext::new(
            id.to_string(),
            runtime,
            worker,
            options.bindings,
            service.signals(),
        );

        let cell = Arc::new_cyclic(|me| ServiceCell {
            type_name: type_name.to_string(),
            me: me.clone(),
            ctx,
            service: tokio::sync::Mutex::new(service),
            state: Mutex::new(ServiceState::Created),
            config: Mutex::new(ConfigTree::Null),
            auto_connect: options.auto_connect,
            auto_pairs,
            slots,
        });

        log::debug!("[{}] Created {}", id, type_name);
        Self { cell }
    }

    pub fn id(&self) -> &str {
        self.cell.ctx.id()
    }

    pub fn type_name(&self) -> &str {
        &self.cell.type_name
    }

    pub fn state(&self) -> ServiceState {
        self.cell.state()
    }

    pub fn worker(&self) -> &Worker {
        self.cell.ctx.worker()
    }

    pub fn context(&self) -> &ServiceContext {
        &self.cell.ctx
    }

    pub fn is_auto_connect(&self) -> bool {
        self.cell.auto_connect
    }

    /// Configuration applied by the last successful configure
    pub fn config(&self) -> ConfigTree {
        self.cell.config()
    }

    /// Whether both handles refer to the same service instance
    pub fn ptr_eq(&self, other: &ServiceHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Apply a configuration. Valid from created, configured or stopped.
    pub fn configure(
        &self,
        config: ConfigTree,
    ) -> impl Future<Output = Result<(), LifecycleError>> + Send + 'static {
        self.submit(move |cell| async move { cell.do_configure(Some(config)).await })
    }

    /// Valid from configured only
    pub fn start(&self) -> impl Future<Output = Result<(), LifecycleError>> + Send + 'static {
        self.submit(|cell| async move { cell.do_start().await })
    }

    /// Run the primary computation. Valid from started only.
    pub fn update(&self) -> impl Future<Output = Result<(), LifecycleError>> + Send + 'static {
        self.submit(|cell| async move { cell.do_update().await })
    }

    /// Valid from started; a no-op on a stopped service
    pub fn stop(&self) -> impl Future<Output = Result<(), LifecycleError>> + Send + 'static {
        self.submit(|cell| async move { cell.do_stop().await })
    }

    /// Reconfigure with the stored configuration, then start. Valid from stopped only.
    pub fn restart(&self) -> impl Future<Output = Result<(), LifecycleError>> + Send + 'static {
        self.submit(|cell| async move { cell.do_restart().await })
    }

    /// Withdraw outputs and enter the terminal state.
    ///
    /// Fails while connections to the service are still live.
    pub fn destroy(&self) -> impl Future<Output = Result<(), LifecycleError>> + Send + 'static {
        self.submit(|cell| async move { cell.do_destroy().await })
    }

    fn submit<F, Fut>(&self, op: F) -> impl Future<Output = Result<(), LifecycleError>> + Send + 'static
    where
        F: FnOnce(Arc<ServiceCell>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), LifecycleError>> + Send + 'static,
    {
        let cell = self.cell.clone();
        let pending = self.cell.ctx.worker().submit(move || op(cell));
        async move { pending.await.unwrap_or_else(|e| Err(e.into())) }
    }
}

impl ServiceCell {
    fn id(&self) -> &str {
        self.ctx.id()
    }

    fn state(&self) -> ServiceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ServiceState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        log::debug!("[{}] {}", self.id(), state);
    }

    fn config(&self) -> ConfigTree {
        self.config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn invalid(&self, operation: &'static str, state: ServiceState) -> LifecycleError {
        LifecycleError::InvalidState {
            id: self.id().to_string(),
            operation,
            state,
        }
    }

    fn failed(&self, operation: &'static str, source: ServiceError) -> LifecycleError {
        LifecycleError::Failed {
            id: self.id().to_string(),
            operation,
            source,
        }
    }

    fn notify(&self, signal: &str) {
        if let Err(e) = self
            .ctx
            .runtime()
            .dispatch()
            .async_emit(&self.ctx, signal, Vec::new())
        {
            log::warn!("[{}] Could not emit '{}': {}", self.id(), signal, e);
        }
    }

    async fn do_configure(&self, config: Option<ConfigTree>) -> Result<(), LifecycleError> {
        let mut service = self.service.lock().await;
        let state = self.state();
        if !matches!(
            state,
            ServiceState::Created | ServiceState::Configured | ServiceState::Stopped
        ) {
            return Err(self.invalid("configure", state));
        }

        let config = config.unwrap_or_else(|| self.config());
        service
            .configuring(&self.ctx, &config)
            .await
            .map_err(|e| self.failed("configure", e))?;

        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
        self.set_state(ServiceState::Configured);
        Ok(())
    }

    async fn do_start(&self) -> Result<(), LifecycleError> {
        let mut service = self.service.lock().await;
        let state = self.state();
        if state != ServiceState::Configured {
            return Err(self.invalid("start", state));
        }

        let connections = if self.auto_connect {
            self.connect_inputs().map_err(|e| self.failed("start", e))?
        } else {
            Vec::new()
        };

        if let Err(e) = service.starting(&self.ctx).await {
            self.disconnect_all(&connections);
            return Err(self.failed("start", e));
        }

        self.ctx.set_auto_connections(connections);
        self.set_state(ServiceState::Started);
        drop(service);
        self.notify(STARTED_SIG);
        Ok(())
    }

    async fn do_update(&self) -> Result<(), LifecycleError> {
        let mut service = self.service.lock().await;
        let state = self.state();
        if state != ServiceState::Started {
            return Err(self.invalid("update", state));
        }

        service
            .updating(&self.ctx)
            .await
            .map_err(|e| self.failed("update", e))?;
        drop(service);

        log::trace!("[{}] updated", self.id());
        self.notify(UPDATED_SIG);
        Ok(())
    }

    async fn do_stop(&self) -> Result<(), LifecycleError> {
        let mut service = self.service.lock().await;
        let state = self.state();
        match state {
            ServiceState::Started => {}
            ServiceState::Stopped => return Ok(()),
            _ => return Err(self.invalid("stop", state)),
        }

        service
            .stopping(&self.ctx)
            .await
            .map_err(|e| self.failed("stop", e))?;

        let connections = self.ctx.take_auto_connections();
        self.disconnect_all(&connections);
        self.set_state(ServiceState::Stopped);
        drop(service);
        self.notify(STOPPED_SIG);
        Ok(())
    }

    async fn do_restart(&self) -> Result<(), LifecycleError> {
        let state = self.state();
        if state != ServiceState::Stopped {
            return Err(self.invalid("restart", state));
        }
        self.do_configure(None).await?;
        self.do_start().await
    }

    async fn do_destroy(&self) -> Result<(), LifecycleError> {
        let _service = self.service.lock().await;
        let state = self.state();
        if !matches!(
            state,
            ServiceState::Created | ServiceState::Configured | ServiceState::Stopped
        ) {
            return Err(self.invalid("destroy", state));
        }

        let count = self
            .ctx
            .runtime()
            .dispatch()
            .connection_count(self.ctx.owner_id());
        if count > 0 {
            return Err(LifecycleError::DanglingConnections {
                id: self.id().to_string(),
                count,
            });
        }

        self.ctx.clear_outputs();
        self.set_state(ServiceState::Destroyed);
        Ok(())
    }

    async fn do_call(&self, key: &str, args: Vec<Arg>) -> Result<(), LifecycleError> {
        let mut service = self.service.lock().await;
        let state = self.state();
        if state != ServiceState::Started {
            return Err(self.invalid("call a slot", state));
        }
        service
            .call_slot(&self.ctx, key, args)
            .await
            .map_err(|e| self.failed("slot", e))
    }

    async fn run_slot(&self, key: &str, args: Vec<Arg>) -> Result<(), LifecycleError> {
        match key {
            START_SLOT => self.do_start().await,
            STOP_SLOT => self.do_stop().await,
            UPDATE_SLOT => self.do_update().await,
            _ => self.do_call(key, args).await,
        }
    }

    /// Wire the auto-connect pairs for every bound input object
    fn connect_inputs(&self) -> Result<Vec<Connection>, ServiceError> {
        let dispatch = self.ctx.runtime().dispatch();
        let registry = self.ctx.runtime().registry();
        let mut connections = Vec::new();

        for binding in self.ctx.bindings() {
            if binding.access == Access::Out {
                continue;
            }
            for uid in &binding.uids {
                let object = match registry.get_object(uid) {
                    Ok(object) => object,
                    Err(RegistryError::NotFound(_)) if binding.optional => continue,
                    Err(e) => {
                        self.disconnect_all(&connections);
                        return Err(e.into());
                    }
                };
                for (signal, slot) in &self.auto_pairs {
                    match dispatch.connect(&*object, signal, self, slot) {
                        Ok(connection) => connections.push(connection),
                        Err(e) => {
                            self.disconnect_all(&connections);
                            return Err(e.into());
                        }
                    }
                }
            }
        }

        Ok(connections)
    }

    fn disconnect_all(&self, connections: &[Connection]) {
        let dispatch = self.ctx.runtime().dispatch();
        for connection in connections {
            dispatch.disconnect(connection);
        }
    }

    fn accepts(&self, key: &str) -> bool {
        let state = self.state();
        if key == START_SLOT {
            state == ServiceState::Configured
        } else {
            state == ServiceState::Started
        }
    }
}

impl SlotTarget for ServiceCell {
    fn owner_id(&self) -> OwnerId {
        self.ctx.owner_id()
    }

    fn label(&self) -> &str {
        self.id()
    }

    fn slot(&self, key: &str) -> Option<Slot> {
        let signature = match key {
            START_SLOT | STOP_SLOT | UPDATE_SLOT => Signature::empty(),
            _ => self.slots.get(key)?.clone(),
        };

        let handler_cell = self.me.clone();
        let gate_cell = self.me.clone();
        let handler_key = key.to_string();
        let gate_key = key.to_string();

        let slot = Slot::new(key, signature, self.ctx.worker().clone(), move |args| {
            let cell = handler_cell.clone();
            let key = handler_key.clone();
            async move {
                let Some(cell) = cell.upgrade() else {
                    return Err(SlotError::from(format!("service behind slot '{}' is gone", key)));
                };
                cell.run_slot(&key, args).await.map_err(SlotError::from)
            }
            .boxed()
        })
        .with_gate(move || {
            gate_cell
                .upgrade()
                .map(|cell| cell.accepts(&gate_key))
                .unwrap_or(false)
        });

        Some(slot)
    }
}

impl SignalSource for ServiceHandle {
    fn owner_id(&self) -> OwnerId {
        self.cell.ctx.owner_id()
    }

    fn label(&self) -> &str {
        self.id()
    }

    fn signal_signature(&self, key: &str) -> Option<Signature> {
        self.cell.ctx.signal_signature(key)
    }
}

impl SlotTarget for ServiceHandle {
    fn owner_id(&self) -> OwnerId {
        self.cell.ctx.owner_id()
    }

    fn label(&self) -> &str {
        self.id()
    }

    fn slot(&self, key: &str) -> Option<Slot> {
        self.cell.slot(key)
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.id())
            .field("type", &self.type_name())
            .field("state", &self.state())
            .finish()
    }
}
