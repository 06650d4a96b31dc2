//! Config launcher: runs one configuration at a time and switches between them

use crate::app::{AppInstance, GraphError};
use crate::com::{ArgKind, DispatchError, OwnerId, Signature, Slot, SlotError, SlotTarget};
use crate::config::{unique_identifier, ConfigError, FieldAdaptor};
use crate::data::DataObject;
use crate::runtime::{RegistryError, Runtime, Worker};
use crate::service::{LifecycleError, ServiceHandle};
use futures::FutureExt;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

pub const SET_CONFIG_SLOT: &str = "set_config";
pub const LAUNCHER_UPDATE_SLOT: &str = "update";

type SurvivalPredicate = Arc<dyn Fn(&str, &DataObject) -> bool + Send + Sync>;

/// Decides which objects created by a configuration outlive a switch.
///
/// The predicate receives the uid as declared in the template and the
/// object. A survivor is reused by the next configuration declaring the same
/// uid; otherwise it is released at the following switch.
#[derive(Clone, Default)]
pub struct SurvivalPolicy {
    predicate: Option<SurvivalPredicate>,
}

impl SurvivalPolicy {
    /// Nothing survives
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_fn<F>(predicate: F) -> Self
    where
        F: Fn(&str, &DataObject) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Some(Arc::new(predicate)),
        }
    }

    /// Objects declared under one of `uids` survive
    pub fn keep_uids(uids: &[&str]) -> Self {
        let uids: Vec<String> = uids.iter().map(|u| u.to_string()).collect();
        Self::from_fn(move |uid, _| uids.iter().any(|u| u == uid))
    }

    pub fn survives(&self, uid: &str, object: &DataObject) -> bool {
        self.predicate
            .as_ref()
            .map(|predicate| predicate(uid, object))
            .unwrap_or(false)
    }
}

impl fmt::Debug for SurvivalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurvivalPolicy")
            .field("custom", &self.predicate.is_some())
            .finish()
    }
}

/// Launcher configuration
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Prefix every identifier with a fresh instance id on each build
    pub auto_prefix: bool,
    /// Field adaptors applied to every configuration
    pub fields: FieldAdaptor,
    /// Key value → configuration id; unmapped keys are used as ids
    pub key_map: IndexMap<String, String>,
    pub survival: SurvivalPolicy,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            auto_prefix: true,
            fields: FieldAdaptor::new(),
            key_map: IndexMap::new(),
            survival: SurvivalPolicy::none(),
        }
    }
}

/// Launcher state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LauncherState {
    Idle,
    Running(String),
}

#[derive(Default)]
struct Session {
    selected: Option<String>,
    running: Option<AppInstance>,
    survivors: HashMap<String, Arc<DataObject>>,
}

struct LauncherInner {
    id: String,
    owner: OwnerId,
    runtime: Runtime,
    config: LauncherConfig,
    worker: Worker,
    state: Mutex<LauncherState>,
    session: tokio::sync::Mutex<Session>,
}

/// Builds the graph of the selected configuration and swaps it for another
/// on request.
///
/// A switch always tears the running graph down completely before the next
/// one is built.
#[derive(Clone)]
pub struct ConfigLauncher {
    inner: Arc<LauncherInner>,
}

impl ConfigLauncher {
    /// Must be called inside a tokio runtime
    pub fn new(runtime: Runtime, config: LauncherConfig) -> Self {
        let id = unique_identifier("launcher");
        let worker = Worker::spawn(&id);
        Self {
            inner: Arc::new(LauncherInner {
                owner: OwnerId::next(),
                worker,
                id,
                runtime,
                config,
                state: Mutex::new(LauncherState::Idle),
                session: tokio::sync::Mutex::new(Session::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> LauncherState {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), LauncherState::Running(_))
    }

    /// Configuration the next build uses
    pub async fn selected(&self) -> Option<String> {
        self.inner.session.lock().await.selected.clone()
    }

    /// Identifier `local_uid` of the running configuration is registered under
    pub async fn resolve_uid(&self, local_uid: &str) -> Option<String> {
        let session = self.inner.session.lock().await;
        session
            .running
            .as_ref()
            .map(|instance| instance.resolve_uid(local_uid))
    }

    /// Registered identifier of a service declared as `local_uid` by the running configuration
    pub async fn service_id(&self, local_uid: &str) -> Option<String> {
        let session = self.inner.session.lock().await;
        session
            .running
            .as_ref()
            .and_then(|instance| instance.service(local_uid))
            .map(|service| service.id().to_string())
    }

    pub async fn service(&self, local_uid: &str) -> Option<ServiceHandle> {
        let session = self.inner.session.lock().await;
        session
            .running
            .as_ref()
            .and_then(|instance| instance.service(local_uid))
            .cloned()
    }

    /// Identifiers of the objects kept alive for the next configuration
    pub async fn survivors(&self) -> Vec<String> {
        let mut uids: Vec<String> = self
            .inner
            .session
            .lock()
            .await
            .survivors
            .keys()
            .cloned()
            .collect();
        uids.sort_unstable();
        uids
    }

    /// Select a configuration.
    ///
    /// A launcher running another configuration switches to it right away; an
    /// idle launcher builds it on the next [`ConfigLauncher::update`]. An
    /// unknown id is rejected and changes nothing.
    pub async fn set_config(&self, config_id: &str) -> Result<(), LauncherError> {
        if !self.inner.runtime.configs().contains(config_id) {
            return Err(ConfigError::UnknownConfig(config_id.to_string()).into());
        }

        let mut session = self.inner.session.lock().await;
        session.selected = Some(config_id.to_string());

        match session.running.as_ref().map(|i| i.config_id().to_string()) {
            Some(running) if running == config_id => Ok(()),
            Some(running) => {
                log::info!("[{}] Switching from '{}' to '{}'", self.id(), running, config_id);
                self.teardown(&mut session).await;
                self.build(&mut session).await
            }
            None => Ok(()),
        }
    }

    /// Select the configuration keyed by the string value of `key`
    pub async fn set_config_from_object(&self, key: &DataObject) -> Result<(), LauncherError> {
        let value = key
            .value()
            .ok_or_else(|| LauncherError::InvalidKey(key.id().to_string()))?;
        let config_id = self.config_for_key(&value.as_string());
        self.set_config(&config_id).await
    }

    /// Build the selected configuration if it is not already running
    pub async fn update(&self) -> Result<(), LauncherError> {
        let mut session = self.inner.session.lock().await;
        let selected = session.selected.clone().ok_or(LauncherError::NothingSelected)?;

        match session.running.as_ref().map(|i| i.config_id().to_string()) {
            Some(running) if running == selected => {
                log::debug!("[{}] '{}' already running", self.id(), selected);
                Ok(())
            }
            Some(running) => {
                log::info!("[{}] Switching from '{}' to '{}'", self.id(), running, selected);
                self.teardown(&mut session).await;
                self.build(&mut session).await
            }
            None => self.build(&mut session).await,
        }
    }

    /// Tear the running graph down and release every survivor
    pub async fn stop(&self) {
        let mut session = self.inner.session.lock().await;
        self.teardown(&mut session).await;
        session.survivors.clear();
    }

    fn config_for_key(&self, key: &str) -> String {
        self.inner
            .config
            .key_map
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    fn set_state(&self, state: LauncherState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    async fn build(&self, session: &mut Session) -> Result<(), LauncherError> {
        let config_id = session.selected.clone().ok_or(LauncherError::NothingSelected)?;
        let adapted = self.inner.runtime.configs().get_adapted_config(
            &config_id,
            &self.inner.config.fields,
            self.inner.config.auto_prefix,
        )?;

        let instance =
            AppInstance::build(self.inner.runtime.clone(), &adapted, &session.survivors).await?;

        log::info!(
            "[{}] Running '{}'{}",
            self.id(),
            config_id,
            adapted
                .instance_id
                .as_ref()
                .map(|i| format!(" as {}", i))
                .unwrap_or_default()
        );
        session.running = Some(instance);
        self.set_state(LauncherState::Running(config_id));
        Ok(())
    }

    async fn teardown(&self, session: &mut Session) {
        let Some(mut instance) = session.running.take() else {
            return;
        };

        let survival = &self.inner.config.survival;
        session.survivors = instance
            .objects()
            .iter()
            .filter(|o| o.owned && survival.survives(&o.local_uid, &o.object))
            .map(|o| (o.local_uid.clone(), o.object.clone()))
            .collect();

        instance.teardown().await;
        self.set_state(LauncherState::Idle);
        log::info!("[{}] Stopped '{}'", self.id(), instance.config_id());
    }
}

impl SlotTarget for ConfigLauncher {
    fn owner_id(&self) -> OwnerId {
        self.inner.owner
    }

    fn label(&self) -> &str {
        &self.inner.id
    }

    /// Launcher slots queue the request to the launcher worker and return
    /// at once: a switch stops services, and the emitter may be one of them.
    fn slot(&self, key: &str) -> Option<Slot> {
        let launcher: Weak<LauncherInner> = Arc::downgrade(&self.inner);
        let worker = self.inner.worker.clone();

        match key {
            LAUNCHER_UPDATE_SLOT => Some(Slot::new(key, Signature::empty(), worker, move |_| {
                let launcher = launcher.clone();
                async move {
                    let launcher = ConfigLauncher::upgrade(&launcher)?;
                    let worker = launcher.inner.worker.clone();
                    worker.post(move || async move {
                        if let Err(e) = launcher.update().await {
                            log::error!("[{}] Update failed: {}", launcher.id(), e);
                        }
                    })?;
                    Ok(())
                }
                .boxed()
            })),
            SET_CONFIG_SLOT => Some(Slot::new(
                key,
                Signature::of(&[ArgKind::String]),
                worker,
                move |args| {
                    let launcher = launcher.clone();
                    async move {
                        let launcher = ConfigLauncher::upgrade(&launcher)?;
                        let key = args.first().and_then(|a| a.as_str()).unwrap_or_default();
                        let config_id = launcher.config_for_key(key);
                        if !launcher.inner.runtime.configs().contains(&config_id) {
                            return Err(SlotError::from(LauncherError::from(
                                ConfigError::UnknownConfig(config_id),
                            )));
                        }

                        let worker = launcher.inner.worker.clone();
                        worker.post(move || async move {
                            if let Err(e) = launcher.set_config(&config_id).await {
                                log::error!(
                                    "[{}] Switch to '{}' failed: {}",
                                    launcher.id(),
                                    config_id,
                                    e
                                );
                            }
                        })?;
                        Ok(())
                    }
                    .boxed()
                },
            )),
            _ => None,
        }
    }
}

impl ConfigLauncher {
    fn upgrade(launcher: &Weak<LauncherInner>) -> Result<ConfigLauncher, SlotError> {
        launcher
            .upgrade()
            .map(|inner| ConfigLauncher { inner })
            .ok_or_else(|| SlotError::from("launcher is gone"))
    }
}

impl fmt::Debug for ConfigLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigLauncher")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Errors raised while building or switching configurations
#[derive(Debug, thiserror::Error)]
pub enum LauncherError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No configuration selected")]
    NothingSelected,

    #[error("Key object '{0}' carries no value")]
    InvalidKey(String),

    #[error("Unknown object: {0}")]
    UnknownObject(String),

    #[error("Unknown service type: {0}")]
    UnknownServiceType(String),

    #[error("Unknown object type: {0}")]
    UnknownObjectType(String),

    #[error("Build failed: {0}")]
    Build(String),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Connection error: {0}")]
    Dispatch(#[from] DispatchError),
}
