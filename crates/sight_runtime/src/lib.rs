//! Sight Runtime
//!
//! Service and application-configuration runtime: data objects, services
//! with a managed lifecycle, typed signal/slot connections and a launcher
//! that builds and swaps application graphs from declarative configurations.
//!
//! # Overview
//!
//! - [`Registry`] maps identifiers to live objects and services
//! - [`ConfigStore`] holds configuration templates and adapts them with
//!   field values, optionally prefixing every identifier
//! - [`ServiceHandle`] drives a [`Service`] through
//!   `created → configured → started → stopped → destroyed`
//! - [`DispatchCore`] connects object and service signals to service slots,
//!   directly or through named channels
//! - [`ConfigLauncher`] builds the graph of one configuration and switches
//!   to another on request
//!
//! # Example Configuration File
//!
//! ```yaml
//! version: "1.0"
//!
//! configs:
//!   viewer:
//!     group: imaging
//!     parameters:
//!       - name: series
//!       - name: step
//!         default: 1
//!     objects:
//!       - uid: ${series}
//!         src: ref
//!       - uid: count
//!         type: sight::data::integer
//!     services:
//!       - uid: counter
//!         type: sight::service::counter
//!         auto_connect: true
//!         in:
//!           - key: series
//!             uid: ${series}
//!         inout:
//!           - key: counter
//!             uid: count
//!         config:
//!           step: ${step}
//!       - uid: logger
//!         type: sight::service::logger
//!         in:
//!           - key: count
//!             uid: count
//!     connections:
//!       - signals: [counter/computed]
//!         slots: [logger/update]
//!     start: [counter, logger]
//! ```

pub mod app;
pub mod cli;
pub mod com;
pub mod config;
pub mod data;
pub mod runtime;
pub mod service;

pub use app::{
    AppGraph, AppInstance, ConfigLauncher, GraphError, LauncherConfig, LauncherError,
    LauncherState, SurvivalPolicy,
};
pub use cli::LaunchArgs;
pub use com::{
    Arg, ArgKind, BlockGuard, ChannelMember, Connection, DispatchCore, DispatchError, OwnerId,
    Signature, SignalSource, Slot, SlotTarget,
};
pub use config::{
    AdaptedConfig, AppConfigFile, AppConfigFileError, ConfigError, ConfigStore, ConfigTree,
    ConfigValue, FieldAdaptor, SubstitutionContext, SubstitutionError,
};
pub use data::{DataError, DataObject, ObjectFactory};
pub use runtime::{
    Entry, Registry, RegistryError, RegistryEvent, Runtime, RuntimeConfig, Worker, WorkerError,
};
pub use service::{
    Access, Binding, LifecycleError, Service, ServiceContext, ServiceError, ServiceFactory,
    ServiceHandle, ServiceOptions, ServiceState,
};

/// Everything needed to write a service
pub mod prelude {
    pub use crate::com::{Arg, ArgKind, Signature};
    pub use crate::config::{ConfigTree, ConfigValue};
    pub use crate::data::DataObject;
    pub use crate::service::{Service, ServiceContext, ServiceError};
    pub use async_trait::async_trait;
}
