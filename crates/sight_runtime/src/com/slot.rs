//! Slot endpoints and the traits owners implement to expose signals and slots

use crate::com::{Arg, OwnerId, Signature};
use crate::runtime::Worker;
use futures::future::BoxFuture;
use std::fmt;
use std::sync::Arc;

/// Error raised by a slot body
pub type SlotError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by a slot invocation
pub type SlotFuture = BoxFuture<'static, Result<(), SlotError>>;

type Handler = Arc<dyn Fn(Vec<Arg>) -> SlotFuture + Send + Sync>;
type Gate = Arc<dyn Fn() -> bool + Send + Sync>;

/// A callable endpoint bound to the worker of its owner
#[derive(Clone)]
pub struct Slot {
    key: Arc<str>,
    signature: Signature,
    worker: Worker,
    handler: Handler,
    gate: Option<Gate>,
}

impl Slot {
    pub fn new<F>(key: &str, signature: Signature, worker: Worker, handler: F) -> Self
    where
        F: Fn(Vec<Arg>) -> SlotFuture + Send + Sync + 'static,
    {
        Self {
            key: Arc::from(key),
            signature,
            worker,
            handler: Arc::new(handler),
            gate: None,
        }
    }

    /// Only queue deliveries while `gate` returns true
    pub fn with_gate<G>(mut self, gate: G) -> Self
    where
        G: Fn() -> bool + Send + Sync + 'static,
    {
        self.gate = Some(Arc::new(gate));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Worker the slot is queued to on asynchronous delivery
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Whether the owner currently accepts new deliveries
    pub fn is_accepting(&self) -> bool {
        self.gate.as_ref().map(|gate| gate()).unwrap_or(true)
    }

    /// Run the slot body with its own arguments.
    ///
    /// Extra trailing arguments are dropped.
    pub fn invoke(&self, mut args: Vec<Arg>) -> SlotFuture {
        args.truncate(self.signature.arity());
        (self.handler)(args)
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("key", &self.key)
            .field("signature", &self.signature)
            .field("worker", &self.worker.name())
            .finish()
    }
}

/// An owner of named signals
pub trait SignalSource: Send + Sync {
    fn owner_id(&self) -> OwnerId;

    /// Human readable name used in logs and errors
    fn label(&self) -> &str;

    /// Signature of a declared signal
    fn signal_signature(&self, key: &str) -> Option<Signature>;
}

/// An owner of named slots
pub trait SlotTarget: Send + Sync {
    fn owner_id(&self) -> OwnerId;

    fn label(&self) -> &str;

    /// Build the slot endpoint for `key`
    fn slot(&self, key: &str) -> Option<Slot>;
}
