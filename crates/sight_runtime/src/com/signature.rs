//! Endpoint identity, signal arguments and signatures

use crate::config::ConfigValue;
use crate::data::DataObject;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identity of a signal or slot owner.
///
/// Unlike textual ids, an owner id is never reused, so a connection can never
/// reach a later instance that happens to share the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    pub fn next() -> Self {
        OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Type of a single signal/slot argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    Bool,
    Int,
    Float,
    String,
    Object,
}

/// A signal/slot argument value
#[derive(Debug, Clone)]
pub enum Arg {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Object(Arc<DataObject>),
}

impl Arg {
    pub fn kind(&self) -> ArgKind {
        match self {
            Arg::Bool(_) => ArgKind::Bool,
            Arg::Int(_) => ArgKind::Int,
            Arg::Float(_) => ArgKind::Float,
            Arg::String(_) => ArgKind::String,
            Arg::Object(_) => ArgKind::Object,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<DataObject>> {
        match self {
            Arg::Object(o) => Some(o),
            _ => None,
        }
    }
}

impl From<ConfigValue> for Arg {
    fn from(value: ConfigValue) -> Self {
        match value {
            ConfigValue::Bool(b) => Arg::Bool(b),
            ConfigValue::Int(i) => Arg::Int(i),
            ConfigValue::Float(f) => Arg::Float(f),
            ConfigValue::String(s) => Arg::String(s),
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::String(s.to_string())
    }
}

impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Arg::Int(i)
    }
}

impl From<Arc<DataObject>> for Arg {
    fn from(o: Arc<DataObject>) -> Self {
        Arg::Object(o)
    }
}

/// Ordered argument types of a signal or slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature(Vec<ArgKind>);

impl Signature {
    /// Signature without arguments
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn of(kinds: &[ArgKind]) -> Self {
        Self(kinds.to_vec())
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn kinds(&self) -> &[ArgKind] {
        &self.0
    }

    /// Whether `args` match this signature exactly
    pub fn accepts(&self, args: &[Arg]) -> bool {
        args.len() == self.0.len() && args.iter().zip(&self.0).all(|(a, k)| a.kind() == *k)
    }

    /// Whether a slot with this signature can be driven by `signal`.
    ///
    /// The slot must take the leading arguments of the signal, in order;
    /// trailing signal arguments are dropped on delivery.
    pub fn is_callable_from(&self, signal: &Signature) -> bool {
        self.0.len() <= signal.0.len() && signal.0.starts_with(&self.0)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<String> = self.0.iter().map(|k| format!("{:?}", k)).collect();
        write!(f, "({})", kinds.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_ids_are_unique() {
        assert_ne!(OwnerId::next(), OwnerId::next());
    }

    #[test]
    fn test_signature_accepts() {
        let sig = Signature::of(&[ArgKind::Int, ArgKind::String]);
        assert!(sig.accepts(&[Arg::Int(1), Arg::from("a")]));
        assert!(!sig.accepts(&[Arg::Int(1)]));
        assert!(!sig.accepts(&[Arg::from("a"), Arg::Int(1)]));
    }

    #[test]
    fn test_slot_compatibility() {
        let signal = Signature::of(&[ArgKind::Int, ArgKind::String]);
        assert!(Signature::empty().is_callable_from(&signal));
        assert!(Signature::of(&[ArgKind::Int]).is_callable_from(&signal));
        assert!(signal.is_callable_from(&signal));
        assert!(!Signature::of(&[ArgKind::String]).is_callable_from(&signal));
        assert!(!Signature::of(&[ArgKind::Int, ArgKind::String, ArgKind::Bool])
            .is_callable_from(&signal));
    }

    #[test]
    fn test_display() {
        assert_eq!(Signature::of(&[ArgKind::Int]).to_string(), "(Int)");
        assert_eq!(Signature::empty().to_string(), "()");
    }
}
