//! Reference-counted data objects

use crate::com::{ArgKind, OwnerId, Signature, SignalSource};
use crate::config::ConfigValue;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Emitted after the object content changed
pub const MODIFIED_SIG: &str = "modified";
/// Emitted with the name of each added field
pub const ADDED_FIELDS_SIG: &str = "added_fields";
/// Emitted with the name of each replaced field
pub const CHANGED_FIELDS_SIG: &str = "changed_fields";
/// Emitted with the name of each removed field
pub const REMOVED_FIELDS_SIG: &str = "removed_fields";

/// Mutable content of a data object
#[derive(Debug, Clone, Default)]
pub struct ObjectState {
    /// Scalar payload; `None` for pure containers
    pub value: Option<ConfigValue>,
    /// Named sub-objects
    pub fields: IndexMap<String, Arc<DataObject>>,
}

/// A data node with an identity, a payload, named fields and signals.
///
/// Access to the content goes through [`DataObject::read`] and
/// [`DataObject::lock`]; the guards release on every exit path.
pub struct DataObject {
    owner: OwnerId,
    id: String,
    type_name: String,
    state: RwLock<ObjectState>,
}

impl DataObject {
    pub fn new(id: impl Into<String>, type_name: impl Into<String>, state: ObjectState) -> Arc<Self> {
        Arc::new(Self {
            owner: OwnerId::next(),
            id: id.into(),
            type_name: type_name.into(),
            state: RwLock::new(state),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Shared access to the content
    pub fn read(&self) -> RwLockReadGuard<'_, ObjectState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exclusive access to the content
    pub fn lock(&self) -> RwLockWriteGuard<'_, ObjectState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn value(&self) -> Option<ConfigValue> {
        self.read().value.clone()
    }

    /// Replace the payload, keeping the kind chosen at creation.
    ///
    /// An integer is accepted by a float object.
    pub fn assign(&self, value: ConfigValue) -> Result<(), DataError> {
        let mut state = self.lock();
        let value = match (&state.value, value) {
            (None, v) => {
                return Err(DataError::NoPayload {
                    id: self.id.clone(),
                    found: v.kind(),
                })
            }
            (Some(ConfigValue::Float(_)), ConfigValue::Int(i)) => ConfigValue::Float(i as f64),
            (Some(current), v) if current.kind() == v.kind() => v,
            (Some(current), v) => {
                return Err(DataError::TypeMismatch {
                    id: self.id.clone(),
                    expected: current.kind(),
                    found: v.kind(),
                })
            }
        };
        state.value = Some(value);
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<Arc<DataObject>> {
        self.read().fields.get(name).cloned()
    }

    /// Set a field, returning the replaced one
    pub fn set_field(&self, name: impl Into<String>, object: Arc<DataObject>) -> Option<Arc<DataObject>> {
        self.lock().fields.insert(name.into(), object)
    }

    pub fn remove_field(&self, name: &str) -> Option<Arc<DataObject>> {
        self.lock().fields.shift_remove(name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.read().fields.keys().cloned().collect()
    }

    /// Copy the payload into a new object, sharing the field objects
    pub fn shallow_copy(&self, id: impl Into<String>) -> Arc<DataObject> {
        let state = self.read().clone();
        DataObject::new(id, self.type_name.clone(), state)
    }

    /// Copy the payload and, recursively, every field into new objects.
    ///
    /// Fields of the copy are named `<id>.<field>`. A field reached twice is
    /// copied once, so shared sub-objects stay shared and cycles terminate.
    pub fn deep_copy(&self, id: impl Into<String>) -> Arc<DataObject> {
        let mut cache = DeepCopyCache::new();
        self.deep_copy_with(id.into(), &mut cache)
    }

    /// Deep copy reusing the copies already made in `cache`
    pub fn deep_copy_with(&self, id: String, cache: &mut DeepCopyCache) -> Arc<DataObject> {
        if let Some(copy) = cache.get(&self.owner) {
            return copy.clone();
        }

        let (value, fields) = {
            let state = self.read();
            let fields: Vec<(String, Arc<DataObject>)> = state
                .fields
                .iter()
                .map(|(name, field)| (name.clone(), field.clone()))
                .collect();
            (state.value.clone(), fields)
        };

        let copy = DataObject::new(
            id.clone(),
            self.type_name.clone(),
            ObjectState {
                value,
                ..Default::default()
            },
        );
        cache.insert(self.owner, copy.clone());

        let copied: IndexMap<String, Arc<DataObject>> = fields
            .into_iter()
            .map(|(name, field)| {
                let field_id = format!("{}.{}", id, name);
                (name, field.deep_copy_with(field_id, cache))
            })
            .collect();
        copy.lock().fields = copied;
        copy
    }
}

/// Copies made during one deep copy, keyed by the source object
pub type DeepCopyCache = HashMap<OwnerId, Arc<DataObject>>;

impl SignalSource for DataObject {
    fn owner_id(&self) -> OwnerId {
        self.owner
    }

    fn label(&self) -> &str {
        &self.id
    }

    fn signal_signature(&self, key: &str) -> Option<Signature> {
        match key {
            MODIFIED_SIG => Some(Signature::empty()),
            ADDED_FIELDS_SIG | CHANGED_FIELDS_SIG | REMOVED_FIELDS_SIG => {
                Some(Signature::of(&[ArgKind::String]))
            }
            _ => None,
        }
    }
}

impl fmt::Debug for DataObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataObject")
            .field("id", &self.id)
            .field("type", &self.type_name)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Errors raised by data objects and their factory
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Unknown object type: {0}")]
    UnknownType(String),

    #[error("Object '{id}' holds a {expected} value, cannot assign a {found}")]
    TypeMismatch {
        id: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Object '{id}' has no payload, cannot assign a {found}")]
    NoPayload { id: String, found: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(id: &str, v: i64) -> Arc<DataObject> {
        DataObject::new(
            id,
            "sight::data::integer",
            ObjectState {
                value: Some(ConfigValue::Int(v)),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_assign_keeps_kind() {
        let obj = int("counter", 1);
        obj.assign(ConfigValue::Int(5)).unwrap();
        assert_eq!(obj.value(), Some(ConfigValue::Int(5)));

        let result = obj.assign(ConfigValue::from("five"));
        assert!(matches!(result, Err(DataError::TypeMismatch { .. })));
    }

    #[test]
    fn test_float_accepts_int() {
        let obj = DataObject::new(
            "f",
            "sight::data::float",
            ObjectState {
                value: Some(ConfigValue::Float(0.0)),
                ..Default::default()
            },
        );
        obj.assign(ConfigValue::Int(2)).unwrap();
        assert_eq!(obj.value(), Some(ConfigValue::Float(2.0)));
    }

    #[test]
    fn test_fields() {
        let root = DataObject::new("root", "sight::data::composite", ObjectState::default());
        assert!(root.set_field("a", int("a", 1)).is_none());
        assert!(root.set_field("a", int("a2", 2)).is_some());
        root.set_field("b", int("b", 3));
        assert_eq!(root.field_names(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(root.field("a").unwrap().id(), "a2");
        assert!(root.remove_field("a").is_some());
        assert_eq!(root.field_names(), vec!["b".to_string()]);
    }

    #[test]
    fn test_copies_create_new_identity() {
        let root = DataObject::new("root", "sight::data::composite", ObjectState::default());
        let child = int("child", 4);
        root.set_field("child", child.clone());

        let shallow = root.shallow_copy("shallow");
        assert_eq!(shallow.id(), "shallow");
        assert_ne!(shallow.owner_id(), root.owner_id());
        assert!(Arc::ptr_eq(&shallow.field("child").unwrap(), &child));

        let deep = root.deep_copy("deep");
        let deep_child = deep.field("child").unwrap();
        assert!(!Arc::ptr_eq(&deep_child, &child));
        assert_eq!(deep_child.id(), "deep.child");
        assert_eq!(deep_child.value(), Some(ConfigValue::Int(4)));

        deep_child.assign(ConfigValue::Int(9)).unwrap();
        assert_eq!(child.value(), Some(ConfigValue::Int(4)));
    }

    #[test]
    fn test_declared_signals() {
        let obj = int("x", 0);
        assert_eq!(obj.signal_signature(MODIFIED_SIG), Some(Signature::empty()));
        assert_eq!(
            obj.signal_signature(ADDED_FIELDS_SIG),
            Some(Signature::of(&[ArgKind::String]))
        );
        assert!(obj.signal_signature("nope").is_none());
    }

    #[test]
    fn test_deep_copy_of_cycle_terminates() {
        let root = DataObject::new("root", "sight::data::composite", ObjectState::default());
        root.set_field("me", root.clone());
        root.set_field("n", int("n", 1));

        let copy = root.deep_copy("copy");
        let me = copy.field("me").unwrap();
        assert!(Arc::ptr_eq(&me, &copy));
        assert!(!Arc::ptr_eq(&me, &root));
        assert_eq!(copy.field("n").unwrap().id(), "copy.n");

        copy.remove_field("me");
        root.remove_field("me");
    }

    #[test]
    fn test_deep_copy_keeps_shared_fields_shared() {
        let shared = int("s", 7);
        let a = DataObject::new("a", "sight::data::composite", ObjectState::default());
        let b = DataObject::new("b", "sight::data::composite", ObjectState::default());
        a.set_field("s", shared.clone());
        b.set_field("s", shared.clone());
        let root = DataObject::new("root", "sight::data::composite", ObjectState::default());
        root.set_field("a", a);
        root.set_field("b", b);

        let copy = root.deep_copy("copy");
        let sa = copy.field("a").unwrap().field("s").unwrap();
        let sb = copy.field("b").unwrap().field("s").unwrap();
        assert!(Arc::ptr_eq(&sa, &sb));
        assert!(!Arc::ptr_eq(&sa, &shared));
        assert_eq!(sa.id(), "copy.a.s");
        assert_eq!(sa.value(), Some(ConfigValue::Int(7)));
    }
}
