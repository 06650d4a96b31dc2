//! Object factory: creates data objects by type name

use crate::config::ConfigValue;
use crate::data::{DataError, DataObject, ObjectState};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

pub const BOOLEAN_TYPE: &str = "sight::data::boolean";
pub const INTEGER_TYPE: &str = "sight::data::integer";
pub const FLOAT_TYPE: &str = "sight::data::float";
pub const STRING_TYPE: &str = "sight::data::string";
pub const COMPOSITE_TYPE: &str = "sight::data::composite";

/// Builds the initial content of a new object
type Constructor = Arc<dyn Fn() -> ObjectState + Send + Sync>;

/// Table of object constructors keyed by type name
pub struct ObjectFactory {
    constructors: RwLock<HashMap<String, Constructor>>,
}

impl ObjectFactory {
    /// Empty factory
    pub fn new() -> Self {
        Self {
            constructors: RwLock::new(HashMap::new()),
        }
    }

    /// Factory knowing the built-in value and composite types
    pub fn with_builtins() -> Self {
        let factory = Self::new();
        factory.register(BOOLEAN_TYPE, || scalar(ConfigValue::Bool(false)));
        factory.register(INTEGER_TYPE, || scalar(ConfigValue::Int(0)));
        factory.register(FLOAT_TYPE, || scalar(ConfigValue::Float(0.0)));
        factory.register(STRING_TYPE, || scalar(ConfigValue::String(String::new())));
        factory.register(COMPOSITE_TYPE, ObjectState::default);
        factory
    }

    /// Register or replace the constructor of `type_name`
    pub fn register<F>(&self, type_name: &str, constructor: F)
    where
        F: Fn() -> ObjectState + Send + Sync + 'static,
    {
        self.constructors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(type_name.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(type_name)
    }

    /// Create an object of `type_name`, optionally assigning an initial value
    pub fn create(
        &self,
        type_name: &str,
        id: &str,
        value: Option<ConfigValue>,
    ) -> Result<Arc<DataObject>, DataError> {
        let constructor = self
            .constructors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_name)
            .cloned()
            .ok_or_else(|| DataError::UnknownType(type_name.to_string()))?;

        let object = DataObject::new(id, type_name, constructor());
        if let Some(value) = value {
            object.assign(value)?;
        }
        Ok(object)
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

impl Default for ObjectFactory {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn scalar(value: ConfigValue) -> ObjectState {
    ObjectState {
        value: Some(value),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_types() {
        let factory = ObjectFactory::with_builtins();
        assert_eq!(factory.types().len(), 5);

        let obj = factory.create(INTEGER_TYPE, "count", None).unwrap();
        assert_eq!(obj.id(), "count");
        assert_eq!(obj.type_name(), INTEGER_TYPE);
        assert_eq!(obj.value(), Some(ConfigValue::Int(0)));

        let obj = factory
            .create(STRING_TYPE, "key", Some(ConfigValue::from("A")))
            .unwrap();
        assert_eq!(obj.value(), Some(ConfigValue::from("A")));
    }

    #[test]
    fn test_unknown_type() {
        let factory = ObjectFactory::with_builtins();
        let result = factory.create("sight::data::image", "img", None);
        assert!(matches!(result, Err(DataError::UnknownType(t)) if t == "sight::data::image"));
    }

    #[test]
    fn test_initial_value_must_match() {
        let factory = ObjectFactory::with_builtins();
        assert!(factory
            .create(BOOLEAN_TYPE, "flag", Some(ConfigValue::Int(3)))
            .is_err());
        assert!(factory
            .create(COMPOSITE_TYPE, "map", Some(ConfigValue::Int(3)))
            .is_err());
    }

    #[test]
    fn test_each_create_is_a_new_object() {
        let factory = ObjectFactory::with_builtins();
        let a = factory.create(FLOAT_TYPE, "x", None).unwrap();
        let b = factory.create(FLOAT_TYPE, "x", None).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_custom_type() {
        let factory = ObjectFactory::new();
        factory.register("demo::threshold", || scalar(ConfigValue::Float(0.5)));
        let obj = factory.create("demo::threshold", "t", None).unwrap();
        assert_eq!(obj.value(), Some(ConfigValue::Float(0.5)));
    }
}
