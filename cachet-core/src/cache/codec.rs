//! Structured encoding: values as field maps
//!
//! A struct is stored as one hash field per struct field. Scalars are written
//! as their JSON text, nested objects and arrays as canonical JSON. The
//! reserved [`TYPE_FIELD`] carries the type name used to rebuild the value
//! when the caller does not name a target type.

use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::shape::{ValueShape, probe};

/// Reserved field holding the type discriminator
pub const TYPE_FIELD: &str = "@type";

/// Value of one field in a structured entry
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Primitive, date or enum, kept as-is
    Scalar(Value),
    /// Nested composite, in canonical JSON text
    Nested(String),
}

impl FieldValue {
    fn from_json(value: Value) -> Self {
        match value {
            Value::Array(_) | Value::Object(_) => FieldValue::Nested(value.to_string()),
            scalar => FieldValue::Scalar(scalar),
        }
    }

    /// Text written to the store
    pub fn to_wire(&self) -> String {
        match self {
            FieldValue::Scalar(value) => value.to_string(),
            FieldValue::Nested(text) => text.clone(),
        }
    }

    /// Parse stored text. Text that is not JSON is kept as a string.
    pub fn from_wire(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(_)) | Ok(Value::Object(_)) => FieldValue::Nested(raw.to_string()),
            Ok(scalar) => FieldValue::Scalar(scalar),
            Err(_) => FieldValue::Scalar(Value::String(raw.to_string())),
        }
    }

    /// The field as a JSON value
    pub fn to_json(&self) -> Option<Value> {
        match self {
            FieldValue::Scalar(value) => Some(value.clone()),
            FieldValue::Nested(text) => serde_json::from_str(text).ok(),
        }
    }
}

/// Ordered field-name to field-value map plus the type discriminator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    fields: Vec<(String, FieldValue)>,
    type_name: Option<String>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field. The discriminator name is rejected.
    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) -> bool {
        let name = name.into();
        if name == TYPE_FIELD {
            return false;
        }
        match self.fields.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name, value)),
        }
        true
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value)
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn set_type_name(&mut self, name: impl Into<String>) {
        self.type_name = Some(name.into());
    }

    /// Number of real fields, not counting the discriminator
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Hash fields to write, discriminator last
    pub fn to_wire(&self) -> Vec<(String, String)> {
        let mut wire: Vec<(String, String)> = self
            .fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_wire()))
            .collect();
        if let Some(type_name) = &self.type_name {
            wire.push((TYPE_FIELD.to_string(), type_name.clone()));
        }
        wire
    }

    /// Rebuild from the hash fields read back from the store
    pub fn from_wire(raw: HashMap<String, String>) -> Self {
        let mut map = FieldMap::new();
        let mut entries: Vec<(String, String)> = raw.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, text) in entries {
            if name == TYPE_FIELD {
                map.type_name = Some(text);
            } else {
                map.fields.push((name, FieldValue::from_wire(&text)));
            }
        }
        map
    }

    /// Fields as a JSON object, discriminator stripped
    pub fn to_json_object(&self) -> Option<Map<String, Value>> {
        self.fields
            .iter()
            .map(|(name, value)| value.to_json().map(|json| (name.clone(), json)))
            .collect()
    }

    /// Fields as plain JSON values; nested text that no longer parses is kept as a string
    pub fn into_values(self) -> HashMap<String, Value> {
        self.fields
            .into_iter()
            .map(|(name, value)| {
                let json = value.to_json().unwrap_or_else(|| Value::String(value.to_wire()));
                (name, json)
            })
            .collect()
    }
}

type Factory = Arc<dyn Fn(Value) -> Option<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// Type names that structured entries can be rebuilt into
///
/// Populated at startup; lookups by the discriminator stored in each entry.
#[derive(Default)]
pub struct TypeRegistry {
    factories: RwLock<HashMap<String, Factory>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its own type name
    pub fn register<T>(&self)
    where
        T: DeserializeOwned + Any + Send + Sync,
    {
        self.register_as::<T>(type_name::<T>());
    }

    /// Register `T` under another name, e.g. one written by an older build
    pub fn register_as<T>(&self, name: impl Into<String>)
    where
        T: DeserializeOwned + Any + Send + Sync,
    {
        let name = name.into();
        debug!("Registering structured type {}", name);
        let factory: Factory = Arc::new(|value: Value| {
            serde_json::from_value::<T>(value)
                .ok()
                .map(|typed| Box::new(typed) as Box<dyn Any + Send + Sync>)
        });
        self.factories.write().insert(name, factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.factories.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn build(&self, name: &str, value: Value) -> Option<Box<dyn Any + Send + Sync>> {
        let factory = self.factories.read().get(name).cloned()?;
        factory(value)
    }
}

/// A value rebuilt through the [`TypeRegistry`]
pub struct TypedValue {
    type_name: String,
    value: Box<dyn Any + Send + Sync>,
}

impl TypedValue {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take the value out as `T`, or get `self` back if it is something else
    pub fn downcast<T: Any>(self) -> std::result::Result<T, Self> {
        if self.value.is::<T>() {
            match self.value.downcast::<T>() {
                Ok(value) => Ok(*value),
                Err(value) => Err(Self {
                    type_name: self.type_name,
                    value,
                }),
            }
        } else {
            Err(self)
        }
    }
}

impl fmt::Debug for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedValue")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Converts composite values to and from field maps
#[derive(Clone, Default)]
pub struct StructuralCodec {
    registry: Arc<TypeRegistry>,
}

impl StructuralCodec {
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Flatten a struct into a field map tagged with its type name.
    ///
    /// `None` for anything that is not a struct, for serialization failures,
    /// and for structs that have a field named like the discriminator.
    pub fn to_field_map<T: Serialize + ?Sized>(value: &T) -> Option<FieldMap> {
        if !matches!(probe(value), Ok(ValueShape::Composite { .. })) {
            return None;
        }

        let object = match serde_json::to_value(value) {
            Ok(Value::Object(object)) => object,
            Ok(_) => return None,
            Err(e) => {
                debug!("Field map conversion failed for {}: {}", type_name::<T>(), e);
                return None;
            }
        };

        if object.contains_key(TYPE_FIELD) {
            debug!(
                "{} has a field named {}, cannot flatten",
                type_name::<T>(),
                TYPE_FIELD
            );
            return None;
        }

        let mut map = FieldMap::new();
        for (name, value) in object {
            map.fields.push((name, FieldValue::from_json(value)));
        }
        map.type_name = Some(type_name::<T>().to_string());
        Some(map)
    }

    /// Rebuild a value of a known type. The discriminator is ignored.
    pub fn from_field_map<T: DeserializeOwned>(map: &FieldMap) -> Option<T> {
        let object = map.to_json_object()?;
        serde_json::from_value(Value::Object(object)).ok()
    }

    /// Rebuild a value through the registry using the stored discriminator
    pub fn reconstruct(&self, map: &FieldMap) -> Option<TypedValue> {
        let type_name = map.type_name()?;
        let object = map.to_json_object()?;
        let value = self.registry.build(type_name, Value::Object(object))?;
        Some(TypedValue {
            type_name: type_name.to_string(),
            value,
        })
    }
}
