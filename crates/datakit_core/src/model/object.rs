//! Managed object record.
//!
//! # Responsibility
//! - Define the value shape shared by every context and the store.
//! - Provide typed attribute accessors.
//!
//! # Invariants
//! - `id` is stable and never reused for another object.
//! - `version` mirrors the persisted row version; `0` means never persisted.

use super::schema::AttributeType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier of one managed object across all contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }

}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attribute payload. Unset attributes are absent from the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    Text(String),
    Integer(i64),
    Double(f64),
    Boolean(bool),
}

impl AttributeValue {
    pub fn kind(&self) -> AttributeType {
        match self {
            Self::Text(_) => AttributeType::Text,
            Self::Integer(_) => AttributeType::Integer,
            Self::Double(_) => AttributeType::Double,
            Self::Boolean(_) => AttributeType::Boolean,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// `false` for NaN and infinite doubles, which JSON cannot represent.
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Double(value) => value.is_finite(),
            _ => true,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// Snapshot of one object as seen by a context or the store.
///
/// Values are plain data; handing one to another context never shares
/// state, it has to be re-materialized there by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagedObject {
    id: ObjectId,
    entity: String,
    attributes: BTreeMap<String, AttributeValue>,
    version: u64,
}

impl ManagedObject {
    /// Creates an unsaved object with a generated id.
    pub fn new(entity: impl Into<String>) -> Self {
        Self::with_id(ObjectId::new(), entity)
    }

    pub fn with_id(id: ObjectId, entity: impl Into<String>) -> Self {
        Self {
            id,
            entity: entity.into(),
            attributes: BTreeMap::new(),
            version: 0,
        }
    }

    pub(crate) fn from_parts(
        id: ObjectId,
        entity: String,
        attributes: BTreeMap<String, AttributeValue>,
        version: u64,
    ) -> Self {
        Self {
            id,
            entity,
            attributes,
            version,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn attributes(&self) -> &BTreeMap<String, AttributeValue> {
        &self.attributes
    }

    pub fn get(&self, attribute: &str) -> Option<&AttributeValue> {
        self.attributes.get(attribute)
    }

    /// Shorthand for text attributes.
    pub fn text(&self, attribute: &str) -> Option<&str> {
        self.get(attribute).and_then(AttributeValue::as_text)
    }

    pub fn set(&mut self, attribute: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(attribute.into(), value);
    }

    pub fn unset(&mut self, attribute: &str) -> Option<AttributeValue> {
        self.attributes.remove(attribute)
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    pub(crate) fn attributes_mut(&mut self) -> &mut BTreeMap<String, AttributeValue> {
        &mut self.attributes
    }
}
