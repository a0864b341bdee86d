//! Managed object schema model.
//!
//! # Responsibility
//! - Describe entities, their typed attributes and required-ness.
//! - Merge several models into one (the "all known models" default).
//! - Validate attribute values and whole objects against a model.
//!
//! # Invariants
//! - Entity and attribute names are unique inside one model.
//! - `version` is monotonic across releases of the same model.

use super::object::{AttributeValue, ManagedObject, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Storage type of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Text,
    Integer,
    Double,
    Boolean,
}

impl AttributeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::Boolean => "boolean",
        }
    }
}

/// One attribute of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescription {
    pub name: String,
    pub kind: AttributeType,
    /// Optional attributes may stay unset when an object is saved.
    pub optional: bool,
    /// Value assigned on insert and during automigration of existing rows.
    pub default: Option<AttributeValue>,
}

impl AttributeDescription {
    pub fn required(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            optional: true,
            ..Self::required(name, kind)
        }
    }

    pub fn with_default(mut self, value: AttributeValue) -> Self {
        self.default = Some(value);
        self
    }
}

/// A named record type with a fixed attribute set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    pub attributes: BTreeMap<String, AttributeDescription>,
}

impl EntityDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Adds or replaces one attribute.
    pub fn with_attribute(mut self, attribute: AttributeDescription) -> Self {
        self.attributes.insert(attribute.name.clone(), attribute);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.get(name)
    }
}

/// Versioned set of entity descriptions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    pub version: u32,
    pub entities: BTreeMap<String, EntityDescription>,
}

/// Errors raised while building or merging schema models.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// Two merged models define the same entity differently.
    ConflictingEntity(String),
    /// A default that does not match its attribute type or is not finite.
    InvalidDefault { entity: String, attribute: String },
}

impl Display for SchemaError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConflictingEntity(name) => {
                write!(f, "entity `{name}` is defined differently by merged models")
            }
            Self::InvalidDefault { entity, attribute } => {
                write!(f, "attribute `{entity}.{attribute}` has an unusable default")
            }
        }
    }
}

impl Error for SchemaError {}

/// Single failed constraint found while validating pending objects.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    UnknownEntity {
        object: ObjectId,
        entity: String,
    },
    MissingRequired {
        object: ObjectId,
        entity: String,
        attribute: String,
    },
    TypeMismatch {
        object: ObjectId,
        attribute: String,
        expected: AttributeType,
    },
    UnknownAttribute {
        object: ObjectId,
        attribute: String,
    },
    NonFiniteValue {
        object: ObjectId,
        attribute: String,
    },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEntity { object, entity } => {
                write!(f, "object {object} has unknown entity `{entity}`")
            }
            Self::MissingRequired {
                object,
                entity,
                attribute,
            } => write!(
                f,
                "object {object} ({entity}) is missing required attribute `{attribute}`"
            ),
            Self::TypeMismatch {
                object,
                attribute,
                expected,
            } => write!(
                f,
                "object {object} attribute `{attribute}` must be {}",
                expected.as_str()
            ),
            Self::UnknownAttribute { object, attribute } => {
                write!(f, "object {object} has unknown attribute `{attribute}`")
            }
            Self::NonFiniteValue { object, attribute } => {
                write!(f, "object {object} attribute `{attribute}` is not a finite number")
            }
        }
    }
}

impl Error for ValidationError {}

impl Schema {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            entities: BTreeMap::new(),
        }
    }

    /// Adds or replaces one entity.
    pub fn with_entity(mut self, entity: EntityDescription) -> Self {
        self.entities.insert(entity.name.clone(), entity);
        self
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Merges several models into one.
    ///
    /// The merged version is the highest input version. Identical entity
    /// definitions collapse; differing definitions of the same name fail.
    pub fn merged<'a>(models: impl IntoIterator<Item = &'a Schema>) -> Result<Schema, SchemaError> {
        let mut merged = Schema::default();
        for model in models {
            merged.version = merged.version.max(model.version);
            for (name, entity) in &model.entities {
                match merged.entities.get(name) {
                    Some(existing) if existing != entity => {
                        return Err(SchemaError::ConflictingEntity(name.clone()));
                    }
                    Some(_) => {}
                    None => {
                        merged.entities.insert(name.clone(), entity.clone());
                    }
                }
            }
        }
        Ok(merged)
    }

    /// Checks that every default can be stored in its attribute.
    pub fn check_defaults(&self) -> Result<(), SchemaError> {
        for entity in self.entities.values() {
            for attribute in entity.attributes.values() {
                let Some(default) = &attribute.default else {
                    continue;
                };
                if default.kind() != attribute.kind || !default.is_finite() {
                    return Err(SchemaError::InvalidDefault {
                        entity: entity.name.clone(),
                        attribute: attribute.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Checks one object against its entity description.
    ///
    /// Returns every violated constraint, not only the first one.
    pub fn validate_object(&self, object: &ManagedObject) -> Vec<ValidationError> {
        let Some(entity) = self.entity(object.entity()) else {
            return vec![ValidationError::UnknownEntity {
                object: object.id(),
                entity: object.entity().to_string(),
            }];
        };

        let mut errors = Vec::new();
        for (name, value) in object.attributes() {
            match entity.attribute(name) {
                None => errors.push(ValidationError::UnknownAttribute {
                    object: object.id(),
                    attribute: name.clone(),
                }),
                Some(description) if value.kind() != description.kind => {
                    errors.push(ValidationError::TypeMismatch {
                        object: object.id(),
                        attribute: name.clone(),
                        expected: description.kind,
                    })
                }
                Some(_) if !value.is_finite() => errors.push(ValidationError::NonFiniteValue {
                    object: object.id(),
                    attribute: name.clone(),
                }),
                Some(_) => {}
            }
        }
        for description in entity.attributes.values() {
            if !description.optional && object.get(&description.name).is_none() {
                errors.push(ValidationError::MissingRequired {
                    object: object.id(),
                    entity: entity.name.clone(),
                    attribute: description.name.clone(),
                });
            }
        }
        errors
    }
}
