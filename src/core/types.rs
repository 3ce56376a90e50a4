use super::{DbError, Result, DataType, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Schema version stored with a file. Only ever moves forward.
pub type SchemaVersion = u64;

/// A committed state of a file.
///
/// Versions of one file form a total order; every commit is assigned a
/// version strictly greater than all versions committed before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Version(pub u64);

impl Version {
    /// The state of a file that has never been committed to.
    pub const ZERO: Version = Version(0);

    pub fn next(self) -> Version {
        Version(self.0 + 1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifier of a stored object, unique within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a single-owner execution context (a thread, or a task that
/// enters a context explicitly).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx_{}", self.0)
    }
}

/// Identity of a database handle within this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle_{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub default: Option<Value>,
}

impl Property {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Value a fresh object gets for this property when none was supplied.
    ///
    /// `None` means the property stays unset, which is only legal for
    /// nullable properties.
    pub fn initial_value(&self) -> Option<Value> {
        match &self.default {
            Some(value) => Some(value.clone()),
            None if self.nullable => Some(Value::Null),
            None => None,
        }
    }

    pub fn validate(&self, value: &Value) -> Result<()> {
        if matches!(value, Value::Null) {
            if !self.nullable {
                return Err(DbError::ConstraintViolation(format!(
                    "Property '{}' cannot be NULL",
                    self.name
                )));
            }
            return Ok(());
        }

        if !self.data_type.is_compatible(value) {
            return Err(DbError::TypeMismatch(format!(
                "Property '{}' expects type {}, got {}",
                self.name,
                self.data_type,
                value.type_name()
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSchema {
    name: String,
    properties: Vec<Property>,
}

impl ClassSchema {
    pub fn new(name: impl Into<String>, properties: Vec<Property>) -> Self {
        Self {
            name: name.into(),
            properties,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }
}

/// Object-shape definitions of a file.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    classes: BTreeMap<String, ClassSchema>,
}

impl Schema {
    pub fn new(classes: Vec<ClassSchema>) -> Self {
        Self {
            classes: classes
                .into_iter()
                .map(|class| (class.name.clone(), class))
                .collect(),
        }
    }

    pub fn with_class(mut self, class: ClassSchema) -> Self {
        self.classes.insert(class.name.clone(), class);
        self
    }

    pub fn class(&self, name: &str) -> Option<&ClassSchema> {
        self.classes.get(name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &ClassSchema> {
        self.classes.values()
    }

    pub fn class_names(&self) -> Vec<&str> {
        self.classes.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// A stored object: its class, id, and the properties that are set.
///
/// A property missing from `properties` is unset; that state only exists
/// transiently during a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub class: String,
    pub id: ObjectId,
    pub properties: BTreeMap<String, Value>,
}

impl Object {
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.properties.get(property)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_value_rules() {
        let with_default = Property::new("age", DataType::Integer).not_null().with_default(0i64);
        let nullable = Property::new("nick", DataType::Text);
        let required = Property::new("name", DataType::Text).not_null();

        assert_eq!(with_default.initial_value(), Some(Value::Integer(0)));
        assert_eq!(nullable.initial_value(), Some(Value::Null));
        assert_eq!(required.initial_value(), None);
    }

    #[test]
    fn test_property_validation() {
        let required = Property::new("name", DataType::Text).not_null();
        assert!(required.validate(&Value::from("Ann")).is_ok());
        assert!(matches!(
            required.validate(&Value::Null),
            Err(DbError::ConstraintViolation(_))
        ));
        assert!(matches!(
            required.validate(&Value::Integer(3)),
            Err(DbError::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_schema_equality_ignores_declaration_order() {
        let a = ClassSchema::new("A", vec![]);
        let b = ClassSchema::new("B", vec![]);
        assert_eq!(
            Schema::new(vec![a.clone(), b.clone()]),
            Schema::new(vec![b, a])
        );
    }

    #[test]
    fn test_versions_are_ordered() {
        assert!(Version::ZERO < Version::ZERO.next());
        assert_eq!(Version(4).next(), Version(5));
        assert_eq!(Version(7).to_string(), "v7");
    }
}
