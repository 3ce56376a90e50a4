use super::Database;
use crate::core::{DbError, Object, ObjectId, ObjectLink, Result, Value};
use crate::facade::shared_file::FileKey;
use std::collections::BTreeMap;
use std::fmt;

/// Property values for a new object.
///
/// Properties left out get their default, or `Null` when nullable.
#[derive(Debug, Clone, Default)]
pub struct ObjectData {
    values: BTreeMap<String, Value>,
    link_origins: Vec<(String, FileKey)>,
}

impl ObjectData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        let property = property.into();
        self.link_origins.retain(|(name, _)| *name != property);
        self.values.insert(property, value.into());
        self
    }

    /// Links `property` to `target`, which must belong to the same file.
    pub fn link(mut self, property: impl Into<String>, target: &ObjectRef) -> Self {
        let property = property.into();
        self.link_origins.retain(|(name, _)| *name != property);
        self.link_origins
            .push((property.clone(), target.db.inner.shared().key().clone()));
        self.values.insert(property, Value::Link(target.link()));
        self
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub(crate) fn into_values(self) -> BTreeMap<String, Value> {
        self.values
    }

    /// First property linking to an object outside `file`.
    pub(crate) fn foreign_link(&self, file: &FileKey) -> Option<&str> {
        self.link_origins
            .iter()
            .find(|(_, origin)| origin != file)
            .map(|(property, _)| property.as_str())
    }
}

/// Live reference to a stored object.
///
/// Every read resolves against what the owning handle currently sees, so a
/// reference follows the handle as it refreshes and observes uncommitted
/// changes of the handle's own write transaction.
#[derive(Clone)]
pub struct ObjectRef {
    db: Database,
    class: String,
    id: ObjectId,
}

impl ObjectRef {
    pub(crate) fn new(db: Database, class: impl Into<String>, id: ObjectId) -> Self {
        Self {
            db,
            class: class.into(),
            id,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn link(&self) -> ObjectLink {
        ObjectLink {
            class: self.class.clone(),
            id: self.id,
        }
    }

    /// Whether the object exists in the handle's current view.
    pub fn is_valid(&self) -> Result<bool> {
        self.db
            .inner
            .with_view(|view| view.contains(&self.class, self.id))
    }

    pub fn get(&self, property: &str) -> Result<Value> {
        self.db.inner.with_view(|view| {
            let object = view
                .object(&self.class, self.id)
                .ok_or_else(|| self.not_found(view.version()))?;
            match object.get(property) {
                Some(value) => Ok(value.clone()),
                None => match view.schema().class(&self.class).and_then(|c| c.property(property)) {
                    Some(_) => Ok(Value::Null),
                    None => Err(DbError::ConstraintViolation(format!(
                        "Class '{}' has no property '{}'",
                        self.class, property
                    ))),
                },
            }
        })?
    }

    /// Follows a link property. `None` when the property is `Null`.
    pub fn follow(&self, property: &str) -> Result<Option<ObjectRef>> {
        match self.get(property)? {
            Value::Null => Ok(None),
            Value::Link(link) => Ok(Some(ObjectRef::new(self.db.clone(), link.class, link.id))),
            other => Err(DbError::TypeMismatch(format!(
                "Property '{}' holds {}, not a link",
                property,
                other.type_name()
            ))),
        }
    }

    pub fn to_object(&self) -> Result<Object> {
        self.db.inner.with_view(|view| {
            view.object(&self.class, self.id)
                .cloned()
                .ok_or_else(|| self.not_found(view.version()))
        })?
    }

    /// Overwrites one property. Requires a write transaction.
    pub fn set(&self, property: &str, value: impl Into<Value>) -> Result<()> {
        self.db
            .inner
            .set(&self.class, self.id, property, value.into())
    }

    pub fn set_link(&self, property: &str, target: &ObjectRef) -> Result<()> {
        self.db
            .inner
            .check_link_origin(target.db.inner.shared(), property)?;
        self.db
            .inner
            .set(&self.class, self.id, property, Value::Link(target.link()))
    }

    fn not_found(&self, version: crate::core::Version) -> DbError {
        DbError::ObjectNotFound {
            class: self.class.clone(),
            id: self.id.0,
            version,
        }
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class
            && self.id == other.id
            && self.db.inner.shared().key() == other.db.inner.shared().key()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({}#{} in {})", self.class, self.id, self.db.path().display())
    }
}
