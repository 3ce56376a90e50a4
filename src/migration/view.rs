//! What a migration function sees and edits.
//!
//! Before the function runs, every object of a class that survives into the
//! new schema is reshaped: values of properties that keep their name and type
//! carry over, new properties get their default (or `Null` when nullable),
//! and required properties without a default start unset. The function must
//! set those before it returns.

use crate::connection::ObjectData;
use crate::core::{ClassSchema, DbError, Object, ObjectId, Result, Schema, SchemaVersion};
use crate::storage::Snapshot;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub struct Migration {
    old: Arc<Snapshot>,
    new_schema: Schema,
    working: Snapshot,
    created: usize,
    deleted: usize,
}

impl Migration {
    pub(crate) fn new(old: Arc<Snapshot>, new_schema: Schema, new_version: SchemaVersion) -> Self {
        let mut working = (*old).clone().with_schema(new_schema.clone(), new_version);
        for class in working.stored_classes() {
            match new_schema.class(&class) {
                None => {
                    working.drop_class(&class);
                }
                Some(new_class) => {
                    for id in working.object_ids(&class) {
                        if let Some(object) = working.take(&class, id) {
                            working.put(reshape(object, new_class));
                        }
                    }
                }
            }
        }

        Self {
            old,
            new_schema,
            working,
            created: 0,
            deleted: 0,
        }
    }

    pub fn old_schema(&self) -> &Schema {
        self.old.schema()
    }

    pub fn old_schema_version(&self) -> SchemaVersion {
        self.old.schema_version()
    }

    pub fn new_schema(&self) -> &Schema {
        &self.new_schema
    }

    /// Objects of `class` as they were before the migration.
    pub fn old_objects(&self, class: &str) -> Vec<&Object> {
        self.old.objects(class)
    }

    /// Calls `f` with the old and new version of every surviving object of
    /// `class`, in id order.
    ///
    /// Objects deleted earlier in this migration are skipped.
    pub fn enumerate<F>(&mut self, class: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&Object, &mut Object),
    {
        if self.new_schema.class(class).is_none() {
            return Err(DbError::ConstraintViolation(format!(
                "Class '{}' is not part of the new schema",
                class
            )));
        }
        for old in self.old.objects(class) {
            let Some(mut new) = self.working.take(class, old.id) else {
                continue;
            };
            f(old, &mut new);
            new.class = class.to_string();
            new.id = old.id;
            self.working.put(new);
        }
        Ok(())
    }

    /// Creates an object in the new schema.
    pub fn create(&mut self, class: &str, data: ObjectData) -> Result<ObjectId> {
        let new_class = self.new_schema.class(class).ok_or_else(|| {
            DbError::ConstraintViolation(format!(
                "Class '{}' is not part of the new schema",
                class
            ))
        })?;

        let mut properties = initial_properties(new_class);
        properties.extend(data.into_values());
        let id = self.working.allocate_id();
        self.working.put(Object {
            class: class.to_string(),
            id,
            properties,
        });
        self.created += 1;
        Ok(id)
    }

    /// Deletes an object; links pointing to it become `Null`.
    pub fn delete(&mut self, class: &str, id: ObjectId) -> bool {
        if self.working.take(class, id).is_none() {
            return false;
        }
        self.working.clear_links_to(class, id);
        self.deleted += 1;
        true
    }

    pub fn created(&self) -> usize {
        self.created
    }

    pub fn deleted(&self) -> usize {
        self.deleted
    }

    /// Validates every object against the new schema.
    pub(crate) fn finish(self, path: &Path, expected: SchemaVersion) -> Result<Snapshot> {
        let on_disk = Some(self.old.schema_version());
        let invalid = |message: String| DbError::SchemaIntegrity {
            path: path.to_path_buf(),
            on_disk,
            expected,
            message,
        };

        for class in self.new_schema.classes() {
            for object in self.working.objects(class.name()) {
                if let Some(extra) = object
                    .properties
                    .keys()
                    .find(|name| class.property(name).is_none())
                {
                    return Err(invalid(format!(
                        "{}#{} has property '{}' which is not in the new schema",
                        class.name(),
                        object.id,
                        extra
                    )));
                }

                for property in class.properties() {
                    let Some(value) = object.get(&property.name) else {
                        return Err(invalid(format!(
                            "{}#{}: required property '{}' was not set",
                            class.name(),
                            object.id,
                            property.name
                        )));
                    };
                    property.validate(value).map_err(|err| {
                        invalid(format!("{}#{}: {}", class.name(), object.id, err))
                    })?;
                    if let Some(link) = value.as_link() {
                        if !self.working.contains(&link.class, link.id) {
                            return Err(invalid(format!(
                                "{}#{}.{} links to missing {}#{}",
                                class.name(),
                                object.id,
                                property.name,
                                link.class,
                                link.id
                            )));
                        }
                    }
                }
            }
        }

        Ok(self.working)
    }
}

fn initial_properties(class: &ClassSchema) -> BTreeMap<String, crate::core::Value> {
    class
        .properties()
        .iter()
        .filter_map(|property| {
            property
                .initial_value()
                .map(|value| (property.name.clone(), value))
        })
        .collect()
}

fn reshape(mut object: Object, class: &ClassSchema) -> Object {
    let mut properties = initial_properties(class);
    for property in class.properties() {
        if let Some(value) = object.properties.remove(&property.name) {
            if property.data_type.is_compatible(&value) && !(value.is_null() && !property.nullable) {
                properties.insert(property.name.clone(), value);
            }
        }
    }
    object.properties = properties;
    object
}
