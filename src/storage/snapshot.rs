//! Immutable committed state of a file.
//!
//! Objects live in persistent maps (`im::OrdMap`), so a write transaction can
//! start from a clone of the pinned snapshot in O(1) and readers pinned at older
//! versions keep sharing the untouched parts of the tree.

use crate::core::{Object, ObjectId, Schema, SchemaVersion, Value, Version};
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    version: Version,
    schema_version: SchemaVersion,
    schema: Schema,
    objects: OrdMap<String, OrdMap<ObjectId, Object>>,
    next_object_id: u64,
}

impl Snapshot {
    /// State of a file nothing was ever committed to.
    pub fn empty() -> Self {
        Self {
            version: Version::ZERO,
            schema_version: 0,
            schema: Schema::default(),
            objects: OrdMap::new(),
            next_object_id: 1,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn schema_version(&self) -> SchemaVersion {
        self.schema_version
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn is_initialized(&self) -> bool {
        self.version > Version::ZERO
    }

    pub fn object(&self, class: &str, id: ObjectId) -> Option<&Object> {
        self.objects.get(class).and_then(|objects| objects.get(&id))
    }

    pub fn contains(&self, class: &str, id: ObjectId) -> bool {
        self.object(class, id).is_some()
    }

    /// Objects of a class in id order.
    pub fn objects(&self, class: &str) -> Vec<&Object> {
        self.objects
            .get(class)
            .map(|objects| objects.values().collect())
            .unwrap_or_default()
    }

    pub fn object_ids(&self, class: &str) -> Vec<ObjectId> {
        self.objects
            .get(class)
            .map(|objects| objects.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, class: &str) -> usize {
        self.objects.get(class).map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn class_counts(&self) -> BTreeMap<String, usize> {
        self.schema
            .classes()
            .map(|class| (class.name().to_string(), self.count(class.name())))
            .collect()
    }

    pub fn total_objects(&self) -> usize {
        self.objects.values().map(|objects| objects.len()).sum()
    }

    /// Properties linking to `class#id`, as (class, object, property).
    pub fn referrers(&self, class: &str, id: ObjectId) -> Vec<(String, ObjectId, String)> {
        let mut found = Vec::new();
        for (stored_class, objects) in self.objects.iter() {
            for object in objects.values() {
                for (property, value) in &object.properties {
                    if let Some(link) = value.as_link() {
                        if link.class == class && link.id == id {
                            found.push((stored_class.clone(), object.id, property.clone()));
                        }
                    }
                }
            }
        }
        found
    }

    pub(crate) fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub(crate) fn with_schema(mut self, schema: Schema, schema_version: SchemaVersion) -> Self {
        self.schema = schema;
        self.schema_version = schema_version;
        self
    }

    pub(crate) fn allocate_id(&mut self) -> ObjectId {
        let id = ObjectId(self.next_object_id);
        self.next_object_id += 1;
        id
    }

    pub(crate) fn put(&mut self, object: Object) {
        self.objects
            .entry(object.class.clone())
            .or_insert_with(OrdMap::new)
            .insert(object.id, object);
    }

    pub(crate) fn take(&mut self, class: &str, id: ObjectId) -> Option<Object> {
        let objects = self.objects.get_mut(class)?;
        objects.remove(&id)
    }

    pub(crate) fn drop_class(&mut self, class: &str) -> usize {
        self.objects.remove(class).map(|objects| objects.len()).unwrap_or(0)
    }

    pub(crate) fn stored_classes(&self) -> Vec<String> {
        self.objects.keys().cloned().collect()
    }

    pub(crate) fn set_property(&mut self, class: &str, id: ObjectId, property: &str, value: Value) -> bool {
        let Some(objects) = self.objects.get_mut(class) else {
            return false;
        };
        match objects.get_mut(&id) {
            Some(object) => {
                object.properties.insert(property.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Replaces every link pointing at `class#id` with `Null`.
    ///
    /// Returns how many properties were cleared.
    pub(crate) fn clear_links_to(&mut self, class: &str, id: ObjectId) -> usize {
        let mut cleared = 0;
        let classes: Vec<String> = self.objects.keys().cloned().collect();
        for stored_class in classes {
            let Some(objects) = self.objects.get_mut(&stored_class) else {
                continue;
            };
            let ids: Vec<ObjectId> = objects.keys().copied().collect();
            for object_id in ids {
                let Some(object) = objects.get_mut(&object_id) else {
                    continue;
                };
                for value in object.properties.values_mut() {
                    let points_here = value
                        .as_link()
                        .map(|link| link.class == class && link.id == id)
                        .unwrap_or(false);
                    if points_here {
                        *value = Value::Null;
                        cleared += 1;
                    }
                }
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ObjectLink;

    fn person(snapshot: &mut Snapshot, name: &str) -> ObjectId {
        let id = snapshot.allocate_id();
        let mut properties = BTreeMap::new();
        properties.insert("name".to_string(), Value::from(name));
        snapshot.put(Object { class: "Person".into(), id, properties });
        id
    }

    #[test]
    fn test_clone_is_isolated() {
        let mut base = Snapshot::empty();
        let ann = person(&mut base, "Ann");

        let mut working = base.clone();
        working.set_property("Person", ann, "name", Value::from("Bea"));
        person(&mut working, "Cid");

        assert_eq!(base.count("Person"), 1);
        assert_eq!(
            base.object("Person", ann).unwrap().get("name"),
            Some(&Value::from("Ann"))
        );
        assert_eq!(working.count("Person"), 2);
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut snapshot = Snapshot::empty();
        let first = person(&mut snapshot, "Ann");
        snapshot.take("Person", first);
        let second = person(&mut snapshot, "Bea");
        assert!(second > first);
    }

    #[test]
    fn test_clear_links() {
        let mut snapshot = Snapshot::empty();
        let dog = snapshot.allocate_id();
        snapshot.put(Object { class: "Dog".into(), id: dog, properties: BTreeMap::new() });
        let owner = person(&mut snapshot, "Ann");
        snapshot.set_property(
            "Person",
            owner,
            "dog",
            Value::Link(ObjectLink { class: "Dog".into(), id: dog }),
        );

        assert_eq!(
            snapshot.referrers("Dog", dog),
            vec![("Person".to_string(), owner, "dog".to_string())]
        );
        assert_eq!(snapshot.clear_links_to("Dog", dog), 1);
        assert!(snapshot.referrers("Dog", dog).is_empty());
        assert!(snapshot.object("Person", owner).unwrap().get("dog").unwrap().is_null());
    }
}
