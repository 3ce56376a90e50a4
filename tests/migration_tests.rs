/// Migration tests
///
/// Schema initialization, upgrades and the errors that leave a file untouched
/// Run with: cargo test --test migration_tests

use snapvault::{
    ClassSchema, Configuration, DataType, Database, DbError, ObjectData, Property, Schema, Value,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tempfile::TempDir;

fn person_v1() -> Schema {
    Schema::new(vec![ClassSchema::new(
        "Person",
        vec![Property::new("name", DataType::Text).not_null()],
    )])
}

fn person_v2() -> Schema {
    Schema::new(vec![ClassSchema::new(
        "Person",
        vec![
            Property::new("name", DataType::Text).not_null(),
            Property::new("age", DataType::Integer).not_null().with_default(0i64),
        ],
    )])
}

fn person_with_email() -> Schema {
    Schema::new(vec![ClassSchema::new(
        "Person",
        vec![
            Property::new("name", DataType::Text).not_null(),
            Property::new("email", DataType::Text).not_null(),
        ],
    )])
}

fn create_v1(path: &Path, names: &[&str]) {
    let db = Database::open(Configuration::new(path).schema(person_v1()).schema_version(1)).unwrap();
    db.transaction(|db| {
        for name in names {
            db.insert("Person", ObjectData::new().set("name", *name))?;
        }
        Ok(())
    })
    .unwrap();
    db.close().unwrap();
}

fn open_v1(path: &Path) -> snapvault::Result<Database> {
    Database::open(Configuration::new(path).schema(person_v1()).schema_version(1))
}

#[test]
fn test_fresh_file_gets_schema() {
    let temp_dir = TempDir::new().unwrap();
    let db = open_v1(&temp_dir.path().join("fresh.vault")).unwrap();

    assert_eq!(db.schema_version().unwrap(), 1);
    assert_eq!(db.schema().unwrap(), person_v1());
}

#[test]
fn test_open_without_schema_adopts_stored_one() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("adopt.vault");
    create_v1(&path, &["Ann"]);

    let db = Database::open(Configuration::new(&path)).unwrap();
    assert_eq!(db.schema().unwrap(), person_v1());
    assert_eq!(db.count("Person").unwrap(), 1);
}

#[test]
fn test_migration_adds_property_with_default() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("upgrade.vault");
    create_v1(&path, &["Ann", "Bob"]);

    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let db = Database::open(
        Configuration::new(&path)
            .schema(person_v2())
            .schema_version(2)
            .migration(move |migration, on_disk| {
                seen.fetch_add(1, Ordering::SeqCst);
                assert_eq!(on_disk, 1);
                assert_eq!(migration.old_schema_version(), 1);
                assert_eq!(migration.old_objects("Person").len(), 2);
                Ok(2)
            }),
    )
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(db.schema_version().unwrap(), 2);
    for person in db.objects("Person").unwrap() {
        assert_eq!(person.get("age").unwrap(), Value::Integer(0));
    }

    // Already migrated: the function does not run again
    drop(db);
    let again = Database::open(
        Configuration::new(&path)
            .schema(person_v2())
            .schema_version(2)
            .migration(|_, _| panic!("migration ran twice")),
    )
    .unwrap();
    assert_eq!(again.count("Person").unwrap(), 2);
}

#[test]
fn test_migration_fills_required_property() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("email.vault");
    create_v1(&path, &["ann", "bob"]);

    let missing = Database::open(
        Configuration::new(&path)
            .schema(person_with_email())
            .schema_version(2)
            .migration(|_, _| Ok(2)),
    );
    assert!(matches!(missing, Err(DbError::SchemaIntegrity { .. })));

    let db = Database::open(
        Configuration::new(&path)
            .schema(person_with_email())
            .schema_version(2)
            .migration(|migration, _| {
                migration.enumerate("Person", |old, new| {
                    let name = old.get("name").and_then(Value::as_str).unwrap_or_default();
                    new.properties
                        .insert("email".into(), Value::from(format!("{}@example.com", name)));
                })?;
                Ok(2)
            }),
    )
    .unwrap();

    let emails: Vec<Value> = db
        .objects("Person")
        .unwrap()
        .iter()
        .map(|person| person.get("email").unwrap())
        .collect();
    assert_eq!(
        emails,
        vec![Value::from("ann@example.com"), Value::from("bob@example.com")]
    );
}

#[test]
fn test_migration_can_create_and_delete() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("rewrite.vault");
    create_v1(&path, &["Ann", "Bob"]);

    let db = Database::open(
        Configuration::new(&path)
            .schema(person_v2())
            .schema_version(2)
            .migration(|migration, _| {
                let bob = migration
                    .old_objects("Person")
                    .iter()
                    .find(|person| person.get("name") == Some(&Value::from("Bob")))
                    .map(|person| person.id);
                if let Some(bob) = bob {
                    assert!(migration.delete("Person", bob));
                }
                migration.create("Person", ObjectData::new().set("name", "Cid").set("age", 9))?;
                Ok(2)
            }),
    )
    .unwrap();

    let mut names: Vec<String> = db
        .objects("Person")
        .unwrap()
        .iter()
        .map(|person| person.get("name").unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names.len(), 2);
    assert!(names.iter().any(|name| name.contains("Ann")));
    assert!(names.iter().any(|name| name.contains("Cid")));
}

#[test]
fn test_migration_without_function_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("no_fn.vault");
    create_v1(&path, &["Ann"]);

    let result = Database::open(Configuration::new(&path).schema(person_v2()).schema_version(2));
    assert!(matches!(result, Err(DbError::SchemaIntegrity { .. })));
}

#[test]
fn test_wrong_declared_version_leaves_file_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("order.vault");
    create_v1(&path, &["Ann"]);

    let backwards = Database::open(
        Configuration::new(&path)
            .schema(person_v2())
            .schema_version(2)
            .migration(|_, on_disk| Ok(on_disk)),
    );
    match backwards {
        Err(DbError::MigrationOrder {
            on_disk, declared, ..
        }) => {
            assert_eq!(on_disk, 1);
            assert_eq!(declared, 1);
        }
        other => panic!("expected migration order error, got {:?}", other.map(|_| ())),
    }

    let overshoot = Database::open(
        Configuration::new(&path)
            .schema(person_v2())
            .schema_version(2)
            .migration(|_, _| Ok(3)),
    );
    assert!(matches!(overshoot, Err(DbError::MigrationOrder { .. })));

    let db = open_v1(&path).unwrap();
    assert_eq!(db.schema_version().unwrap(), 1);
    assert_eq!(db.count("Person").unwrap(), 1);
}

#[test]
fn test_older_schema_cannot_open_newer_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("newer.vault");
    create_v1(&path, &["Ann"]);
    Database::open(
        Configuration::new(&path)
            .schema(person_v2())
            .schema_version(2)
            .migration(|_, _| Ok(2)),
    )
    .unwrap()
    .close()
    .unwrap();

    assert!(matches!(open_v1(&path), Err(DbError::MigrationOrder { .. })));
}

#[test]
fn test_same_version_different_schema_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("conflict.vault");
    create_v1(&path, &["Ann"]);

    let result = Database::open(Configuration::new(&path).schema(person_v2()).schema_version(1));
    assert!(matches!(result, Err(DbError::SchemaIntegrity { .. })));
}

#[test]
fn test_reopen_with_other_schema_on_same_context() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("same_ctx.vault");
    let _db = open_v1(&path).unwrap();

    let result = Database::open(
        Configuration::new(&path)
            .schema(person_v2())
            .schema_version(2)
            .migration(|_, _| Ok(2)),
    );
    assert!(matches!(result, Err(DbError::Configuration(_))));
}

#[test]
fn test_read_only_cannot_migrate() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ro_migrate.vault");
    create_v1(&path, &["Ann"]);

    let result = Database::open(
        Configuration::new(&path)
            .read_only(true)
            .schema(person_v2())
            .schema_version(2)
            .migration(|_, _| Ok(2)),
    );
    assert!(matches!(result, Err(DbError::SchemaIntegrity { .. })));
}

#[test]
fn test_explicit_migrate() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("explicit.vault");
    create_v1(&path, &["Ann"]);

    let config = Configuration::new(&path)
        .schema(person_v2())
        .schema_version(2)
        .migration(|_, _| Ok(2));

    // Refused while this process still has the file open
    let held = open_v1(&path).unwrap();
    assert!(matches!(
        Database::migrate(config.clone()),
        Err(DbError::Configuration(_))
    ));
    drop(held);

    let version = Database::migrate(config.clone()).unwrap();
    assert!(version.is_some());
    assert_eq!(Database::migrate(config).unwrap(), None);

    let db = Database::open(Configuration::new(&path)).unwrap();
    assert_eq!(db.schema_version().unwrap(), 2);
}

#[test]
fn test_concurrent_opens_migrate_once() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("race.vault");
    create_v1(&path, &["Ann"]);

    let calls = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let calls = Arc::clone(&calls);
            thread::spawn(move || {
                let db = Database::open(
                    Configuration::new(&path)
                        .schema(person_v2())
                        .schema_version(2)
                        .migration(move |_, _| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(2)
                        }),
                )
                .unwrap();
                db.schema_version().unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 2);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}
