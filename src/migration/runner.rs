//! Schema check at open, and the upgrade when the file is behind.

use super::Migration;
use crate::connection::config::Configuration;
use crate::core::{ContextId, DbError, Result, Schema, SchemaVersion, Version};
use crate::facade::shared_file::SharedFile;
use crate::storage::Snapshot;
use tracing::{Level, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaCheck {
    /// Stored schema is the expected one.
    Current,
    /// Nothing with a schema was ever committed.
    Fresh,
    /// Same schema version, different shape.
    Conflict,
    /// Stored schema version is ahead of the expected one.
    Newer,
    /// Stored schema version is behind the expected one.
    Upgrade,
}

fn classify(snapshot: &Snapshot, schema: &Schema, expected: SchemaVersion) -> SchemaCheck {
    let on_disk = snapshot.schema_version();
    if on_disk == 0 && snapshot.schema().is_empty() {
        SchemaCheck::Fresh
    } else if on_disk == expected {
        if snapshot.schema() == schema {
            SchemaCheck::Current
        } else {
            SchemaCheck::Conflict
        }
    } else if on_disk > expected {
        SchemaCheck::Newer
    } else {
        SchemaCheck::Upgrade
    }
}

/// Brings the file to the configured schema.
///
/// Returns the version committed by an initialization or migration, or
/// `None` if the file already matched. Nothing is persisted on error.
pub(crate) fn check_and_migrate(
    shared: &SharedFile,
    config: &Configuration,
    context: ContextId,
    read_only: bool,
) -> Result<Option<Version>> {
    let Some(schema) = &config.schema else {
        return Ok(None);
    };
    let expected = config.schema_version;

    shared.import_external(false)?;
    let fast = classify(&shared.versions().latest_snapshot(), schema, expected);
    if fast == SchemaCheck::Current {
        return Ok(None);
    }

    let span = info_span!("migration", path = %shared.path().display(), expected);
    let _entered = span.enter();

    // Opens racing with a migration wait here until it finishes.
    let _lock = shared.coordinator().exclusive(context, shared.storage())?;
    shared.import_external(true)?;
    let latest = shared.versions().latest_snapshot();
    let on_disk = latest.schema_version();

    match classify(&latest, schema, expected) {
        SchemaCheck::Current => Ok(None),
        SchemaCheck::Conflict => Err(DbError::SchemaIntegrity {
            path: shared.path().to_path_buf(),
            on_disk: Some(on_disk),
            expected,
            message: "Schema differs from the one committed under this schema version".into(),
        }),
        SchemaCheck::Newer => Err(DbError::MigrationOrder {
            path: shared.path().to_path_buf(),
            on_disk,
            declared: expected,
            expected,
        }),
        SchemaCheck::Fresh => {
            if read_only {
                return Err(DbError::SchemaIntegrity {
                    path: shared.path().to_path_buf(),
                    on_disk: None,
                    expected,
                    message: "A read-only handle cannot initialize the schema".into(),
                });
            }
            let working = (*latest).clone().with_schema(schema.clone(), expected);
            let published = shared.commit_snapshot(working, None)?;
            event!(
                Level::INFO,
                version = %published.version(),
                schema_version = expected,
                "schema initialized"
            );
            Ok(Some(published.version()))
        }
        SchemaCheck::Upgrade => {
            if read_only {
                return Err(DbError::SchemaIntegrity {
                    path: shared.path().to_path_buf(),
                    on_disk: Some(on_disk),
                    expected,
                    message: "A read-only handle cannot migrate the schema".into(),
                });
            }
            let Some(transform) = &config.migration else {
                return Err(DbError::SchemaIntegrity {
                    path: shared.path().to_path_buf(),
                    on_disk: Some(on_disk),
                    expected,
                    message: "Schema version is behind and no migration was supplied".into(),
                });
            };

            let mut migration = Migration::new(latest, schema.clone(), expected);
            let declared = transform(&mut migration, on_disk)?;
            if declared <= on_disk || declared != expected {
                return Err(DbError::MigrationOrder {
                    path: shared.path().to_path_buf(),
                    on_disk,
                    declared,
                    expected,
                });
            }

            let (created, deleted) = (migration.created(), migration.deleted());
            let working = migration.finish(shared.path(), expected)?;
            let published = shared.commit_snapshot(working, None)?;
            event!(
                Level::INFO,
                version = %published.version(),
                from = on_disk,
                to = declared,
                created,
                deleted,
                "schema migrated"
            );
            Ok(Some(published.version()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ClassSchema, DataType, Property};

    fn schema(properties: Vec<Property>) -> Schema {
        Schema::new(vec![ClassSchema::new("Person", properties)])
    }

    #[test]
    fn test_classify() {
        let v1 = schema(vec![Property::new("name", DataType::Text)]);
        let v2 = schema(vec![
            Property::new("name", DataType::Text),
            Property::new("age", DataType::Integer),
        ]);
        let stored = Snapshot::empty().with_schema(v1.clone(), 1).with_version(Version(1));

        assert_eq!(classify(&Snapshot::empty(), &v1, 1), SchemaCheck::Fresh);
        assert_eq!(classify(&stored, &v1, 1), SchemaCheck::Current);
        assert_eq!(classify(&stored, &v2, 1), SchemaCheck::Conflict);
        assert_eq!(classify(&stored, &v2, 2), SchemaCheck::Upgrade);

        let ahead = Snapshot::empty().with_schema(v2.clone(), 3).with_version(Version(2));
        assert_eq!(classify(&ahead, &v2, 2), SchemaCheck::Newer);
    }
}
