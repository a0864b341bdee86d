//! Lightweight schema automigration.
//!
//! Supported changes: added entities, removed entities (rows deleted),
//! added attributes (filled from their default), removed attributes
//! (dropped). Anything else needs a real migration and is refused.

use super::SetupError;
use crate::db::metadata::{read_schema, write_schema};
use crate::model::object::AttributeValue;
use crate::model::schema::Schema;
use crate::repo::object_repo::SqliteObjectRepository;
use rusqlite::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reconciliation {
    Created,
    Unchanged,
    Migrated { from_version: u32 },
}

#[derive(Debug, Default)]
struct MigrationPlan {
    removed_entities: Vec<String>,
    entities: Vec<EntityMigration>,
}

#[derive(Debug)]
struct EntityMigration {
    entity: String,
    dropped: Vec<String>,
    defaults: Vec<(String, AttributeValue)>,
}

/// Brings the store's recorded schema in line with `schema`.
pub(crate) fn reconcile_schema(
    conn: &mut Connection,
    schema: &Schema,
    automigrating: bool,
) -> Result<Reconciliation, SetupError> {
    let Some(stored) = read_schema(conn)? else {
        write_schema(conn, schema)?;
        return Ok(Reconciliation::Created);
    };

    if stored == *schema {
        return Ok(Reconciliation::Unchanged);
    }
    if !automigrating || stored.version > schema.version {
        return Err(SetupError::IncompatibleSchema {
            store_version: stored.version,
            model_version: schema.version,
        });
    }

    let plan = plan_migration(&stored, schema)?;
    let tx = conn.transaction()?;
    apply_plan(&tx, &plan)?;
    write_schema(&tx, schema)?;
    tx.commit()?;

    Ok(Reconciliation::Migrated {
        from_version: stored.version,
    })
}

fn plan_migration(stored: &Schema, target: &Schema) -> Result<MigrationPlan, SetupError> {
    let mut plan = MigrationPlan {
        removed_entities: stored
            .entities
            .keys()
            .filter(|name| target.entity(name).is_none())
            .cloned()
            .collect(),
        ..MigrationPlan::default()
    };

    for (name, entity) in &target.entities {
        let Some(previous) = stored.entity(name) else {
            continue;
        };

        let mut migration = EntityMigration {
            entity: name.clone(),
            dropped: previous
                .attributes
                .keys()
                .filter(|attribute| entity.attribute(attribute).is_none())
                .cloned()
                .collect(),
            defaults: Vec::new(),
        };

        for (attribute_name, attribute) in &entity.attributes {
            match previous.attribute(attribute_name) {
                Some(old) if old.kind != attribute.kind => {
                    return Err(SetupError::MigrationFailed(format!(
                        "attribute `{name}.{attribute_name}` changed type from {} to {}",
                        old.kind.as_str(),
                        attribute.kind.as_str()
                    )));
                }
                Some(_) => {}
                None => match (&attribute.default, attribute.optional) {
                    (Some(default), _) => migration
                        .defaults
                        .push((attribute_name.clone(), default.clone())),
                    (None, true) => {}
                    (None, false) => {
                        return Err(SetupError::MigrationFailed(format!(
                            "required attribute `{name}.{attribute_name}` was added without a default"
                        )));
                    }
                },
            }
        }

        if !migration.dropped.is_empty() || !migration.defaults.is_empty() {
            plan.entities.push(migration);
        }
    }

    Ok(plan)
}

fn apply_plan(conn: &Connection, plan: &MigrationPlan) -> Result<(), SetupError> {
    let repo = SqliteObjectRepository::new(conn);

    for entity in &plan.removed_entities {
        repo.delete_entity(entity)?;
    }

    for migration in &plan.entities {
        for mut object in repo.list_by_entity(&migration.entity)? {
            let attributes = object.attributes_mut();
            for attribute in &migration.dropped {
                attributes.remove(attribute);
            }
            for (attribute, default) in &migration.defaults {
                attributes
                    .entry(attribute.clone())
                    .or_insert_with(|| default.clone());
            }
            let version = object.version() + 1;
            repo.write(&object, version)?;
        }
    }

    Ok(())
}
