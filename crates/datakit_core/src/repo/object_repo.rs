//! SQLite persistence for managed object rows.
//!
//! # Responsibility
//! - Keep SQL for the `objects` table inside one boundary.
//! - Convert rows to `ManagedObject` values and back.
//!
//! # Invariants
//! - Every write bumps or sets the row `version`.
//! - Read paths reject malformed rows instead of masking them.

use crate::db::{StoreError, StoreResult};
use crate::model::object::{AttributeValue, ManagedObject, ObjectId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;

const OBJECT_SELECT_SQL: &str = "SELECT id, entity, attributes, version FROM objects";

/// Row-level access to stored objects.
///
/// Works on plain connections and on transactions (which deref to one).
pub struct SqliteObjectRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteObjectRepository<'conn> {
    pub fn new(conn: &'conn Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, id: ObjectId) -> StoreResult<Option<ManagedObject>> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!("{OBJECT_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_object_row(row)?)),
            None => Ok(None),
        }
    }

    /// Lists all objects of one entity in insertion order.
    pub fn list_by_entity(&self, entity: &str) -> StoreResult<Vec<ManagedObject>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "{OBJECT_SELECT_SQL} WHERE entity = ?1 ORDER BY rowid ASC;"
        ))?;
        let mut rows = stmt.query([entity])?;
        let mut objects = Vec::new();
        while let Some(row) = rows.next()? {
            objects.push(parse_object_row(row)?);
        }
        Ok(objects)
    }

    pub fn count(&self) -> StoreResult<u64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM objects;", [], |row| row.get::<_, i64>(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Returns the stored version of one row, `None` when the row is absent.
    pub fn version_of(&self, id: ObjectId) -> StoreResult<Option<u64>> {
        let version = self
            .conn
            .query_row(
                "SELECT version FROM objects WHERE id = ?1;",
                [id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        version.map(version_from_db).transpose()
    }

    /// Inserts a row with version 1.
    pub fn insert(&self, object: &ManagedObject) -> StoreResult<u64> {
        self.conn.execute(
            "INSERT INTO objects (id, entity, attributes, version) VALUES (?1, ?2, ?3, 1);",
            params![
                object.id().to_string(),
                object.entity(),
                serde_json::to_string(object.attributes())?,
            ],
        )?;
        Ok(1)
    }

    /// Overwrites a row and stores `version`.
    pub fn write(&self, object: &ManagedObject, version: u64) -> StoreResult<()> {
        self.conn.execute(
            "INSERT INTO objects (id, entity, attributes, version) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                entity = excluded.entity,
                attributes = excluded.attributes,
                version = excluded.version,
                updated_at = (strftime('%s', 'now') * 1000);",
            params![
                object.id().to_string(),
                object.entity(),
                serde_json::to_string(object.attributes())?,
                version_to_db(version)?,
            ],
        )?;
        Ok(())
    }

    /// Deletes a row. Deleting an absent row is not an error.
    pub fn delete(&self, id: ObjectId) -> StoreResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM objects WHERE id = ?1;", [id.to_string()])?;
        Ok(changed > 0)
    }

    pub fn delete_entity(&self, entity: &str) -> StoreResult<usize> {
        let changed = self
            .conn
            .execute("DELETE FROM objects WHERE entity = ?1;", [entity])?;
        Ok(changed)
    }
}

fn parse_object_row(row: &Row<'_>) -> StoreResult<ManagedObject> {
    let id_text: String = row.get("id")?;
    let id = ObjectId::parse(&id_text).ok_or_else(|| {
        StoreError::InvalidData(format!("invalid object id `{id_text}` in objects.id"))
    })?;
    let attributes_json: String = row.get("attributes")?;
    let attributes: BTreeMap<String, AttributeValue> = serde_json::from_str(&attributes_json)?;
    let version = version_from_db(row.get("version")?)?;

    Ok(ManagedObject::from_parts(
        id,
        row.get("entity")?,
        attributes,
        version,
    ))
}

fn version_from_db(value: i64) -> StoreResult<u64> {
    u64::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("invalid version `{value}` in objects.version")))
}

fn version_to_db(value: u64) -> StoreResult<i64> {
    i64::try_from(value)
        .map_err(|_| StoreError::InvalidData(format!("version `{value}` does not fit storage")))
}

#[cfg(test)]
mod tests {
    use super::SqliteObjectRepository;
    use crate::db::open_store_in_memory;
    use crate::model::object::{AttributeValue, ManagedObject};

    fn object(entity: &str, title: &str) -> ManagedObject {
        let mut object = ManagedObject::new(entity);
        object.set("title", AttributeValue::from(title));
        object
    }

    #[test]
    fn insert_then_write_tracks_versions() {
        let conn = open_store_in_memory().unwrap();
        let repo = SqliteObjectRepository::new(&conn);
        let mut item = object("Item", "first");

        assert_eq!(repo.insert(&item).unwrap(), 1);
        assert_eq!(repo.version_of(item.id()).unwrap(), Some(1));

        item.set("title", AttributeValue::from("second"));
        repo.write(&item, 2).unwrap();

        let stored = repo.get(item.id()).unwrap().unwrap();
        assert_eq!(stored.version(), 2);
        assert_eq!(stored.text("title"), Some("second"));
    }

    #[test]
    fn list_by_entity_keeps_insertion_order() {
        let conn = open_store_in_memory().unwrap();
        let repo = SqliteObjectRepository::new(&conn);
        let titles = ["c", "a", "b"];
        for title in titles {
            repo.insert(&object("Item", title)).unwrap();
        }
        repo.insert(&object("Other", "x")).unwrap();

        let listed: Vec<String> = repo
            .list_by_entity("Item")
            .unwrap()
            .iter()
            .filter_map(|item| item.text("title").map(str::to_string))
            .collect();
        assert_eq!(listed, titles);
    }

    #[test]
    fn delete_entity_removes_only_that_entity() {
        let conn = open_store_in_memory().unwrap();
        let repo = SqliteObjectRepository::new(&conn);
        let kept = object("Kept", "stay");
        repo.insert(&kept).unwrap();
        repo.insert(&object("Gone", "go")).unwrap();
        repo.insert(&object("Gone", "go too")).unwrap();

        assert_eq!(repo.delete_entity("Gone").unwrap(), 2);
        assert_eq!(repo.count().unwrap(), 1);
        assert!(repo.delete(kept.id()).unwrap());
        assert!(!repo.delete(kept.id()).unwrap());
        assert_eq!(repo.version_of(kept.id()).unwrap(), None);
    }

    #[test]
    fn malformed_row_is_rejected() {
        let conn = open_store_in_memory().unwrap();
        conn.execute(
            "INSERT INTO objects (id, entity, attributes, version) VALUES ('not-a-uuid', 'Item', '{}', 1);",
            [],
        )
        .unwrap();

        let repo = SqliteObjectRepository::new(&conn);
        assert!(repo.list_by_entity("Item").is_err());
    }
}
