//! Schema metadata embedded in each store.
//!
//! The full model definition is stored as JSON next to the objects so an
//! existing store can be compared against (and migrated to) a newer model.

use super::StoreResult;
use crate::model::schema::Schema;
use rusqlite::{params, Connection, OptionalExtension};

const SCHEMA_KEY: &str = "schema";

/// Returns the model recorded in the store, or `None` for a fresh store.
pub fn read_schema(conn: &Connection) -> StoreResult<Option<Schema>> {
    let raw = conn
        .query_row(
            "SELECT value FROM store_metadata WHERE key = ?1;",
            [SCHEMA_KEY],
            |row| row.get::<_, String>(0),
        )
        .optional()?;

    match raw {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Records `schema` as the model the store currently conforms to.
pub fn write_schema(conn: &Connection, schema: &Schema) -> StoreResult<()> {
    let json = serde_json::to_string(schema)?;
    conn.execute(
        "INSERT INTO store_metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        params![SCHEMA_KEY, json],
    )?;
    Ok(())
}
