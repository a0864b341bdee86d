//! Persistent store coordinator.
//!
//! # Responsibility
//! - Open file-backed or in-memory stores from a `StoreDescriptor`.
//! - Reconcile the stored schema with the model (optionally automigrating).
//! - Serve object reads and apply change sets atomically.
//!
//! # Invariants
//! - A coordinator only exists for a store whose schema matches its model.
//! - `commit` writes all of a change set or nothing.
//! - The connection is only touched while holding its mutex.

mod automigrate;

use crate::config::{is_valid_store_name, MergePolicy, STORE_FILE_EXTENSION};
use crate::context::{ContextError, ObjectStore};
use crate::db::{open_store_file, open_store_in_memory, StoreError};
use crate::model::changes::ChangeSet;
use crate::model::object::{ManagedObject, ObjectId};
use crate::model::registry::merged_registered_models;
use crate::model::schema::{Schema, SchemaError};
use crate::repo::object_repo::SqliteObjectRepository;
use automigrate::{reconcile_schema, Reconciliation};
use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Where a store keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    /// Store file inside this directory, named `<name>.sqlite`.
    File { directory: PathBuf },
    InMemory,
}

/// Immutable description of the store a stack is built on.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreDescriptor {
    pub name: String,
    pub kind: StoreKind,
    pub automigrating: bool,
    /// `None` means "merge every registered model".
    pub schema: Option<Schema>,
}

impl StoreDescriptor {
    pub fn file(
        directory: impl Into<PathBuf>,
        name: impl Into<String>,
        automigrating: bool,
        schema: Option<Schema>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StoreKind::File {
                directory: directory.into(),
            },
            automigrating,
            schema,
        }
    }

    pub fn in_memory(schema: Option<Schema>) -> Self {
        Self {
            name: "memory".to_string(),
            kind: StoreKind::InMemory,
            automigrating: false,
            schema,
        }
    }

    /// Path of the store file, `None` for in-memory stores.
    pub fn store_path(&self) -> Option<PathBuf> {
        match &self.kind {
            StoreKind::File { directory } => {
                Some(directory.join(format!("{}.{STORE_FILE_EXTENSION}", self.name)))
            }
            StoreKind::InMemory => None,
        }
    }
}

/// Failures that prevent a stack from being built.
#[derive(Debug)]
pub enum SetupError {
    InvalidStoreName(String),
    /// No explicit directory and the platform has no data directory.
    NoStoreDirectory,
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Store(StoreError),
    Schema(SchemaError),
    /// Neither an explicit schema nor any registered model was available.
    EmptySchema,
    IncompatibleSchema {
        store_version: u32,
        model_version: u32,
    },
    MigrationFailed(String),
    QueueSpawn(std::io::Error),
}

impl Display for SetupError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidStoreName(name) => write!(f, "invalid store name `{name}`"),
            Self::NoStoreDirectory => write!(f, "no store directory could be resolved"),
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::Store(err) => write!(f, "{err}"),
            Self::Schema(err) => write!(f, "{err}"),
            Self::EmptySchema => write!(f, "no schema given and no models registered"),
            Self::IncompatibleSchema {
                store_version,
                model_version,
            } => write!(
                f,
                "store schema version {store_version} is incompatible with model version {model_version}"
            ),
            Self::MigrationFailed(reason) => write!(f, "automigration failed: {reason}"),
            Self::QueueSpawn(err) => write!(f, "failed to start root queue: {err}"),
        }
    }
}

impl Error for SetupError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Store(err) => Some(err),
            Self::Schema(err) => Some(err),
            Self::QueueSpawn(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for SetupError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<rusqlite::Error> for SetupError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(value))
    }
}

impl From<SchemaError> for SetupError {
    fn from(value: SchemaError) -> Self {
        Self::Schema(value)
    }
}

/// Why a change set could not be written.
#[derive(Debug)]
pub enum CommitError {
    /// Stored versions moved under these objects.
    Conflict(Vec<ObjectId>),
    Store(StoreError),
}

impl From<StoreError> for CommitError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<rusqlite::Error> for CommitError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(StoreError::Sqlite(value))
    }
}

/// Result of a successful commit.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// New stored version of every written object.
    pub versions: HashMap<ObjectId, u64>,
    /// Updates dropped because the stored state won.
    pub discarded: Vec<ObjectId>,
}

/// Owns one physical store.
pub struct StoreCoordinator {
    descriptor: StoreDescriptor,
    schema: Arc<Schema>,
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for StoreCoordinator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreCoordinator")
            .field("name", &self.descriptor.name)
            .field("kind", &self.descriptor.kind)
            .field("schema_version", &self.schema.version)
            .finish_non_exhaustive()
    }
}

impl StoreCoordinator {
    /// Opens the store described by `descriptor`.
    ///
    /// # Errors
    /// - `EmptySchema` when no model is available.
    /// - `Schema` when a default cannot be stored.
    /// - `IncompatibleSchema` / `MigrationFailed` when the stored schema
    ///   cannot be brought in line with the model.
    /// - `Io` / `Store` for file system and SQLite failures.
    pub fn open(descriptor: StoreDescriptor) -> Result<Self, SetupError> {
        let started_at = Instant::now();
        if !is_valid_store_name(&descriptor.name) {
            return Err(SetupError::InvalidStoreName(descriptor.name));
        }

        let schema = match &descriptor.schema {
            Some(schema) => schema.clone(),
            None => merged_registered_models()?,
        };
        if schema.is_empty() {
            return Err(SetupError::EmptySchema);
        }
        schema.check_defaults()?;

        let mut conn = match descriptor.store_path() {
            Some(path) => open_file_connection(&path)?,
            None => open_store_in_memory()?,
        };

        match reconcile_schema(&mut conn, &schema, descriptor.automigrating)? {
            Reconciliation::Created => info!(
                "event=schema_reconcile module=coordinator status=created store={} version={}",
                descriptor.name, schema.version
            ),
            Reconciliation::Unchanged => {}
            Reconciliation::Migrated { from_version } => info!(
                "event=schema_reconcile module=coordinator status=migrated store={} from_version={} to_version={}",
                descriptor.name, from_version, schema.version
            ),
        }

        info!(
            "event=coordinator_open module=coordinator status=ok store={} in_memory={} duration_ms={}",
            descriptor.name,
            descriptor.kind == StoreKind::InMemory,
            started_at.elapsed().as_millis()
        );
        Ok(Self {
            descriptor,
            schema: Arc::new(schema),
            conn: Mutex::new(conn),
        })
    }

    pub fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Number of persisted objects across all entities.
    pub fn object_count(&self) -> Result<u64, StoreError> {
        let conn = self.conn.lock();
        SqliteObjectRepository::new(&conn).count()
    }

    /// Writes a change set in one transaction.
    ///
    /// Updated snapshots are compared against the stored row version;
    /// mismatches are resolved by `policy`. Deletes never conflict.
    pub(crate) fn commit(
        &self,
        changes: &ChangeSet,
        policy: MergePolicy,
    ) -> Result<CommitOutcome, CommitError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let repo = SqliteObjectRepository::new(&tx);
        let mut outcome = CommitOutcome::default();
        let mut conflicts = Vec::new();

        for object in changes.inserted() {
            match repo.version_of(object.id())? {
                None => {
                    let version = repo.insert(object)?;
                    outcome.versions.insert(object.id(), version);
                }
                Some(_) => conflicts.push(object.id()),
            }
        }

        for object in changes.updated() {
            let stored = repo.version_of(object.id())?;
            if stored == Some(object.version()) {
                let version = object.version() + 1;
                repo.write(object, version)?;
                outcome.versions.insert(object.id(), version);
                continue;
            }
            match policy {
                MergePolicy::Error => conflicts.push(object.id()),
                MergePolicy::InMemoryTrumps => {
                    let version = stored.unwrap_or(0) + 1;
                    repo.write(object, version)?;
                    outcome.versions.insert(object.id(), version);
                }
                MergePolicy::StoreTrumps => outcome.discarded.push(object.id()),
            }
        }

        if !conflicts.is_empty() {
            warn!(
                "event=store_commit module=coordinator status=conflict store={} objects={}",
                self.descriptor.name,
                conflicts.len()
            );
            return Err(CommitError::Conflict(conflicts));
        }

        for id in changes.deleted() {
            repo.delete(*id)?;
        }

        tx.commit()?;
        Ok(outcome)
    }
}

impl ObjectStore for StoreCoordinator {
    fn fetch_object(&self, id: ObjectId) -> Result<Option<ManagedObject>, ContextError> {
        let conn = self.conn.lock();
        Ok(SqliteObjectRepository::new(&conn).get(id)?)
    }

    fn fetch_entity(&self, entity: &str) -> Result<Vec<ManagedObject>, ContextError> {
        let conn = self.conn.lock();
        Ok(SqliteObjectRepository::new(&conn).list_by_entity(entity)?)
    }
}

fn open_file_connection(path: &Path) -> Result<Connection, SetupError> {
    if let Some(directory) = path.parent() {
        std::fs::create_dir_all(directory).map_err(|source| SetupError::Io {
            path: directory.to_path_buf(),
            source,
        })?;
    }
    Ok(open_store_file(path)?)
}
