//! Stack configuration.
//!
//! # Responsibility
//! - Hold the knobs a host application may set before setup.
//! - Resolve the per-application store directory.
//!
//! # Invariants
//! - `StackOptions::default()` is always usable without I/O.
//! - `DATAKIT_STORE_DIR` overrides the platform data directory.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variable that overrides the default store directory.
pub const STORE_DIR_ENV: &str = "DATAKIT_STORE_DIR";
/// File extension of file-backed stores.
pub const STORE_FILE_EXTENSION: &str = "sqlite";

const FALLBACK_APPLICATION_NAME: &str = "datakit";

static STORE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid store name regex"));

/// Precedence rule applied when two versions of one object collide.
///
/// Collisions happen at two boundaries: a work context saving into a root
/// context that still holds uncommitted changes for the same object, and a
/// root context writing a row whose stored version moved since it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Fail the save and report the colliding objects.
    #[default]
    Error,
    /// The incoming in-memory change overwrites what the parent holds.
    InMemoryTrumps,
    /// The parent (or stored) state wins; the incoming change is dropped.
    StoreTrumps,
}

/// Options for every stack a `DataKit` sets up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackOptions {
    /// Directory component under the platform data directory.
    pub application_name: String,
    /// Explicit store directory; wins over env and platform defaults.
    pub store_directory: Option<PathBuf>,
    pub merge_policy: MergePolicy,
    /// Thread name prefix of root context queues.
    pub root_queue_label: String,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            application_name: default_application_name(),
            store_directory: None,
            merge_policy: MergePolicy::default(),
            root_queue_label: "datakit-root".to_string(),
        }
    }
}

impl StackOptions {
    pub fn with_merge_policy(mut self, merge_policy: MergePolicy) -> Self {
        self.merge_policy = merge_policy;
        self
    }

    pub fn with_store_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.store_directory = Some(directory.into());
        self
    }

    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    /// Store name used by `setup_automigrating_stack`.
    pub fn default_store_name(&self) -> &str {
        &self.application_name
    }

    /// Resolves the directory that holds store files.
    ///
    /// Order: explicit option, `DATAKIT_STORE_DIR`, platform data directory
    /// joined with the application name. `None` when no platform directory
    /// exists.
    pub fn resolve_store_directory(&self) -> Option<PathBuf> {
        if let Some(directory) = &self.store_directory {
            return Some(directory.clone());
        }
        if let Some(directory) = std::env::var_os(STORE_DIR_ENV).filter(|value| !value.is_empty())
        {
            return Some(PathBuf::from(directory));
        }
        dirs::data_dir().map(|base| base.join(&self.application_name))
    }
}

/// Returns whether `name` can be used as a store file stem.
pub fn is_valid_store_name(name: &str) -> bool {
    STORE_NAME_RE.is_match(name)
}

/// Application name derived from the running executable.
fn default_application_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
        .filter(|stem| is_valid_store_name(stem))
        .unwrap_or_else(|| FALLBACK_APPLICATION_NAME.to_string())
}
