//! Physical engine contract: an embedded transactional key-value store with
//! named tables and a versioned, additive-only schema.
//!
//! The conversation store never talks to SQLite (or anything else) directly;
//! it goes through [`KvBackend`] / [`KvHandle`] so the same recovery and
//! locking logic runs against the on-disk engine and the in-memory one.

pub mod memory;

use std::collections::BTreeSet;
use std::future::Future;

use tokio::sync::watch;

use super::error::{InvalidTableNameSnafu, StorageResult};

pub use memory::{MemoryBackend, MemoryHandle};

pub const CONVERSATIONS_TABLE: &str = "conversations";
pub const FOLDERS_TABLE: &str = "folders";
pub const CONVERSATIONS_BACKUP_TABLE: &str = "conversations_backup";

/// Every table the store expects, in creation order.
pub const EXPECTED_TABLES: [&str; 3] = [CONVERSATIONS_TABLE, FOLDERS_TABLE, CONVERSATIONS_BACKUP_TABLE];

/// Key of the bulk snapshot inside the conversation and backup tables.
pub const SNAPSHOT_KEY: &str = "current";

/// Layout reported by an open handle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaState {
    pub version: u32,
    pub tables: BTreeSet<String>,
}

impl SchemaState {
    pub fn has_table(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    pub fn missing_tables(&self) -> Vec<&'static str> {
        EXPECTED_TABLES
            .into_iter()
            .filter(|table| !self.has_table(table))
            .collect()
    }
}

pub trait KvBackend: Send + Sync + 'static {
    type Handle: KvHandle;

    /// Opens a new connection to the container, creating it when absent.
    fn open(&self) -> impl Future<Output = StorageResult<Self::Handle>> + Send;

    /// Physically deletes the whole container. Open handles become unusable.
    fn destroy(&self) -> impl Future<Output = StorageResult<()>> + Send;

    /// Human-readable location, for logs and health output.
    fn location(&self) -> String;
}

pub trait KvHandle: Send + Sync + 'static {
    fn schema(&self) -> impl Future<Output = StorageResult<SchemaState>> + Send;

    /// Creates `tables` (existing ones untouched) and moves the layout to
    /// `target_version`, which must be strictly greater than the current one.
    fn upgrade(
        &self,
        target_version: u32,
        tables: &[&str],
    ) -> impl Future<Output = StorageResult<SchemaState>> + Send;

    fn get(
        &self,
        table: &str,
        key: &str,
    ) -> impl Future<Output = StorageResult<Option<String>>> + Send;

    fn put(&self, table: &str, key: &str, value: &str)
    -> impl Future<Output = StorageResult<()>> + Send;

    fn delete(&self, table: &str, key: &str) -> impl Future<Output = StorageResult<()>> + Send;

    /// All `(key, value)` pairs of a table, ordered by key.
    fn scan(&self, table: &str) -> impl Future<Output = StorageResult<Vec<(String, String)>>> + Send;

    /// True once the engine has started tearing this connection down.
    fn is_closing(&self) -> bool;

    /// Fires with the new layout version when another connection upgrades.
    fn version_changes(&self) -> watch::Receiver<u32>;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Table names become SQL identifiers, so only `[a-z0-9_]` is accepted.
pub(crate) fn validate_table_name(table: &str, stage: &'static str) -> StorageResult<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|character| character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_');
    if !valid {
        return InvalidTableNameSnafu {
            stage,
            table: table.to_string(),
        }
        .fail();
    }

    Ok(())
}
