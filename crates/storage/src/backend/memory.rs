use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::watch;

use super::{KvBackend, KvHandle, SchemaState, validate_table_name};
use crate::error::{
    ConnectionClosingSnafu, SchemaUpgradeSnafu, StorageResult, StoreNotFoundSnafu,
    TransactionSnafu, UpgradeBlockedSnafu,
};

#[derive(Debug, Default)]
struct Container {
    version: u32,
    tables: BTreeMap<String, BTreeMap<String, String>>,
}

impl Container {
    fn schema(&self) -> SchemaState {
        SchemaState {
            version: self.version,
            tables: self.tables.keys().cloned().collect::<BTreeSet<_>>(),
        }
    }
}

#[derive(Debug, Default)]
struct HandleState {
    closing: AtomicBool,
}

#[derive(Debug)]
struct Shared {
    container: Mutex<Container>,
    handles: Mutex<Vec<Weak<HandleState>>>,
    version_tx: watch::Sender<u32>,
    upgrades_blocked: AtomicBool,
    aborted_writes: AtomicU32,
}

/// Process-local engine. Clones share one container, the way several tabs
/// share one browser database.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (version_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                container: Mutex::new(Container::default()),
                handles: Mutex::new(Vec::new()),
                version_tx,
                upgrades_blocked: AtomicBool::new(false),
                aborted_writes: AtomicU32::new(0),
            }),
        }
    }

    /// Removes a table outright, reproducing engines that lose object stores
    /// during a botched migration.
    pub fn drop_table(&self, table: &str) {
        lock_container(&self.shared).tables.remove(table);
    }

    /// Marks every open handle as closing, as the engine does when the
    /// connection is torn down underneath its users.
    pub fn sever_connections(&self) {
        for handle in live_handles(&self.shared) {
            handle.closing.store(true, Ordering::SeqCst);
        }
    }

    /// Upgrades the layout from a different execution context and notifies
    /// every open handle.
    pub fn upgrade_from_other_context(&self, target_version: u32, tables: &[&str]) {
        let mut container = lock_container(&self.shared);
        container.version = container.version.max(target_version);
        for table in tables {
            container.tables.entry((*table).to_string()).or_default();
        }
        let version = container.version;
        drop(container);
        self.shared.version_tx.send_replace(version);
    }

    /// While set, every upgrade reports that another connection blocks it.
    pub fn set_upgrades_blocked(&self, blocked: bool) {
        self.shared.upgrades_blocked.store(blocked, Ordering::SeqCst);
    }

    /// The next `count` writes abort as failed transactions.
    pub fn abort_next_writes(&self, count: u32) {
        self.shared.aborted_writes.store(count, Ordering::SeqCst);
    }

    pub fn raw_get(&self, table: &str, key: &str) -> Option<String> {
        lock_container(&self.shared)
            .tables
            .get(table)
            .and_then(|rows| rows.get(key).cloned())
    }

    pub fn raw_put(&self, table: &str, key: &str, value: &str) {
        lock_container(&self.shared)
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn open_handles(&self) -> usize {
        live_handles(&self.shared)
            .iter()
            .filter(|handle| !handle.closing.load(Ordering::SeqCst))
            .count()
    }
}

impl KvBackend for MemoryBackend {
    type Handle = MemoryHandle;

    async fn open(&self) -> StorageResult<MemoryHandle> {
        let state = Arc::new(HandleState::default());
        let mut handles = self
            .shared
            .handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handles.retain(|handle| handle.strong_count() > 0);
        handles.push(Arc::downgrade(&state));

        Ok(MemoryHandle {
            shared: Arc::clone(&self.shared),
            state,
        })
    }

    async fn destroy(&self) -> StorageResult<()> {
        self.sever_connections();
        *lock_container(&self.shared) = Container::default();
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

#[derive(Debug)]
pub struct MemoryHandle {
    shared: Arc<Shared>,
    state: Arc<HandleState>,
}

impl MemoryHandle {
    fn ensure_open(&self, stage: &'static str) -> StorageResult<()> {
        if self.is_closing() {
            return ConnectionClosingSnafu { stage }.fail();
        }
        Ok(())
    }

    fn ensure_write_allowed(&self, stage: &'static str) -> StorageResult<()> {
        let aborted = self
            .shared
            .aborted_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if aborted {
            return TransactionSnafu {
                stage,
                details: "write transaction aborted by the engine".to_string(),
            }
            .fail();
        }
        Ok(())
    }
}

impl KvHandle for MemoryHandle {
    async fn schema(&self) -> StorageResult<SchemaState> {
        self.ensure_open("memory-schema")?;
        Ok(lock_container(&self.shared).schema())
    }

    async fn upgrade(&self, target_version: u32, tables: &[&str]) -> StorageResult<SchemaState> {
        self.ensure_open("memory-upgrade")?;
        for table in tables {
            validate_table_name(table, "memory-upgrade-table-name")?;
        }
        if self.shared.upgrades_blocked.load(Ordering::SeqCst) {
            return UpgradeBlockedSnafu {
                stage: "memory-upgrade-blocked",
                target_version,
            }
            .fail();
        }

        let mut container = lock_container(&self.shared);
        if target_version <= container.version {
            return SchemaUpgradeSnafu {
                stage: "memory-upgrade-version",
                details: format!(
                    "target version {target_version} does not exceed current version {}",
                    container.version
                ),
            }
            .fail();
        }
        for table in tables {
            container.tables.entry((*table).to_string()).or_default();
        }
        container.version = target_version;
        let schema = container.schema();
        drop(container);

        self.shared.version_tx.send_replace(target_version);
        Ok(schema)
    }

    async fn get(&self, table: &str, key: &str) -> StorageResult<Option<String>> {
        self.ensure_open("memory-get")?;
        let container = lock_container(&self.shared);
        let rows = container.tables.get(table).context_missing(table, "memory-get-table")?;
        Ok(rows.get(key).cloned())
    }

    async fn put(&self, table: &str, key: &str, value: &str) -> StorageResult<()> {
        self.ensure_open("memory-put")?;
        self.ensure_write_allowed("memory-put-commit")?;
        let mut container = lock_container(&self.shared);
        let rows = container
            .tables
            .get_mut(table)
            .context_missing(table, "memory-put-table")?;
        rows.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> StorageResult<()> {
        self.ensure_open("memory-delete")?;
        self.ensure_write_allowed("memory-delete-commit")?;
        let mut container = lock_container(&self.shared);
        let rows = container
            .tables
            .get_mut(table)
            .context_missing(table, "memory-delete-table")?;
        rows.remove(key);
        Ok(())
    }

    async fn scan(&self, table: &str) -> StorageResult<Vec<(String, String)>> {
        self.ensure_open("memory-scan")?;
        let container = lock_container(&self.shared);
        let rows = container.tables.get(table).context_missing(table, "memory-scan-table")?;
        Ok(rows
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn is_closing(&self) -> bool {
        self.state.closing.load(Ordering::SeqCst)
    }

    fn version_changes(&self) -> watch::Receiver<u32> {
        self.shared.version_tx.subscribe()
    }

    async fn close(&self) {
        self.state.closing.store(true, Ordering::SeqCst);
    }
}

trait MissingTableExt<T> {
    fn context_missing(self, table: &str, stage: &'static str) -> StorageResult<T>;
}

impl<T> MissingTableExt<T> for Option<T> {
    fn context_missing(self, table: &str, stage: &'static str) -> StorageResult<T> {
        match self {
            Some(value) => Ok(value),
            None => StoreNotFoundSnafu {
                stage,
                table: table.to_string(),
            }
            .fail(),
        }
    }
}

fn lock_container(shared: &Shared) -> MutexGuard<'_, Container> {
    // A panic while holding the guard cannot leave the maps half-written.
    shared
        .container
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn live_handles(shared: &Shared) -> Vec<Arc<HandleState>> {
    shared
        .handles
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .iter()
        .filter_map(Weak::upgrade)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CONVERSATIONS_TABLE, EXPECTED_TABLES};
    use crate::error::StorageError;

    #[tokio::test]
    async fn upgrade_is_additive_and_version_must_grow() {
        let backend = MemoryBackend::new();
        let handle = backend.open().await.expect("open");

        let schema = handle.upgrade(1, &[CONVERSATIONS_TABLE]).await.expect("upgrade");
        assert_eq!(schema.version, 1);
        handle.put(CONVERSATIONS_TABLE, "current", "[]").await.expect("put");

        let schema = handle.upgrade(2, &EXPECTED_TABLES).await.expect("upgrade again");
        assert_eq!(schema.tables.len(), 3);
        assert_eq!(
            handle.get(CONVERSATIONS_TABLE, "current").await.expect("get"),
            Some("[]".to_string())
        );

        let error = handle.upgrade(2, &EXPECTED_TABLES).await.expect_err("same version");
        assert!(matches!(error, StorageError::SchemaUpgrade { .. }));
    }

    #[tokio::test]
    async fn severed_handles_report_closing() {
        let backend = MemoryBackend::new();
        let handle = backend.open().await.expect("open");
        assert_eq!(backend.open_handles(), 1);

        backend.sever_connections();
        let error = handle.schema().await.expect_err("closing");
        assert!(error.is_connection_closing());
        assert_eq!(backend.open_handles(), 0);
    }

    #[tokio::test]
    async fn missing_tables_surface_as_store_not_found() {
        let backend = MemoryBackend::new();
        let handle = backend.open().await.expect("open");
        let error = handle.get(CONVERSATIONS_TABLE, "current").await.expect_err("missing");
        assert!(error.is_structural());
    }
}
