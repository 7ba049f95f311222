use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tokio::time::Instant;

use super::backend::{KvBackend, KvHandle, SchemaState};
use super::error::{StorageError, StorageResult};

const BLOCKED_RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Owns the layout version and the cached physical handle.
///
/// Migration is additive only: missing tables are created, nothing is ever
/// dropped or renamed. A layout newer than the one asked for (another context
/// upgraded it) is adopted rather than downgraded.
pub struct SchemaMigrator<B: KvBackend> {
    backend: B,
    handle: ArcSwapOption<B::Handle>,
    version_rx: Mutex<Option<watch::Receiver<u32>>>,
    base_version: u32,
    effective_version: AtomicU32,
    blocked_wait: Duration,
}

impl<B: KvBackend> SchemaMigrator<B> {
    pub fn new(backend: B, base_version: u32, blocked_wait: Duration) -> Self {
        Self {
            backend,
            handle: ArcSwapOption::empty(),
            version_rx: Mutex::new(None),
            base_version,
            effective_version: AtomicU32::new(base_version),
            blocked_wait,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Highest layout version seen so far; never below the configured one.
    pub fn effective_version(&self) -> u32 {
        self.effective_version.load(Ordering::SeqCst)
    }

    /// Forgets adopted versions, used once the container has been destroyed.
    pub fn reset_effective_version(&self) {
        self.effective_version.store(self.base_version, Ordering::SeqCst);
    }

    /// The cached handle, unless it is closing or another context changed the
    /// layout since it was opened. A stale handle is closed and dropped.
    pub async fn live_handle(&self) -> Option<Arc<B::Handle>> {
        let handle = self.handle.load_full()?;
        if handle.is_closing() {
            tracing::debug!("cached store handle is closing; dropping it");
            self.invalidate().await;
            return None;
        }

        if self.version_changed() {
            tracing::info!("store layout changed in another context; reopening");
            self.invalidate().await;
            return None;
        }

        Some(handle)
    }

    pub async fn invalidate(&self) {
        if let Some(handle) = self.handle.swap(None) {
            handle.close().await;
        }
        *self
            .version_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }

    /// Opens (or reuses) the handle and brings the layout to at least
    /// `desired_version`.
    pub async fn ensure_schema(
        &self,
        desired_version: u32,
    ) -> StorageResult<(Arc<B::Handle>, SchemaState)> {
        let handle = match self.live_handle().await {
            Some(handle) => handle,
            None => Arc::new(self.backend.open().await?),
        };

        let mut state = handle.schema().await?;
        let target = desired_version.max(self.effective_version());

        if state.version > target {
            tracing::info!(
                on_disk = state.version,
                expected = target,
                "adopting newer store layout"
            );
        } else if state.version < target {
            let missing = state.missing_tables();
            tracing::info!(from = state.version, to = target, ?missing, "upgrading store layout");
            state = self.upgrade_with_wait(handle.as_ref(), target, &missing).await?;
        } else if !state.missing_tables().is_empty() {
            tracing::warn!(
                version = state.version,
                missing = ?state.missing_tables(),
                "store layout is current but tables are missing"
            );
        }

        self.effective_version.fetch_max(state.version, Ordering::SeqCst);
        *self
            .version_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle.version_changes());
        if let Some(previous) = self.handle.swap(Some(Arc::clone(&handle)))
            && !Arc::ptr_eq(&previous, &handle)
        {
            tracing::debug!("closing a store handle opened concurrently");
            previous.close().await;
        }

        Ok((handle, state))
    }

    /// Moves the layout one version past everything seen so far, which is the
    /// only way engines allow new tables to appear.
    pub async fn bump_and_migrate(&self) -> StorageResult<(Arc<B::Handle>, SchemaState)> {
        let (handle, state) = self.ensure_schema(self.effective_version()).await?;
        if state.missing_tables().is_empty() {
            return Ok((handle, state));
        }

        let target = state.version.max(self.effective_version()) + 1;
        self.ensure_schema(target).await
    }

    async fn upgrade_with_wait(
        &self,
        handle: &B::Handle,
        target_version: u32,
        tables: &[&str],
    ) -> StorageResult<SchemaState> {
        let deadline = Instant::now() + self.blocked_wait;
        let mut reported = false;
        loop {
            match handle.upgrade(target_version, tables).await {
                Err(StorageError::UpgradeBlocked { .. }) if Instant::now() < deadline => {
                    if !reported {
                        tracing::warn!(
                            version = target_version,
                            "store upgrade blocked by another open connection; waiting"
                        );
                        reported = true;
                    }
                    tokio::time::sleep(BLOCKED_RETRY_INTERVAL).await;
                }
                other => return other,
            }
        }
    }

    fn version_changed(&self) -> bool {
        self.version_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|receiver| receiver.has_changed().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CONVERSATIONS_TABLE, EXPECTED_TABLES, MemoryBackend};

    fn migrator(backend: &MemoryBackend, version: u32) -> SchemaMigrator<MemoryBackend> {
        SchemaMigrator::new(backend.clone(), version, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn fresh_store_gets_every_table() {
        let backend = MemoryBackend::new();
        let migrator = migrator(&backend, 1);
        let (_, state) = migrator.ensure_schema(1).await.expect("ensure");
        assert_eq!(state.version, 1);
        assert!(state.missing_tables().is_empty());
    }

    #[tokio::test]
    async fn handle_is_reused_until_invalidated() {
        let backend = MemoryBackend::new();
        let migrator = migrator(&backend, 1);
        let (first, _) = migrator.ensure_schema(1).await.expect("ensure");
        let (second, _) = migrator.ensure_schema(1).await.expect("ensure again");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.open_handles(), 1);
    }

    #[tokio::test]
    async fn newer_layout_from_another_context_is_adopted() {
        let backend = MemoryBackend::new();
        let migrator = migrator(&backend, 1);
        migrator.ensure_schema(1).await.expect("ensure");

        backend.upgrade_from_other_context(5, &EXPECTED_TABLES);
        assert!(migrator.live_handle().await.is_none(), "version change invalidates");

        let (_, state) = migrator.ensure_schema(1).await.expect("reopen");
        assert_eq!(state.version, 5);
        assert_eq!(migrator.effective_version(), 5);
    }

    #[tokio::test]
    async fn missing_table_needs_a_version_bump() {
        let backend = MemoryBackend::new();
        let migrator = migrator(&backend, 1);
        migrator.ensure_schema(1).await.expect("ensure");
        backend.drop_table(CONVERSATIONS_TABLE);

        let (_, state) = migrator.ensure_schema(1).await.expect("same version");
        assert_eq!(state.missing_tables(), vec![CONVERSATIONS_TABLE]);

        let (_, state) = migrator.bump_and_migrate().await.expect("bump");
        assert_eq!(state.version, 2);
        assert!(state.missing_tables().is_empty());
    }

    #[tokio::test]
    async fn displaced_handle_is_closed() {
        let backend = MemoryBackend::new();
        backend.set_upgrades_blocked(true);
        let migrator = SchemaMigrator::new(backend.clone(), 0, Duration::from_secs(5));

        // The upgrade waits on its own handle while a second caller opens another.
        let (upgraded, displaced) = tokio::join!(migrator.ensure_schema(1), async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let opened = migrator.ensure_schema(0).await;
            backend.set_upgrades_blocked(false);
            opened
        });
        let (upgraded, _) = upgraded.expect("upgrade");
        let (displaced, _) = displaced.expect("second open");

        assert!(displaced.is_closing());
        assert!(!upgraded.is_closing());
        let live = migrator.live_handle().await.expect("live");
        assert!(Arc::ptr_eq(&live, &upgraded));
        assert_eq!(backend.open_handles(), 1);
    }

    #[tokio::test]
    async fn blocked_upgrade_surfaces_after_bounded_wait() {
        let backend = MemoryBackend::new();
        backend.set_upgrades_blocked(true);
        let migrator = migrator(&backend, 1);

        let error = migrator.ensure_schema(1).await.expect_err("blocked");
        assert!(matches!(error, StorageError::UpgradeBlocked { target_version: 1, .. }));
    }
}
