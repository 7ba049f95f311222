use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use snafu::ResultExt;

use super::backend::{
    CONVERSATIONS_TABLE, FOLDERS_TABLE, KvBackend, KvHandle, MemoryBackend, SNAPSHOT_KEY,
};
use super::backup::BackupManager;
use super::config::StoreConfig;
use super::error::{
    EncodeSnapshotSnafu, FolderCycleSnafu, InitFailedSnafu, InvalidConversationSnafu, NotFoundSnafu,
    SaveInProgressSnafu, StorageError, StorageResult,
};
use super::fallback::{FileSlot, MemorySlot, SnapshotSlot};
use super::ids::{ConversationId, FolderId};
use super::lock::{LockCoordinator, LockScope};
use super::merge::merge_conversations;
use super::recovery::{Diagnosis, RecoveryAction, RecoveryOrchestrator};
use super::schema::SchemaMigrator;
use super::snapshot::{decode_conversations, decode_folder, encode_conversations};
use super::sqlite::SqliteBackend;
use super::types::{Conversation, Folder, HealthReport, HealthStatus, unix_timestamp_millis};

#[derive(Debug, Default)]
struct InitState {
    generation: u64,
    last_failure: Option<String>,
}

/// Clears the in-flight flag however the save ends.
struct SaveInFlight<'a>(&'a AtomicBool);

impl<'a> SaveInFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for SaveInFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The authoritative read/write API for conversations and folders.
///
/// Lifecycle: construct, `init`, operate, `close`. A closed store re-opens on
/// next use. Scopes are always taken in the order write, read, init.
pub struct ConversationStore<B: KvBackend, S: SnapshotSlot> {
    config: StoreConfig,
    migrator: SchemaMigrator<B>,
    backup: BackupManager<S>,
    locks: LockCoordinator,
    init_state: Mutex<InitState>,
    ever_initialized: AtomicBool,
    save_in_flight: AtomicBool,
}

impl ConversationStore<SqliteBackend, FileSlot> {
    /// On-disk store at `config.database_path`, fallback slot in `config.fallback_dir`.
    pub fn open(config: StoreConfig) -> Self {
        let backend = SqliteBackend::new(
            &config.database_path.to_string_lossy(),
            config.upgrade_blocked_wait(),
        );
        let slot = FileSlot::new(config.fallback_dir.clone());
        Self::new(config, backend, slot)
    }
}

impl ConversationStore<MemoryBackend, MemorySlot> {
    pub fn in_memory(config: StoreConfig) -> Self {
        Self::new(config, MemoryBackend::new(), MemorySlot::new())
    }
}

impl<B: KvBackend, S: SnapshotSlot> ConversationStore<B, S> {
    pub fn new(config: StoreConfig, backend: B, slot: S) -> Self {
        let locks = match config.lock_dir.as_deref() {
            Some(dir) => LockCoordinator::with_lock_dir(dir),
            None => LockCoordinator::in_process(),
        };

        Self {
            migrator: SchemaMigrator::new(backend, config.schema_version, config.upgrade_blocked_wait()),
            backup: BackupManager::new(slot),
            locks,
            init_state: Mutex::new(InitState::default()),
            ever_initialized: AtomicBool::new(false),
            save_in_flight: AtomicBool::new(false),
            config,
        }
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    /// Idempotent. Callers that queued behind a running attempt get that
    /// attempt's outcome instead of starting another one.
    pub async fn init(&self) -> StorageResult<()> {
        let observed_generation = self.init_generation();
        let _init = self.locks.acquire(LockScope::Init).await;

        if self.migrator.live_handle().await.is_some() {
            return Ok(());
        }

        {
            let state = self.lock_init_state();
            if state.generation != observed_generation
                && let Some(details) = state.last_failure.clone()
            {
                return InitFailedSnafu {
                    stage: "init-shared-attempt",
                    details,
                }
                .fail();
            }
        }

        let result = self.run_init().await;
        {
            let mut state = self.lock_init_state();
            state.generation += 1;
            state.last_failure = result.as_ref().err().map(ToString::to_string);
        }
        if result.is_ok() {
            self.ever_initialized.store(true, Ordering::SeqCst);
            tracing::info!(
                location = %self.migrator.backend().location(),
                version = self.migrator.effective_version(),
                "conversation store ready"
            );
        }

        result
    }

    async fn run_init(&self) -> StorageResult<()> {
        let attempts = self.config.init_retries.max(1);
        for attempt in 0..attempts {
            match self.open_verified().await {
                Ok(()) => return Ok(()),
                Err(error @ StorageError::UpgradeBlocked { .. }) => return Err(error),
                Err(error) => {
                    tracing::warn!(attempt = attempt + 1, attempts, "store initialization failed: {error}");
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.config.init_backoff(attempt)).await;
                    }
                }
            }
        }

        tracing::warn!("initialization retries exhausted; escalating to recovery");
        self.recovery().recover().await?;
        self.open_verified().await
    }

    async fn open_verified(&self) -> StorageResult<()> {
        let (_, state) = self.migrator.ensure_schema(self.config.schema_version).await?;
        if state.missing_tables().is_empty() {
            return Ok(());
        }

        self.recovery().recover().await?;
        let (_, state) = self.migrator.ensure_schema(self.config.schema_version).await?;
        let missing = state.missing_tables();
        if !missing.is_empty() {
            return InitFailedSnafu {
                stage: "init-verify-tables",
                details: format!("tables still missing after recovery: {missing:?}"),
            }
            .fail();
        }

        Ok(())
    }

    /// Active, structurally valid conversations. Only fails when the store
    /// has never been initialized; otherwise degrades to the backup, then to
    /// an empty list.
    pub async fn get_conversations(&self) -> StorageResult<Vec<Conversation>> {
        Ok(self
            .get_conversation_records()
            .await?
            .into_iter()
            .filter(|conversation| conversation.is_active)
            .collect())
    }

    /// Like [`Self::get_conversations`] but keeps soft-deleted records.
    pub async fn get_conversation_records(&self) -> StorageResult<Vec<Conversation>> {
        let primary = {
            let _read = self.locks.acquire(LockScope::Read).await;
            self.read_snapshot_resilient().await
        };

        match primary {
            Ok(Some(records)) => Ok(records),
            Ok(None) => Ok(self.restore_from_backup().await),
            Err(error) if !self.ever_initialized.load(Ordering::SeqCst) => Err(error),
            Err(error) => {
                tracing::warn!("conversation snapshot unavailable ({error}); serving backup");
                Ok(self.restore_from_backup().await)
            }
        }
    }

    /// Writes the mirror back as the primary snapshot when the primary is
    /// absent or unreadable; a readable primary is returned untouched. Never
    /// fails; an empty list means nothing was found.
    pub async fn restore_from_backup(&self) -> Vec<Conversation> {
        let _write = self.locks.acquire(LockScope::Write).await;
        let _read = self.locks.acquire(LockScope::Read).await;
        self.restore_locked().await
    }

    pub async fn save_conversations(&self, conversations: Vec<Conversation>) -> StorageResult<()> {
        let _write = self.locks.acquire(LockScope::Write).await;
        let _read = self.locks.acquire(LockScope::Read).await;
        self.save_locked(conversations).await.map(|_| ())
    }

    /// Fails with `SaveInProgress` instead of queueing behind another writer.
    pub async fn try_save_conversations(&self, conversations: Vec<Conversation>) -> StorageResult<()> {
        let Some(_write) = self.locks.try_acquire(LockScope::Write) else {
            return SaveInProgressSnafu {
                stage: "try-save-conversations",
            }
            .fail();
        };
        let _read = self.locks.acquire(LockScope::Read).await;
        self.save_locked(conversations).await.map(|_| ())
    }

    /// Adds conversations whose ids are not stored yet (tombstones count as
    /// stored) in one write critical section. Returns how many were added
    /// and how many were skipped as duplicates.
    pub(crate) async fn merge_new_conversations(
        &self,
        incoming: Vec<Conversation>,
    ) -> StorageResult<(usize, usize)> {
        let _write = self.locks.acquire(LockScope::Write).await;
        let _read = self.locks.acquire(LockScope::Read).await;

        let existing = match self.read_snapshot_resilient().await {
            Ok(Some(records)) => records,
            Ok(None) => self.load_backup().await,
            Err(error) if !self.ever_initialized.load(Ordering::SeqCst) => return Err(error),
            Err(error) => {
                tracing::warn!("conversation snapshot unavailable ({error}); merging into backup");
                self.load_backup().await
            }
        };

        let mut known = existing
            .iter()
            .map(|conversation| conversation.id.clone())
            .collect::<HashSet<_>>();
        let mut fresh = Vec::with_capacity(incoming.len());
        let mut duplicates = 0;
        for conversation in incoming {
            if known.insert(conversation.id.clone()) {
                fresh.push(conversation);
            } else {
                duplicates += 1;
            }
        }

        let added = fresh.len();
        if added > 0 {
            self.save_locked(merge_conversations(existing, fresh)).await?;
        }
        Ok((added, duplicates))
    }

    pub fn save_in_flight(&self) -> bool {
        self.save_in_flight.load(Ordering::SeqCst)
    }

    pub async fn get_folders(&self) -> StorageResult<Vec<Folder>> {
        let _read = self.locks.acquire(LockScope::Read).await;
        self.load_folders().await
    }

    /// Inserts or replaces `folder`. The parent must exist and the parent
    /// chain may not lead back to the folder itself.
    pub async fn save_folder(&self, mut folder: Folder) -> StorageResult<Folder> {
        let _write = self.locks.acquire(LockScope::Write).await;
        let _read = self.locks.acquire(LockScope::Read).await;

        let folders = self
            .load_folders()
            .await?
            .into_iter()
            .map(|folder| (folder.id.clone(), folder))
            .collect::<HashMap<_, _>>();
        check_folder_parent(&folder, &folders)?;

        let now = unix_timestamp_millis();
        if folder.created_at == 0 {
            folder.created_at = folders.get(&folder.id).map_or(now, |existing| existing.created_at);
        }
        folder.updated_at = now;

        let payload = serde_json::to_string(&folder).context(EncodeSnapshotSnafu { stage: "save-folder-encode" })?;
        let payload = payload.as_str();
        let key = folder.id.as_str();
        self.with_recovery("save-folder", || {
            self.with_live_handle("save-folder", |handle| async move { handle.put(FOLDERS_TABLE, key, payload).await })
        })
        .await?;

        tracing::debug!(folder_id = %folder.id, "folder saved");
        Ok(folder)
    }

    /// Removes the folder record only; conversations filed under it keep
    /// their `folder_id` until the caller moves them.
    pub async fn delete_folder(&self, folder_id: &FolderId) -> StorageResult<()> {
        let _write = self.locks.acquire(LockScope::Write).await;
        let _read = self.locks.acquire(LockScope::Read).await;

        let key = folder_id.as_str();
        self.with_recovery("delete-folder", || {
            self.with_live_handle("delete-folder", |handle| async move { handle.delete(FOLDERS_TABLE, key).await })
        })
        .await
    }

    /// Returns whether an active conversation with that id was found.
    pub async fn move_conversation_to_folder(
        &self,
        conversation_id: &ConversationId,
        folder_id: Option<&FolderId>,
    ) -> StorageResult<bool> {
        let _write = self.locks.acquire(LockScope::Write).await;
        let _read = self.locks.acquire(LockScope::Read).await;

        if let Some(folder_id) = folder_id {
            let known = self
                .load_folders()
                .await?
                .iter()
                .any(|folder| &folder.id == folder_id);
            if !known {
                return NotFoundSnafu {
                    stage: "move-conversation-folder",
                    entity: "folder",
                    id: folder_id.to_string(),
                }
                .fail();
            }
        }

        let mut records = self.read_snapshot_resilient().await?.unwrap_or_default();
        let Some(conversation) = records
            .iter_mut()
            .find(|conversation| conversation.is_active && &conversation.id == conversation_id)
        else {
            return Ok(false);
        };
        conversation.folder_id = folder_id.cloned();

        self.save_locked(records).await?;
        Ok(true)
    }

    /// Clears the attempt counter first, so an explicit repair always runs.
    pub async fn repair_database(&self) -> StorageResult<RecoveryAction> {
        let _write = self.locks.acquire(LockScope::Write).await;
        let _read = self.locks.acquire(LockScope::Read).await;
        let _init = self.locks.acquire(LockScope::Init).await;

        let orchestrator = self.recovery();
        orchestrator.reset_attempts()?;
        let action = orchestrator.recover().await?;
        self.ever_initialized.store(true, Ordering::SeqCst);
        Ok(action)
    }

    /// Destroys the container and the fallback copy, then recreates an empty
    /// store at the configured version.
    pub async fn force_reset(&self) -> StorageResult<()> {
        let _write = self.locks.acquire(LockScope::Write).await;
        let _read = self.locks.acquire(LockScope::Read).await;
        let _init = self.locks.acquire(LockScope::Init).await;

        tracing::warn!(location = %self.migrator.backend().location(), "force-resetting conversation store");
        self.migrator.invalidate().await;
        self.migrator.backend().destroy().await?;
        self.backup.clear_slot()?;
        self.recovery().reset_attempts()?;
        self.migrator.reset_effective_version();

        let (_, state) = self.migrator.ensure_schema(self.config.schema_version).await?;
        let missing = state.missing_tables();
        if !missing.is_empty() {
            return InitFailedSnafu {
                stage: "force-reset-verify",
                details: format!("tables missing after reset: {missing:?}"),
            }
            .fail();
        }

        self.ever_initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Diagnosis only: never repairs or rebuilds, though a brand-new store
    /// gets its initial layout.
    pub async fn check_database_health(&self) -> HealthReport {
        let _read = self.locks.acquire(LockScope::Read).await;
        let orchestrator = self.recovery();
        let mut report = HealthReport {
            status: HealthStatus::Unavailable,
            schema_version: None,
            tables: Vec::new(),
            missing_tables: Vec::new(),
            conversation_records: 0,
            active_conversations: 0,
            backup_conversations: 0,
            folders: 0,
            recovery_attempts: orchestrator.attempts(),
            save_in_flight: self.save_in_flight(),
            details: None,
        };

        match orchestrator.diagnose().await {
            Ok(Diagnosis::Healthy) => report.status = HealthStatus::Healthy,
            Ok(Diagnosis::Repairable { botched_migration, .. }) => {
                report.status = HealthStatus::Repairable;
                if botched_migration {
                    report.details = Some("dependent tables exist without the conversations table".to_string());
                }
            }
            Ok(Diagnosis::Corrupt { reason }) => {
                report.status = HealthStatus::Corrupt;
                report.details = Some(reason);
            }
            Err(error) => {
                report.details = Some(error.to_string());
                return report;
            }
        }

        let Some(handle) = self.migrator.live_handle().await else {
            return report;
        };
        if let Ok(state) = handle.schema().await {
            report.schema_version = Some(state.version);
            report.missing_tables = state.missing_tables().into_iter().map(str::to_string).collect();
            report.tables = state.tables.into_iter().collect();
        }
        if let Ok(Some(raw)) = handle.get(CONVERSATIONS_TABLE, SNAPSHOT_KEY).await
            && let Ok(decoded) = decode_conversations(&raw, CONVERSATIONS_TABLE, "health-conversations")
        {
            report.conversation_records = decoded.conversations.len();
            report.active_conversations = decoded
                .conversations
                .iter()
                .filter(|conversation| conversation.is_active)
                .count();
        }
        if let Ok(backup) = self.backup.read_table(handle.as_ref()).await {
            report.backup_conversations = backup.len();
        }
        if let Ok(rows) = handle.scan(FOLDERS_TABLE).await {
            report.folders = rows.len();
        }

        report
    }

    /// Releases the live handle; the next operation re-opens it.
    pub async fn close(&self) {
        self.migrator.invalidate().await;
        tracing::debug!("conversation store closed");
    }

    fn recovery(&self) -> RecoveryOrchestrator<'_, B, S> {
        RecoveryOrchestrator::new(&self.migrator, &self.backup, self.config.max_recovery_attempts)
    }

    async fn run_recovery(&self) -> StorageResult<RecoveryAction> {
        let _init = self.locks.acquire(LockScope::Init).await;
        self.recovery().recover().await
    }

    fn init_generation(&self) -> u64 {
        self.lock_init_state().generation
    }

    fn lock_init_state(&self) -> std::sync::MutexGuard<'_, InitState> {
        self.init_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn ready_handle(&self, stage: &'static str) -> StorageResult<Arc<B::Handle>> {
        if let Some(handle) = self.migrator.live_handle().await {
            return Ok(handle);
        }

        self.init().await?;
        match self.migrator.live_handle().await {
            Some(handle) => Ok(handle),
            None => InitFailedSnafu {
                stage,
                details: "store handle closed right after initialization".to_string(),
            }
            .fail(),
        }
    }

    /// Runs `operation` on the live handle; a closing connection gets one
    /// fresh `init` and one retry.
    async fn with_live_handle<T, F, Fut>(&self, stage: &'static str, operation: F) -> StorageResult<T>
    where
        F: Fn(Arc<B::Handle>) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let handle = self.ready_handle(stage).await?;
        match operation(handle).await {
            Err(error) if error.is_connection_closing() => {
                tracing::warn!(stage, "store connection closed mid-operation; reopening");
                self.migrator.invalidate().await;
                let handle = self.ready_handle(stage).await?;
                operation(handle).await
            }
            other => other,
        }
    }

    /// A missing table triggers one recovery and one retry.
    async fn with_recovery<T, F, Fut>(&self, stage: &'static str, operation: F) -> StorageResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        match operation().await {
            Err(error) if error.is_structural() => {
                tracing::warn!(stage, "store structure damaged ({error}); recovering");
                self.run_recovery().await?;
                operation().await
            }
            other => other,
        }
    }

    async fn read_primary(&self) -> StorageResult<Option<Vec<Conversation>>> {
        self.with_live_handle("get-conversations", |handle| async move {
            let Some(raw) = handle.get(CONVERSATIONS_TABLE, SNAPSHOT_KEY).await? else {
                return Ok(None);
            };
            let decoded = decode_conversations(&raw, CONVERSATIONS_TABLE, "get-conversations-decode")?;
            if decoded.invalid > 0 {
                tracing::warn!(dropped = decoded.invalid, "filtered malformed conversations from snapshot");
            }
            Ok::<_, StorageError>(Some(decoded.conversations))
        })
        .await
    }

    /// `None` when the snapshot key was never written. Any read failure on an
    /// initialized store runs recovery once before giving up.
    async fn read_snapshot_resilient(&self) -> StorageResult<Option<Vec<Conversation>>> {
        match self.read_primary().await {
            Ok(records) => Ok(records),
            Err(error) if !self.ever_initialized.load(Ordering::SeqCst) => Err(error),
            Err(error) => {
                tracing::warn!("conversation snapshot unreadable ({error}); running recovery");
                self.run_recovery().await?;
                self.read_primary().await
            }
        }
    }

    async fn load_backup(&self) -> Vec<Conversation> {
        let handle = self.migrator.live_handle().await;
        self.backup.load_snapshot(handle.as_deref()).await
    }

    /// Caller holds the write and read scopes. Re-reads the primary under
    /// those scopes so a save that committed meanwhile is never overwritten.
    async fn restore_locked(&self) -> Vec<Conversation> {
        match self.read_primary().await {
            Ok(Some(records)) => return records,
            Ok(None) => {}
            Err(error) => tracing::warn!("primary snapshot unreadable during restore: {error}"),
        }

        let snapshot = self.load_backup().await;
        if snapshot.is_empty() {
            return snapshot;
        }

        tracing::info!(conversations = snapshot.len(), "restoring conversations from backup");
        match self.save_locked(snapshot.clone()).await {
            Ok(saved) => saved,
            Err(error) => {
                tracing::warn!("failed to write restored conversations back: {error}");
                snapshot
            }
        }
    }

    async fn load_folders(&self) -> StorageResult<Vec<Folder>> {
        let rows = self
            .with_recovery("get-folders", || {
                self.with_live_handle("get-folders", |handle| async move { handle.scan(FOLDERS_TABLE).await })
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(key, raw)| match decode_folder(&raw, FOLDERS_TABLE, &key, "get-folders-decode") {
                Ok(folder) => Some(folder),
                Err(error) => {
                    tracing::warn!("skipping unreadable folder: {error}");
                    None
                }
            })
            .collect())
    }

    /// Caller holds the write and read scopes.
    async fn save_locked(&self, conversations: Vec<Conversation>) -> StorageResult<Vec<Conversation>> {
        let _in_flight = SaveInFlight::enter(&self.save_in_flight);

        let mut seen = HashSet::with_capacity(conversations.len());
        let now = unix_timestamp_millis();
        let mut stamped = Vec::with_capacity(conversations.len());
        for mut conversation in conversations {
            if let Some(reason) = conversation.validation_error() {
                return InvalidConversationSnafu {
                    stage: "save-conversations-validate",
                    details: format!("conversation '{}': {reason}", conversation.id),
                }
                .fail();
            }
            if !seen.insert(conversation.id.clone()) {
                return InvalidConversationSnafu {
                    stage: "save-conversations-validate",
                    details: format!("conversation '{}' appears twice", conversation.id),
                }
                .fail();
            }
            let previous = conversation.version.unwrap_or(0);
            conversation.version = Some(now.max(previous.saturating_add(1)));
            stamped.push(conversation);
        }

        let payload = encode_conversations(&stamped, "save-conversations-encode")?;
        let payload = payload.as_str();
        let handle = self
            .with_recovery("save-conversations", || {
                self.with_live_handle("save-conversations", |handle| async move {
                    handle.put(CONVERSATIONS_TABLE, SNAPSHOT_KEY, payload).await?;
                    Ok::<_, StorageError>(handle)
                })
            })
            .await?;

        self.backup.mirror(handle.as_ref(), &stamped).await;
        tracing::debug!(conversations = stamped.len(), "conversations saved");
        Ok(stamped)
    }
}

fn check_folder_parent(folder: &Folder, folders: &HashMap<FolderId, Folder>) -> StorageResult<()> {
    let Some(parent_id) = folder.parent_id.as_ref() else {
        return Ok(());
    };
    if !folders.contains_key(parent_id) && parent_id != &folder.id {
        return NotFoundSnafu {
            stage: "save-folder-parent",
            entity: "folder",
            id: parent_id.to_string(),
        }
        .fail();
    }

    let mut visited = HashSet::new();
    let mut cursor = Some(parent_id);
    while let Some(ancestor) = cursor {
        if ancestor == &folder.id {
            return FolderCycleSnafu {
                stage: "save-folder-cycle",
                folder_id: folder.id.to_string(),
            }
            .fail();
        }
        if !visited.insert(ancestor) {
            break;
        }
        cursor = folders.get(ancestor).and_then(|parent| parent.parent_id.as_ref());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folder_with_parent(name: &str, parent: Option<&Folder>) -> Folder {
        Folder::new(name, parent.map(|parent| parent.id.clone()))
    }

    #[test]
    fn parent_chain_may_not_loop_back() {
        let root = folder_with_parent("root", None);
        let child = folder_with_parent("child", Some(&root));
        let folders = [root.clone(), child.clone()]
            .into_iter()
            .map(|folder| (folder.id.clone(), folder))
            .collect::<HashMap<_, _>>();

        let mut looping_root = root.clone();
        looping_root.parent_id = Some(child.id.clone());
        assert!(matches!(
            check_folder_parent(&looping_root, &folders),
            Err(StorageError::FolderCycle { .. })
        ));

        let mut own_parent = child.clone();
        own_parent.parent_id = Some(child.id.clone());
        assert!(matches!(
            check_folder_parent(&own_parent, &folders),
            Err(StorageError::FolderCycle { .. })
        ));

        let orphan = Folder::new("orphan", Some(FolderId::generate()));
        assert!(matches!(
            check_folder_parent(&orphan, &folders),
            Err(StorageError::NotFound { .. })
        ));

        assert!(check_folder_parent(&child, &folders).is_ok());
    }

    #[tokio::test]
    async fn stamps_grow_past_previous_versions() {
        let store = ConversationStore::in_memory(StoreConfig::default());
        let mut conversation = Conversation::new("future");
        conversation.version = Some(u64::MAX - 1);
        store
            .save_conversations(vec![conversation])
            .await
            .expect("save");

        let saved = store.get_conversations().await.expect("read");
        assert_eq!(saved[0].version, Some(u64::MAX));
    }

    #[tokio::test]
    async fn duplicate_ids_in_one_save_are_rejected() {
        let store = ConversationStore::in_memory(StoreConfig::default());
        let conversation = Conversation::new("twice");
        let error = store
            .save_conversations(vec![conversation.clone(), conversation])
            .await
            .expect_err("duplicate");
        assert!(matches!(error, StorageError::InvalidConversation { .. }));
        assert!(!store.save_in_flight());
    }
}
