//! Detects structurally broken storage and brings it back to a usable layout.
//!
//! Detect → Repair (additive) → Rebuild (destructive) → Escalate. A persisted
//! attempt counter in the fallback slot bounds how often automatic recovery
//! may run before it gives up and asks for a manual reset.

use snafu::ResultExt;

use super::backend::{
    CONVERSATIONS_BACKUP_TABLE, CONVERSATIONS_TABLE, FOLDERS_TABLE, KvBackend, KvHandle,
    SNAPSHOT_KEY,
};
use super::backup::BackupManager;
use super::error::{
    EncodeSnapshotSnafu, RecoveryExhaustedSnafu, RecoveryFailedSnafu, StorageError, StorageResult,
};
use super::fallback::{RECOVERY_ATTEMPTS_SLOT_KEY, SnapshotSlot};
use super::schema::SchemaMigrator;
use super::snapshot::{decode_conversations, decode_folder, encode_conversations};
use super::types::{Conversation, Folder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnosis {
    Healthy,
    /// Tables can be added back without touching existing data.
    Repairable {
        missing: Vec<&'static str>,
        /// A dependent table survived while `conversations` did not.
        botched_migration: bool,
    },
    Corrupt { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    AlreadyHealthy,
    Repaired {
        created: Vec<&'static str>,
    },
    Rebuilt {
        salvaged_conversations: usize,
        salvaged_folders: usize,
    },
}

#[derive(Debug, Default)]
struct Salvage {
    conversations: Vec<Conversation>,
    folders: Vec<Folder>,
}

pub struct RecoveryOrchestrator<'a, B: KvBackend, S: SnapshotSlot> {
    migrator: &'a SchemaMigrator<B>,
    backup: &'a BackupManager<S>,
    max_attempts: u32,
}

impl<'a, B: KvBackend, S: SnapshotSlot> RecoveryOrchestrator<'a, B, S> {
    pub fn new(migrator: &'a SchemaMigrator<B>, backup: &'a BackupManager<S>, max_attempts: u32) -> Self {
        Self {
            migrator,
            backup,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Attempts recorded since the last successful recovery. An unreadable
    /// counter reads as zero.
    pub fn attempts(&self) -> u32 {
        match self.backup.slot().read(RECOVERY_ATTEMPTS_SLOT_KEY) {
            Ok(Some(raw)) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!("recovery attempt counter is unreadable: {raw:?}");
                0
            }),
            Ok(None) => 0,
            Err(error) => {
                tracing::warn!("failed to read recovery attempt counter: {error}");
                0
            }
        }
    }

    pub fn reset_attempts(&self) -> StorageResult<()> {
        self.backup.slot().remove(RECOVERY_ATTEMPTS_SLOT_KEY)
    }

    fn record_attempt(&self, attempts: u32) {
        if let Err(error) = self
            .backup
            .slot()
            .write(RECOVERY_ATTEMPTS_SLOT_KEY, &attempts.to_string())
        {
            tracing::warn!("failed to persist recovery attempt counter: {error}");
        }
    }

    /// `UpgradeBlocked` is returned as an error: the layout may be fine and
    /// simply held open elsewhere, which is not grounds for a rebuild.
    pub async fn diagnose(&self) -> StorageResult<Diagnosis> {
        let (handle, state) = match self.migrator.ensure_schema(self.migrator.effective_version()).await {
            Ok(opened) => opened,
            Err(error @ StorageError::UpgradeBlocked { .. }) => return Err(error),
            Err(error) => {
                return Ok(Diagnosis::Corrupt {
                    reason: error.to_string(),
                });
            }
        };

        let missing = state.missing_tables();
        if !missing.is_empty() {
            let botched_migration = !state.has_table(CONVERSATIONS_TABLE)
                && (state.has_table(FOLDERS_TABLE) || state.has_table(CONVERSATIONS_BACKUP_TABLE));
            return Ok(Diagnosis::Repairable {
                missing,
                botched_migration,
            });
        }

        match handle.get(CONVERSATIONS_TABLE, SNAPSHOT_KEY).await {
            Ok(Some(raw)) => {
                if let Err(error) = decode_conversations(&raw, CONVERSATIONS_TABLE, "recovery-diagnose-snapshot") {
                    return Ok(Diagnosis::Corrupt {
                        reason: error.to_string(),
                    });
                }
            }
            Ok(None) => {}
            Err(error) => {
                return Ok(Diagnosis::Corrupt {
                    reason: error.to_string(),
                });
            }
        }

        Ok(Diagnosis::Healthy)
    }

    pub async fn recover(&self) -> StorageResult<RecoveryAction> {
        let attempts = self.attempts();
        if attempts >= self.max_attempts {
            tracing::error!(attempts, "automatic recovery exhausted; manual reset required");
            return RecoveryExhaustedSnafu {
                stage: "recovery-guard",
                attempts,
            }
            .fail();
        }
        self.record_attempt(attempts + 1);

        let outcome = match self.diagnose().await? {
            Diagnosis::Healthy => Ok(RecoveryAction::AlreadyHealthy),
            Diagnosis::Repairable {
                missing,
                botched_migration,
            } => {
                tracing::warn!(?missing, botched_migration, "repairing store layout");
                match self.repair().await {
                    Ok(action) => Ok(action),
                    Err(error) => {
                        tracing::warn!("additive repair failed ({error}); rebuilding store");
                        self.rebuild().await
                    }
                }
            }
            Diagnosis::Corrupt { reason } => {
                tracing::warn!("store is corrupt ({reason}); rebuilding");
                self.rebuild().await
            }
        };

        match outcome {
            Ok(action) => {
                if let Err(error) = self.reset_attempts() {
                    tracing::warn!("failed to reset recovery attempt counter: {error}");
                }
                tracing::info!(?action, "store recovery finished");
                Ok(action)
            }
            Err(error) => {
                tracing::error!(attempt = attempts + 1, "store recovery failed: {error}");
                Err(error)
            }
        }
    }

    async fn repair(&self) -> StorageResult<RecoveryAction> {
        let before = self.migrator.ensure_schema(self.migrator.effective_version()).await?.1;
        let created = before.missing_tables();
        let (_, after) = self.migrator.bump_and_migrate().await?;

        let still_missing = after.missing_tables();
        if !still_missing.is_empty() {
            return RecoveryFailedSnafu {
                stage: "recovery-verify-repair",
                details: format!("tables still missing after upgrade: {still_missing:?}"),
            }
            .fail();
        }

        Ok(RecoveryAction::Repaired { created })
    }

    async fn rebuild(&self) -> StorageResult<RecoveryAction> {
        let salvage = self.salvage().await;
        tracing::warn!(
            conversations = salvage.conversations.len(),
            folders = salvage.folders.len(),
            location = %self.migrator.backend().location(),
            "destroying store container"
        );

        self.migrator.invalidate().await;
        self.migrator.backend().destroy().await?;
        self.migrator.reset_effective_version();

        let (handle, state) = self.migrator.ensure_schema(self.migrator.effective_version()).await?;
        let missing = state.missing_tables();
        if !missing.is_empty() {
            return RecoveryFailedSnafu {
                stage: "recovery-verify-rebuild",
                details: format!("tables missing after rebuild: {missing:?}"),
            }
            .fail();
        }

        if !salvage.conversations.is_empty() {
            let payload = encode_conversations(&salvage.conversations, "recovery-replay-encode")?;
            handle.put(CONVERSATIONS_TABLE, SNAPSHOT_KEY, &payload).await?;
            self.backup.mirror(handle.as_ref(), &salvage.conversations).await;
        }
        for folder in &salvage.folders {
            let payload = serde_json::to_string(folder).context(EncodeSnapshotSnafu {
                stage: "recovery-replay-folder",
            })?;
            handle.put(FOLDERS_TABLE, folder.id.as_str(), &payload).await?;
        }

        Ok(RecoveryAction::Rebuilt {
            salvaged_conversations: salvage.conversations.len(),
            salvaged_folders: salvage.folders.len(),
        })
    }

    /// Reads straight from a fresh connection, skipping the migrator, since
    /// the layout is not trusted at this point.
    async fn salvage(&self) -> Salvage {
        let handle = match self.migrator.backend().open().await {
            Ok(handle) => Some(handle),
            Err(error) => {
                tracing::warn!("cannot open store for salvage: {error}");
                None
            }
        };

        let mut salvage = Salvage::default();
        if let Some(handle) = handle.as_ref() {
            match handle.get(CONVERSATIONS_TABLE, SNAPSHOT_KEY).await {
                Ok(Some(raw)) => match decode_conversations(&raw, CONVERSATIONS_TABLE, "recovery-salvage") {
                    Ok(decoded) => salvage.conversations = decoded.conversations,
                    Err(error) => tracing::warn!("primary snapshot not salvageable: {error}"),
                },
                Ok(None) => {}
                Err(error) => tracing::warn!("primary snapshot not readable: {error}"),
            }

            match handle.scan(FOLDERS_TABLE).await {
                Ok(rows) => {
                    for (key, raw) in rows {
                        match decode_folder(&raw, FOLDERS_TABLE, &key, "recovery-salvage-folder") {
                            Ok(folder) => salvage.folders.push(folder),
                            Err(error) => tracing::warn!("dropping unreadable folder: {error}"),
                        }
                    }
                }
                Err(error) => tracing::warn!("folders not readable: {error}"),
            }
        }

        if salvage.conversations.is_empty() {
            salvage.conversations = self.backup.load_snapshot(handle.as_ref()).await;
        }
        if let Some(handle) = handle {
            handle.close().await;
        }

        salvage
    }
}
