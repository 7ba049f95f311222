use super::backend::{CONVERSATIONS_BACKUP_TABLE, KvHandle, SNAPSHOT_KEY};
use super::error::StorageResult;
use super::fallback::{BACKUP_SLOT_KEY, SnapshotSlot};
use super::snapshot::{decode_conversations, encode_conversations};
use super::types::Conversation;

/// Write-through mirror of the active conversations.
///
/// The mirror is refreshed only after the primary write commits, so it can
/// lag the primary but never lead it. It fills gaps; it never settles
/// conflicts.
pub struct BackupManager<S: SnapshotSlot> {
    slot: S,
}

impl<S: SnapshotSlot> BackupManager<S> {
    pub fn new(slot: S) -> Self {
        Self { slot }
    }

    pub fn slot(&self) -> &S {
        &self.slot
    }

    /// Best effort: failures are logged and never fail the caller's save.
    pub async fn mirror<H: KvHandle>(&self, handle: &H, conversations: &[Conversation]) {
        let active = conversations
            .iter()
            .filter(|conversation| conversation.is_active)
            .cloned()
            .collect::<Vec<_>>();
        let payload = match encode_conversations(&active, "backup-mirror-encode") {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!("failed to encode conversation backup: {error}");
                return;
            }
        };

        if let Err(error) = handle.put(CONVERSATIONS_BACKUP_TABLE, SNAPSHOT_KEY, &payload).await {
            tracing::warn!("failed to refresh backup table: {error}");
        }
        if let Err(error) = self.slot.write(BACKUP_SLOT_KEY, &payload) {
            tracing::warn!("failed to refresh fallback backup slot: {error}");
        }
    }

    pub async fn read_table<H: KvHandle>(&self, handle: &H) -> StorageResult<Vec<Conversation>> {
        let Some(raw) = handle.get(CONVERSATIONS_BACKUP_TABLE, SNAPSHOT_KEY).await? else {
            return Ok(Vec::new());
        };
        let decoded = decode_conversations(&raw, CONVERSATIONS_BACKUP_TABLE, "backup-read-table")?;
        if decoded.invalid > 0 {
            tracing::warn!(dropped = decoded.invalid, "backup table held malformed conversations");
        }
        Ok(decoded.conversations)
    }

    pub fn read_slot(&self) -> StorageResult<Vec<Conversation>> {
        let Some(raw) = self.slot.read(BACKUP_SLOT_KEY)? else {
            return Ok(Vec::new());
        };
        let decoded = decode_conversations(&raw, BACKUP_SLOT_KEY, "backup-read-slot")?;
        if decoded.invalid > 0 {
            tracing::warn!(dropped = decoded.invalid, "fallback slot held malformed conversations");
        }
        Ok(decoded.conversations)
    }

    /// First non-empty mirror: the backup table when a handle is available,
    /// then the fallback slot. Read errors just move on to the next source.
    pub async fn load_snapshot<H: KvHandle>(&self, handle: Option<&H>) -> Vec<Conversation> {
        if let Some(handle) = handle {
            match self.read_table(handle).await {
                Ok(conversations) if !conversations.is_empty() => return conversations,
                Ok(_) => {}
                Err(error) => tracing::warn!("backup table unreadable: {error}"),
            }
        }

        match self.read_slot() {
            Ok(conversations) => conversations,
            Err(error) => {
                tracing::warn!("fallback backup slot unreadable: {error}");
                Vec::new()
            }
        }
    }

    pub fn clear_slot(&self) -> StorageResult<()> {
        self.slot.remove(BACKUP_SLOT_KEY)
    }
}
