//! Export and import of the conversation collection as a portable JSON
//! document.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use snafu::ResultExt;

use super::backend::KvBackend;
use super::error::{DecodeImportSnafu, EncodeSnapshotSnafu, StorageError, StorageResult};
use super::fallback::SnapshotSlot;
use super::ids::FolderId;
use super::snapshot::decode_conversation_values;
use super::store::ConversationStore;
use super::types::{ExportDocument, Folder, ImportReport};

pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// Both accepted shapes: the versioned envelope and the legacy bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ImportPayload {
    Document {
        #[serde(default)]
        version: Option<u32>,
        conversations: Vec<Value>,
        #[serde(default)]
        folders: Vec<Value>,
    },
    Bare(Vec<Value>),
}

impl<B: KvBackend, S: SnapshotSlot> ConversationStore<B, S> {
    /// Active conversations plus every folder, pretty-printed.
    pub async fn export_conversations(&self) -> StorageResult<String> {
        let document = ExportDocument {
            version: EXPORT_FORMAT_VERSION,
            export_date: chrono::Utc::now().to_rfc3339(),
            conversations: self.get_conversations().await?,
            folders: self.get_folders().await?,
        };

        tracing::info!(
            conversations = document.conversations.len(),
            folders = document.folders.len(),
            "exporting conversations"
        );
        serde_json::to_string_pretty(&document).context(EncodeSnapshotSnafu {
            stage: "export-encode-document",
        })
    }

    /// Invalid entries and ids already known to the store (soft-deleted ones
    /// included) are skipped and counted, never fatal.
    pub async fn import_conversations(&self, serialized: &str) -> StorageResult<ImportReport> {
        let payload: ImportPayload = serde_json::from_str(serialized).context(DecodeImportSnafu {
            stage: "import-parse-document",
        })?;
        let (conversations, folders) = match payload {
            ImportPayload::Document {
                version,
                conversations,
                folders,
            } => {
                if version.is_some_and(|version| version > EXPORT_FORMAT_VERSION) {
                    tracing::warn!(?version, "importing a document from a newer export format");
                }
                (conversations, folders)
            }
            ImportPayload::Bare(conversations) => (conversations, Vec::new()),
        };

        let mut report = ImportReport::default();
        self.import_folders(folders, &mut report).await?;

        let decoded = decode_conversation_values(conversations);
        report.skipped_invalid = decoded.invalid;

        let (imported, duplicates) = self.merge_new_conversations(decoded.conversations).await?;
        report.imported_conversations = imported;
        report.skipped_duplicates = duplicates;

        tracing::info!(
            imported = report.imported_conversations,
            invalid = report.skipped_invalid,
            duplicates = report.skipped_duplicates,
            folders = report.imported_folders,
            skipped_folders = report.skipped_folders,
            "import finished"
        );
        Ok(report)
    }

    /// Parents go in before children; folders whose parent never shows up,
    /// or that would close a cycle, are skipped.
    async fn import_folders(&self, folders: Vec<Value>, report: &mut ImportReport) -> StorageResult<()> {
        if folders.is_empty() {
            return Ok(());
        }

        let mut known = self
            .get_folders()
            .await?
            .into_iter()
            .map(|folder| folder.id)
            .collect::<HashSet<FolderId>>();
        let mut pending = Vec::new();
        for value in folders {
            match serde_json::from_value::<Folder>(value) {
                Ok(folder) if folder.id.is_empty() => report.skipped_folders += 1,
                Ok(folder) if known.contains(&folder.id) => report.skipped_folders += 1,
                Ok(folder) => pending.push(folder),
                Err(error) => {
                    tracing::debug!("skipping malformed folder: {error}");
                    report.skipped_folders += 1;
                }
            }
        }

        loop {
            let (ready, waiting): (Vec<_>, Vec<_>) = pending.into_iter().partition(|folder: &Folder| {
                folder
                    .parent_id
                    .as_ref()
                    .is_none_or(|parent_id| known.contains(parent_id))
            });
            pending = waiting;
            if ready.is_empty() {
                break;
            }

            for folder in ready {
                let folder_id = folder.id.clone();
                match self.save_folder(folder).await {
                    Ok(_) => {
                        known.insert(folder_id);
                        report.imported_folders += 1;
                    }
                    Err(error @ (StorageError::FolderCycle { .. } | StorageError::NotFound { .. })) => {
                        tracing::warn!("skipping folder {folder_id}: {error}");
                        report.skipped_folders += 1;
                    }
                    Err(error) => return Err(error),
                }
            }
        }

        if !pending.is_empty() {
            tracing::warn!(orphans = pending.len(), "skipping folders with unknown parents");
            report.skipped_folders += pending.len();
        }

        Ok(())
    }
}
