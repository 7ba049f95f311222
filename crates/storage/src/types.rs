use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::ids::{ConversationId, FolderId};

/// Default title for conversations created without one.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

/// Closed set of speakers a stored message may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Human,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(rename = "_timestamp", default)]
    pub timestamp: u64,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: unix_timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub folder_id: Option<FolderId>,
    // Soft-delete flag: inactive records stay on disk but never reach a listing.
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub last_accessed_at: u64,
    #[serde(rename = "_version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

fn default_active() -> bool {
    true
}

impl Conversation {
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        let title = if title.trim().is_empty() {
            DEFAULT_CONVERSATION_TITLE.to_string()
        } else {
            title
        };

        Self {
            id: ConversationId::generate(),
            title,
            messages: Vec::new(),
            folder_id: None,
            is_active: true,
            last_accessed_at: unix_timestamp_millis(),
            version: None,
        }
    }

    /// Appends a message and bumps the access time; history is never reordered.
    pub fn push_message(&mut self, message: Message) {
        self.messages.push(message);
        self.last_accessed_at = self.last_accessed_at.max(unix_timestamp_millis());
    }

    pub fn soft_delete(&mut self) {
        self.is_active = false;
    }

    pub fn is_tombstone(&self) -> bool {
        !self.is_active
    }

    /// Reason the record fails the structural invariants, if any.
    pub fn validation_error(&self) -> Option<&'static str> {
        if self.id.is_empty() {
            return Some("empty-id");
        }
        if self.messages.iter().any(|message| message.content.is_empty()) {
            return Some("empty-message-content");
        }
        None
    }

    pub fn is_structurally_valid(&self) -> bool {
        self.validation_error().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: FolderId,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<FolderId>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl Folder {
    pub fn new(name: impl Into<String>, parent_id: Option<FolderId>) -> Self {
        let now = unix_timestamp_millis();
        Self {
            id: FolderId::generate(),
            name: name.into(),
            parent_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Versioned export envelope; imports also accept a bare conversation array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub version: u32,
    pub export_date: String,
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub folders: Vec<Folder>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportReport {
    pub imported_conversations: usize,
    pub skipped_invalid: usize,
    pub skipped_duplicates: usize,
    pub imported_folders: usize,
    pub skipped_folders: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Tables are missing but can be added without data loss.
    Repairable,
    /// Only a destructive rebuild can restore the layout.
    Corrupt,
    /// The store could not be opened at all.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub schema_version: Option<u32>,
    pub tables: Vec<String>,
    pub missing_tables: Vec<String>,
    /// Physical records in the conversation snapshot, soft-deleted ones included.
    pub conversation_records: usize,
    pub active_conversations: usize,
    pub backup_conversations: usize,
    pub folders: usize,
    pub recovery_attempts: u32,
    pub save_in_flight: bool,
    pub details: Option<String>,
}

pub(crate) fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_u64, |duration| duration.as_millis() as u64)
}
