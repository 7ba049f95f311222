pub mod backend;
pub mod backup;
pub mod config;
pub mod error;
pub mod fallback;
pub mod ids;
pub mod lock;
pub mod merge;
pub mod recovery;
pub mod schema;
mod snapshot;
pub mod sqlite;
pub mod store;
pub mod transfer;
pub mod types;

pub use backend::{KvBackend, KvHandle, MemoryBackend, MemoryHandle, SchemaState};
pub use config::StoreConfig;
pub use error::{StorageError, StorageResult};
pub use fallback::{FileSlot, MemorySlot, SnapshotSlot};
pub use ids::{ConversationId, FolderId};
pub use lock::{LockCoordinator, LockScope};
pub use merge::merge_conversations;
pub use recovery::{Diagnosis, RecoveryAction};
pub use sqlite::SqliteBackend;
pub use store::ConversationStore;
pub use transfer::EXPORT_FORMAT_VERSION;
pub use types::{
    Conversation, DEFAULT_CONVERSATION_TITLE, ExportDocument, Folder, HealthReport, HealthStatus,
    ImportReport, Message, MessageRole,
};

/// The on-disk store used by the application.
pub type SqliteConversationStore = ConversationStore<SqliteBackend, FileSlot>;
