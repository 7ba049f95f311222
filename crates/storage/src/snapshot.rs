use serde_json::Value;
use snafu::ResultExt;

use super::backend::SNAPSHOT_KEY;
use super::error::{DecodeSnapshotSnafu, EncodeSnapshotSnafu, StorageResult};
use super::types::{Conversation, Folder};

/// Outcome of decoding a bulk snapshot: the valid entries plus how many
/// malformed ones were dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DecodedSnapshot {
    pub conversations: Vec<Conversation>,
    pub invalid: usize,
}

pub(crate) fn encode_conversations(
    conversations: &[Conversation],
    stage: &'static str,
) -> StorageResult<String> {
    serde_json::to_string(conversations).context(EncodeSnapshotSnafu { stage })
}

/// A snapshot that is not a JSON array fails as a whole; individual entries
/// that do not decode or violate the structural invariants are filtered out.
pub(crate) fn decode_conversations(
    raw: &str,
    table: &str,
    stage: &'static str,
) -> StorageResult<DecodedSnapshot> {
    let entries: Vec<Value> = serde_json::from_str(raw).context(DecodeSnapshotSnafu {
        stage,
        table: table.to_string(),
        key: SNAPSHOT_KEY.to_string(),
    })?;

    Ok(decode_conversation_values(entries))
}

pub(crate) fn decode_conversation_values(entries: Vec<Value>) -> DecodedSnapshot {
    let mut decoded = DecodedSnapshot::default();
    for entry in entries {
        match serde_json::from_value::<Conversation>(entry) {
            Ok(conversation) if conversation.is_structurally_valid() => {
                decoded.conversations.push(conversation);
            }
            _ => decoded.invalid += 1,
        }
    }

    decoded
}

pub(crate) fn decode_folder(raw: &str, table: &str, key: &str, stage: &'static str) -> StorageResult<Folder> {
    serde_json::from_str(raw).context(DecodeSnapshotSnafu {
        stage,
        table: table.to_string(),
        key: key.to_string(),
    })
}
