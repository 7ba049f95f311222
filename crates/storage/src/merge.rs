//! Conflict resolution between two conversation collections.
//!
//! Each id maps to either a tombstone (`is_active == false`) or a versioned
//! live record. Joining two entries for the same id is deterministic:
//!
//! 1. a tombstone beats any live record, whatever the versions;
//! 2. otherwise a strictly higher `_version` wins;
//! 3. otherwise (equal or missing versions) the copy already selected stays.
//!
//! The primary input is folded in first, so ties favour it.

use std::cmp::Reverse;
use std::collections::HashMap;

use super::ids::ConversationId;
use super::types::Conversation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinWinner {
    Selected,
    Incoming,
}

pub fn join(selected: &Conversation, incoming: &Conversation) -> JoinWinner {
    match (selected.is_tombstone(), incoming.is_tombstone()) {
        (true, _) => JoinWinner::Selected,
        (false, true) => JoinWinner::Incoming,
        (false, false) => match (selected.version, incoming.version) {
            (Some(current), Some(candidate)) if candidate > current => JoinWinner::Incoming,
            _ => JoinWinner::Selected,
        },
    }
}

/// Merges `secondary` into `primary`. Active records come first, then
/// tombstones; within each group the most recently accessed leads.
pub fn merge_conversations(
    primary: Vec<Conversation>,
    secondary: Vec<Conversation>,
) -> Vec<Conversation> {
    let mut merged: Vec<Conversation> = Vec::with_capacity(primary.len() + secondary.len());
    let mut positions: HashMap<ConversationId, usize> = HashMap::new();

    for incoming in primary.into_iter().chain(secondary) {
        match positions.get(&incoming.id) {
            Some(&position) => {
                if join(&merged[position], &incoming) == JoinWinner::Incoming {
                    merged[position] = incoming;
                }
            }
            None => {
                positions.insert(incoming.id.clone(), merged.len());
                merged.push(incoming);
            }
        }
    }

    // Stable sort keeps input order as the final tie-break.
    merged.sort_by_key(|conversation| {
        (
            conversation.is_tombstone(),
            Reverse(conversation.last_accessed_at),
            Reverse(conversation.version.unwrap_or(0)),
        )
    });
    merged
}
