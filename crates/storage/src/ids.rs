use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

// Record ids are opaque strings on disk; ids minted here are UUIDv7 so they sort by creation.
macro_rules! define_record_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                if raw.is_empty() {
                    return InvalidIdSnafu {
                        stage: "parse-record-id",
                        id_type: $id_type,
                        raw: raw.to_string(),
                    }
                    .fail();
                }
                Ok(Self(raw.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_record_id!(ConversationId, "conversation-id");
define_record_id!(FolderId, "folder-id");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_distinct_and_non_empty() {
        let first = ConversationId::generate();
        let second = ConversationId::generate();
        assert!(!first.is_empty());
        assert_ne!(first, second);
    }

    #[test]
    fn empty_ids_are_rejected() {
        assert!(matches!(
            FolderId::parse(""),
            Err(StorageError::InvalidId { id_type: "folder-id", .. })
        ));
        assert_eq!(FolderId::parse(" ").map(String::from).ok(), Some(" ".to_string()));
        assert_eq!(FolderId::parse("work").map(String::from).ok(), Some("work".to_string()));
    }
}
