//! Item and Alias models.
//!
//! An item is the canonical memorization content (a referenced passage),
//! independent of any one owner. Aliases let the varied spellings a user
//! types resolve to one item without another lookup.

use serde::{Deserialize, Serialize};

/// Identity of an item across replicas.
///
/// Local and remote ids are never assumed equal, so both stores agree on
/// an item only through this pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    pub canonical_reference: String,
    pub source_translation: String,
}

impl ItemKey {
    #[must_use]
    pub fn new(canonical_reference: &str, source_translation: &str) -> Self {
        Self {
            canonical_reference: canonical_reference.to_string(),
            source_translation: source_translation.to_string(),
        }
    }
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.canonical_reference, self.source_translation)
    }
}

/// A memorization item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Unique identifier. Mirrors the remote id when the item came from the remote.
    pub id: String,

    /// Canonical spelling of the reference (e.g. "John 3:16")
    pub canonical_reference: String,

    /// Passage text
    pub body_text: String,

    /// Translation the text was taken from
    pub source_translation: String,

    /// False when the text was typed manually and not yet confirmed by lookup
    pub verified: bool,

    /// Creation timestamp (Unix milliseconds)
    pub created_at: i64,

    /// Last update timestamp (Unix milliseconds)
    pub updated_at: i64,
}

impl Item {
    /// Create an unverified item from manually entered text.
    pub fn manual(canonical_reference: String, body_text: String, source_translation: String) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("item_{}", &uuid::Uuid::new_v4().to_string()[..12]),
            canonical_reference,
            body_text,
            source_translation,
            verified: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.canonical_reference, &self.source_translation)
    }
}

/// An alternative spelling that resolves to an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alias {
    pub id: String,
    /// Output of `reference::normalize_reference`
    pub normalized_key: String,
    pub item_id: String,
    pub created_at: i64,
}

impl Alias {
    pub fn new(normalized_key: String, item_id: String) -> Self {
        Self {
            id: format!("alias_{}", &uuid::Uuid::new_v4().to_string()[..12]),
            normalized_key,
            item_id,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_item_is_unverified() {
        let item = Item::manual("John 3:16".into(), "For God so loved".into(), "KJV".into());
        assert!(item.id.starts_with("item_"));
        assert!(!item.verified);
        assert_eq!(item.key(), ItemKey::new("John 3:16", "KJV"));
    }

    #[test]
    fn test_item_key_display() {
        let key = ItemKey::new("Psalm 23:1", "ESV");
        assert_eq!(key.to_string(), "Psalm 23:1 (ESV)");
    }
}
