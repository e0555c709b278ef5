//! Device registry contract.
//!
//! The registry remembers tags that have connected before, so a scan can
//! report them as pre-connected instead of advertising a pairing code. It
//! is injected into [`Tag`](crate::Tag) and [`TagManager`](crate::TagManager);
//! nothing in the engine reaches a global instance.
//!
//! Merge rule: the last write wins, except that an empty display name never
//! overwrites a known one.

use std::collections::HashMap;
use std::sync::RwLock;

use weartag_types::TagIdentity;

use crate::error::Result;

/// Persistence for known tags.
///
/// Implementations must tolerate concurrent calls from several tags.
pub trait TagRegistry: Send + Sync {
    /// Insert or refresh a tag.
    fn upsert(&self, identity: &TagIdentity) -> Result<()>;

    /// Look up a tag by identifier.
    fn get(&self, identifier: &str) -> Result<Option<TagIdentity>>;

    /// Forget a tag. Returns whether it was known.
    fn remove(&self, identifier: &str) -> Result<bool>;

    /// Every known tag, ordered by identifier.
    fn all(&self) -> Result<Vec<TagIdentity>>;

    /// Whether the identifier is known.
    fn is_known(&self, identifier: &str) -> Result<bool> {
        Ok(self.get(identifier)?.is_some())
    }
}

/// Merge an incoming identity into a stored one.
///
/// Pairing codes are never persisted: a known tag is paired by definition.
pub fn merge_identity(existing: Option<&TagIdentity>, incoming: &TagIdentity) -> TagIdentity {
    let incoming = incoming.paired();
    match existing {
        Some(existing) if incoming.display_name().is_empty() => {
            incoming.with_display_name(existing.display_name())
        }
        _ => incoming,
    }
}

/// Registry kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    tags: RwLock<HashMap<String, TagIdentity>>,
}

impl MemoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TagRegistry for MemoryRegistry {
    fn upsert(&self, identity: &TagIdentity) -> Result<()> {
        let mut tags = self
            .tags
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let merged = merge_identity(tags.get(identity.identifier()), identity);
        tags.insert(merged.identifier().to_string(), merged);
        Ok(())
    }

    fn get(&self, identifier: &str) -> Result<Option<TagIdentity>> {
        let tags = self
            .tags
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(tags.get(identifier).cloned())
    }

    fn remove(&self, identifier: &str) -> Result<bool> {
        let mut tags = self
            .tags
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(tags.remove(identifier).is_some())
    }

    fn all(&self) -> Result<Vec<TagIdentity>> {
        let tags = self
            .tags
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut all: Vec<TagIdentity> = tags.values().cloned().collect();
        all.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        Ok(all)
    }
}
