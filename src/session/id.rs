//! Session identifier type.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for session ID generation.
static COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a logical session.
///
/// Session IDs are generated using an atomic counter, ensuring uniqueness
/// within a single process lifetime. An ID created with
/// [`SessionId::child_of`] carries a link to its parent session; the registry
/// uses that link to co-reserve the parent whenever the child is checked out.
/// Only one level of nesting exists: a child ID cannot itself have children.
///
/// Root IDs display as `sess-XXXXXXXX`; child IDs as
/// `sess-PPPPPPPP/XXXXXXXX` where `P` is the parent's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    raw: u64,
    parent: Option<u64>,
}

impl SessionId {
    /// Create a new unique root session ID.
    pub fn new() -> Self {
        Self {
            raw: COUNTER.fetch_add(1, Ordering::Relaxed),
            parent: None,
        }
    }

    /// Create a new unique session ID that is a child of `parent`.
    ///
    /// # Panics
    ///
    /// Panics if `parent` is itself a child ID.
    pub fn child_of(parent: SessionId) -> Self {
        assert!(
            !parent.is_child(),
            "child session ids cannot have children: {parent}"
        );
        Self {
            raw: COUNTER.fetch_add(1, Ordering::Relaxed),
            parent: Some(parent.raw),
        }
    }

    /// The parent session's ID, if this is a child ID.
    pub fn parent(&self) -> Option<SessionId> {
        self.parent.map(|raw| SessionId { raw, parent: None })
    }

    /// Whether this ID identifies a child session.
    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    /// Get the raw u64 value.
    pub fn as_u64(&self) -> u64 {
        self.raw
    }

    /// Create a root SessionId from a raw u64 value.
    ///
    /// This is primarily for testing.
    pub fn from_raw(value: u64) -> Self {
        Self {
            raw: value,
            parent: None,
        }
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent {
            Some(parent) => write!(f, "sess-{:08x}/{:08x}", parent, self.raw),
            None => write!(f, "sess-{:08x}", self.raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uniqueness() {
        let mut ids = HashSet::new();
        for _ in 0..10_000 {
            let id = SessionId::new();
            assert!(ids.insert(id), "Duplicate ID generated: {}", id);
        }
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_display_format() {
        let id = SessionId::from_raw(255);
        assert_eq!(id.to_string(), "sess-000000ff");
    }

    #[test]
    fn test_child_display_format() {
        let parent = SessionId::from_raw(0x12345678);
        let child = SessionId::child_of(parent);
        let text = child.to_string();
        assert!(text.starts_with("sess-12345678/"));
    }

    #[test]
    fn test_root_has_no_parent() {
        let id = SessionId::new();
        assert!(!id.is_child());
        assert!(id.parent().is_none());
    }

    #[test]
    fn test_child_links_to_parent() {
        let parent = SessionId::new();
        let child = SessionId::child_of(parent);

        assert!(child.is_child());
        assert_eq!(child.parent(), Some(parent));
        assert_ne!(child, parent);
    }

    #[test]
    #[should_panic(expected = "cannot have children")]
    fn test_grandchild_rejected() {
        let parent = SessionId::new();
        let child = SessionId::child_of(parent);
        let _ = SessionId::child_of(child);
    }

    #[test]
    fn test_siblings_distinct() {
        let parent = SessionId::new();
        let a = SessionId::child_of(parent);
        let b = SessionId::child_of(parent);

        assert_ne!(a, b);
        assert_eq!(a.parent(), b.parent());
    }

    #[test]
    fn test_hash_eq() {
        let id1 = SessionId::from_raw(42);
        let id2 = SessionId::from_raw(42);
        let id3 = SessionId::from_raw(43);

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);

        let mut set = HashSet::new();
        set.insert(id1);
        assert!(set.contains(&id2));
        assert!(!set.contains(&id3));
    }
}
