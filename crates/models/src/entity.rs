use serde::{Deserialize, Serialize};
use std::fmt;

/// A subject or object endpoint of a permission tuple.
///
/// Subjects are typically `user`, `agent`, or `group`; objects are `file`,
/// `directory`, `memory`, `resource`, `group`, or `zone`. For file-like
/// objects the entity id is the virtual path.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_type: String,
    pub entity_id: String,
}

impl EntityRef {
    pub fn new(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new("user", id)
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new("agent", id)
    }

    pub fn group(id: impl Into<String>) -> Self {
        Self::new("group", id)
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self::new("file", path)
    }

    pub fn zone(id: impl Into<String>) -> Self {
        Self::new("zone", id)
    }

    /// Object types whose ids are virtual paths and participate in
    /// directory inheritance and visibility pruning.
    pub fn is_file_like(&self) -> bool {
        matches!(self.entity_type.as_str(), "file" | "directory" | "memory" | "resource")
    }

    pub fn as_pair(&self) -> (&str, &str) {
        (&self.entity_type, &self.entity_id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

impl From<(&str, &str)> for EntityRef {
    fn from((t, i): (&str, &str)) -> Self {
        Self::new(t, i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let e = EntityRef::user("alice");
        assert_eq!(e.to_string(), "user:alice");
    }

    #[test]
    fn test_file_like_detection() {
        assert!(EntityRef::file("/docs/a.txt").is_file_like());
        assert!(EntityRef::new("memory", "m1").is_file_like());
        assert!(!EntityRef::group("devs").is_file_like());
        assert!(!EntityRef::zone("z1").is_file_like());
    }
}
