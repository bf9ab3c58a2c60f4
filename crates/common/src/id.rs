//! ID generation utilities.

use ulid::Ulid;
use uuid::Uuid;

/// ID generator for messages, tasks and sessions.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a new ULID-based ID.
    ///
    /// ULIDs are lexicographically sortable and shorter than UUIDs when
    /// represented as strings, which keeps Redis hash fields and Kafka
    /// keys compact.
    #[must_use]
    pub fn generate(&self) -> String {
        Ulid::new().to_string().to_lowercase()
    }

    /// Generate a ULID-based ID with a `{prefix}_` prefix.
    #[must_use]
    pub fn generate_prefixed(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.generate())
    }

    /// Generate a new UUID v7-based ID. Used for client session ids.
    #[must_use]
    pub fn generate_uuid_v7(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ulid() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.generate();
        let id2 = id_gen.generate();

        assert_eq!(id1.len(), 26);
        assert_eq!(id2.len(), 26);
        assert_ne!(id1, id2);
        assert_eq!(id1, id1.to_lowercase());
    }

    #[test]
    fn test_generate_prefixed() {
        let id = IdGenerator::new().generate_prefixed("task");
        assert!(id.starts_with("task_"));
        assert_eq!(id.len(), 5 + 26);
    }

    #[test]
    fn test_generate_uuid_v7() {
        let id = IdGenerator::new().generate_uuid_v7();
        assert_eq!(id.len(), 36);
    }
}
