//! Short random identifiers for runs and requests.

use uuid::Uuid;

/// Length of generated ids.
pub const ID_LEN: usize = 10;

/// Generates short ids (the first 10 hex characters of a UUID v4).
#[derive(Debug, Default, Clone, Copy)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self) -> String {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(ID_LEN);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_short_and_distinct() {
        let ids = IdGenerator::new();
        let a = ids.generate();
        let b = ids.generate();
        assert_eq!(a.len(), ID_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
