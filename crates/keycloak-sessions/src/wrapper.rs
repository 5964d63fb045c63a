use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::entities::SessionEntity;

/// A session entity plus the version that guards concurrent writes.
///
/// The version starts at 1 on creation and is incremented by every write that
/// goes through the update pipeline. Local metadata never leaves this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "E: SessionEntity")]
pub struct SessionEntityWrapper<E> {
    pub entity: E,
    pub version: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub local_metadata: HashMap<String, String>,
}

impl<E: SessionEntity> SessionEntityWrapper<E> {
    pub fn new(entity: E) -> Self {
        Self::with_version(entity, 1)
    }

    pub fn with_version(entity: E, version: u64) -> Self {
        Self {
            entity,
            version,
            local_metadata: HashMap::new(),
        }
    }

    /// Same metadata, next version, updated entity.
    pub fn next(&self, entity: E) -> Self {
        Self {
            entity,
            version: self.version + 1,
            local_metadata: self.local_metadata.clone(),
        }
    }

    pub fn realm_id(&self) -> &str {
        self.entity.realm_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::LoginFailureEntity;

    #[test]
    fn test_next_keeps_metadata_and_bumps_version() {
        let mut wrapper = SessionEntityWrapper::new(LoginFailureEntity::new("r", "u"));
        wrapper
            .local_metadata
            .insert("lastSync".into(), "42".into());

        let mut entity = wrapper.entity.clone();
        entity.increment_failures();
        let next = wrapper.next(entity);
        assert_eq!(next.version, 2);
        assert_eq!(next.entity.num_failures, 1);
        assert_eq!(next.local_metadata.get("lastSync").map(String::as_str), Some("42"));
        assert_eq!(next.realm_id(), "r");
    }
}
