//! Identifiers for graph entities, spaces, placements and users.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a node or edge.
///
/// Entities created optimistically by a session carry a `Local` id until
/// persistence hands back the durable one. The two forms never alias each
/// other: a `Local` id is only meaningful to the session that generated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityId {
    /// Id assigned by the persistence collaborator.
    Durable(i64),
    /// Session-local temporary id.
    Local(Uuid),
}

impl EntityId {
    /// Generate a fresh session-local id.
    pub fn local() -> Self {
        EntityId::Local(Uuid::new_v4())
    }

    pub fn is_durable(&self) -> bool {
        matches!(self, EntityId::Durable(_))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, EntityId::Local(_))
    }

    /// The durable value, if any.
    pub fn durable(&self) -> Option<i64> {
        match self {
            EntityId::Durable(id) => Some(*id),
            EntityId::Local(_) => None,
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId::Durable(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Durable(id) => write!(f, "{}", id),
            EntityId::Local(uuid) => write!(f, "local:{}", uuid),
        }
    }
}

macro_rules! durable_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

durable_id!(
    /// A shared space (map); also the broadcast channel address.
    SpaceId
);
durable_id!(
    /// A placement record attaching a node or edge to a space.
    PlacementId
);
durable_id!(
    /// An acting user.
    UserId
);

/// Identifies the session that issued a request, so it can recognise the
/// resulting delta as its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ids_are_unique() {
        assert_ne!(EntityId::local(), EntityId::local());
    }

    #[test]
    fn test_durable_accessors() {
        let id = EntityId::from(42);
        assert!(id.is_durable());
        assert_eq!(id.durable(), Some(42));
        assert!(EntityId::local().durable().is_none());
    }

    #[test]
    fn test_entity_id_serialize() {
        let json = serde_json::to_string(&EntityId::Durable(7)).unwrap();
        assert_eq!(json, r#"{"durable":7}"#);
        let space = serde_json::to_string(&SpaceId(3)).unwrap();
        assert_eq!(space, "3");
    }
}
