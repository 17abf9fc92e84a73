//! Append-only audit trail, one event per published mutation.

use crate::id::{SpaceId, UserId};
use crate::model::Placeable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    NodeAddedToSpace,
    NodeMovedOnSpace,
    NodeRemovedFromSpace,
    NodeUpdated,
    EdgeAddedToSpace,
    EdgeRemovedFromSpace,
    EdgeUpdated,
}

/// Immutable record of one mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub kind: AuditKind,
    pub subject: Placeable,
    /// `None` for entity-level updates that are not tied to one space.
    pub space_id: Option<SpaceId>,
    pub actor_id: UserId,
    pub meta: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        kind: AuditKind,
        subject: Placeable,
        space_id: Option<SpaceId>,
        actor_id: UserId,
        meta: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            subject,
            space_id,
            actor_id,
            meta,
            timestamp: Utc::now(),
        }
    }
}

/// Durable sink for audit events.
pub trait AuditLog: Send + Sync {
    fn append(&self, event: AuditEvent);
}

/// In-memory audit log.
#[derive(Default)]
pub struct MemoryAuditLog {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event so far, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        match self.events.read() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditLog for MemoryAuditLog {
    fn append(&self, event: AuditEvent) {
        log::debug!("audit {:?} {:?} by {}", event.kind, event.subject, event.actor_id);
        match self.events.write() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}
