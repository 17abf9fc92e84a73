//! Registry of users watching a space.

use crate::id::{SpaceId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchReason {
    Created,
    Contributed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watch {
    pub space_id: SpaceId,
    pub user_id: UserId,
    pub reason: WatchReason,
    pub since: DateTime<Utc>,
}

/// At most one active watch per (user, space).
#[derive(Default)]
pub struct WatchRegistry {
    watches: RwLock<HashMap<(UserId, SpaceId), Watch>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user` as a watcher of `space`. Returns false if a watch
    /// already existed, in which case the existing record is kept.
    pub fn watch(&self, space_id: SpaceId, user_id: UserId, reason: WatchReason) -> bool {
        let mut watches = match self.watches.write() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        if watches.contains_key(&(user_id, space_id)) {
            return false;
        }
        watches.insert(
            (user_id, space_id),
            Watch {
                space_id,
                user_id,
                reason,
                since: Utc::now(),
            },
        );
        true
    }

    pub fn watchers(&self, space_id: SpaceId) -> Vec<Watch> {
        let watches = match self.watches.read() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut list: Vec<Watch> = watches
            .values()
            .filter(|w| w.space_id == space_id)
            .cloned()
            .collect();
        list.sort_by_key(|w| w.user_id);
        list
    }
}
