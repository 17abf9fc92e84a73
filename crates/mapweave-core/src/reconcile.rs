//! Applies inbound deltas to a session's graph, resolving them against the
//! session's own pending optimistic writes.

use crate::delta::{Delta, Origin};
use crate::id::{EntityId, PlacementId, SessionId};
use crate::model::{FilteredEdge, FilteredNode};
use crate::store::{GraphStore, StoreError};
use kurbo::Point;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// What applying a delta did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A pending local entity now carries its durable id.
    Confirmed { local: EntityId, durable: EntityId },
    Changed,
    /// The delta referred to something this session does not show.
    Ignored,
}

/// Per-session reconciler. Owned by the session next to its [`GraphStore`].
#[derive(Debug)]
pub struct SyncReconciler {
    session: SessionId,
    pending: HashSet<EntityId>,
}

impl SyncReconciler {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            pending: HashSet::new(),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Remember that `local` awaits a durable id.
    pub fn track(&mut self, local: EntityId) {
        self.pending.insert(local);
    }

    pub fn is_pending(&self, id: EntityId) -> bool {
        self.pending.contains(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Rewrite `local` to `durable` and mark it confirmed.
    ///
    /// Returns `Ok(false)` when `local` was already confirmed, so the ack and
    /// the origin-tagged delta can arrive in either order.
    pub fn confirm(&mut self, store: &mut GraphStore, local: EntityId, durable: EntityId) -> ReconcileResult<bool> {
        if !self.pending.contains(&local) {
            return Ok(false);
        }
        if let Err(err) = store.rewrite_id(local, durable) {
            log::warn!("dropping confirmation {} -> {}: {}", local, durable, err);
            self.pending.remove(&local);
            return Err(err.into());
        }
        self.pending.remove(&local);
        store.set_confirmed(durable, true)?;
        log::debug!("confirmed {} as {}", local, durable);
        Ok(true)
    }

    /// Undo an optimistic write that persistence refused.
    pub fn rollback(&mut self, store: &mut GraphStore, local: EntityId) {
        self.pending.remove(&local);
        if store.node(local).is_some() {
            let _ = store.remove_node(local);
        } else if store.edge(local).is_some() {
            let _ = store.remove_edge(local);
        }
        log::debug!("rolled back {}", local);
    }

    fn own_pending(&self, origin: Option<Origin>) -> Option<EntityId> {
        origin
            .filter(|o| o.session == self.session && self.pending.contains(&o.local_id))
            .map(|o| o.local_id)
    }

    /// Apply one delta. Errors leave the store in its prior state.
    pub fn apply(&mut self, store: &mut GraphStore, delta: Delta) -> ReconcileResult<Applied> {
        match delta {
            Delta::NodeAdded { node, placement_id, x, y, origin } => {
                let position = Point::new(x, y);
                if let Some(local) = self.own_pending(origin) {
                    self.confirm(store, local, node.id)?;
                    merge_node(store, &node, Some(placement_id), Some(position));
                    return Ok(Applied::Confirmed { local, durable: node.id });
                }
                merge_node(store, &node, Some(placement_id), Some(position));
                Ok(Applied::Changed)
            }
            Delta::NodeMoved { id, x, y, .. } => match store.move_node(id, Point::new(x, y)) {
                Ok(_) => Ok(Applied::Changed),
                Err(StoreError::NotFound(_)) => Ok(Applied::Ignored),
                Err(err) => Err(err.into()),
            },
            Delta::NodeRemoved { id, .. } => match store.remove_node(id) {
                Ok(_) => Ok(Applied::Changed),
                Err(StoreError::NotFound(_)) => Ok(Applied::Ignored),
                Err(err) => Err(err.into()),
            },
            Delta::EdgeAdded { edge, endpoint1, endpoint2, placement_id, origin } => {
                for id in [edge.endpoint1_id, edge.endpoint2_id] {
                    let carried = [&endpoint1, &endpoint2].into_iter().flatten().any(|n| n.id == id);
                    if !carried && store.node(id).is_none() {
                        return Err(StoreError::MissingEndpoint { edge: edge.id, endpoint: id }.into());
                    }
                }
                for endpoint in [endpoint1, endpoint2].into_iter().flatten() {
                    if store.node(endpoint.id).is_none() {
                        log::debug!("edge {} brought in unseen node {}", edge.id, endpoint.id);
                        merge_node(store, &endpoint, None, None);
                    }
                }
                if let Some(local) = self.own_pending(origin) {
                    self.confirm(store, local, edge.id)?;
                    merge_edge(store, &edge, Some(placement_id))?;
                    return Ok(Applied::Confirmed { local, durable: edge.id });
                }
                merge_edge(store, &edge, Some(placement_id))?;
                Ok(Applied::Changed)
            }
            Delta::EdgeUpdated { id, edge, .. } => {
                if store.edge(id).is_none() {
                    return Ok(Applied::Ignored);
                }
                merge_edge(store, &edge, None)?;
                Ok(Applied::Changed)
            }
            Delta::EdgeRemoved { id, .. } => match store.remove_edge(id) {
                Ok(_) => Ok(Applied::Changed),
                Err(StoreError::NotFound(_)) => Ok(Applied::Ignored),
                Err(err) => Err(err.into()),
            },
        }
    }
}

/// Upsert from a filtered projection, keeping local-only fields.
fn merge_node(store: &mut GraphStore, node: &FilteredNode, placement_id: Option<PlacementId>, position: Option<Point>) {
    match store.node_mut(node.id) {
        Some(entry) => {
            entry.node.name = node.name.clone();
            entry.node.category = node.category.clone();
            entry.node.permission = node.permission;
            if placement_id.is_some() {
                entry.placement_id = placement_id;
            }
            if let Some(position) = position {
                entry.position = position;
            }
        }
        None => {
            store.upsert_node(node.to_node(), placement_id, position);
        }
    }
}

fn merge_edge(store: &mut GraphStore, edge: &FilteredEdge, placement_id: Option<PlacementId>) -> Result<(), StoreError> {
    match store.edge_mut(edge.id) {
        Some(entry) => {
            entry.edge.description = edge.description.clone();
            entry.edge.category = edge.category;
            entry.edge.direction = edge.direction;
            entry.edge.permission = edge.permission;
            if placement_id.is_some() {
                entry.placement_id = placement_id;
            }
            Ok(())
        }
        None => store.upsert_edge(edge.to_edge(), placement_id).map(|_| ()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::UserId;
    use crate::model::{Edge, EdgeCategory, Node, Space};

    fn added(id: i64, name: &str, x: f64, origin: Option<Origin>) -> Delta {
        Delta::NodeAdded {
            node: Node::new(EntityId::Durable(id), name, UserId(1)).filtered(None::<&Space>),
            placement_id: PlacementId(100 + id),
            x,
            y: 0.0,
            origin,
        }
    }

    fn setup() -> (SyncReconciler, GraphStore) {
        (SyncReconciler::new(SessionId::new()), GraphStore::new())
    }

    fn optimistic_node(reconciler: &mut SyncReconciler, store: &mut GraphStore, name: &str) -> EntityId {
        let local = EntityId::local();
        store.upsert_node(Node::new(local, name, UserId(1)), None, Some(Point::new(5.0, 5.0)));
        reconciler.track(local);
        local
    }

    #[test]
    fn test_own_delta_rewrites_pending_id() {
        let (mut reconciler, mut store) = setup();
        let local = optimistic_node(&mut reconciler, &mut store, "idea");
        let origin = Origin { session: reconciler.session(), local_id: local };

        let applied = reconciler.apply(&mut store, added(1, "idea", 5.0, Some(origin))).unwrap();
        assert_eq!(applied, Applied::Confirmed { local, durable: EntityId::Durable(1) });
        assert!(store.node(local).is_none());
        let entry = store.node(EntityId::Durable(1)).unwrap();
        assert!(entry.confirmed);
        assert_eq!(entry.placement_id, Some(PlacementId(101)));
        assert_eq!(store.node_count(), 1);
        assert_eq!(reconciler.pending_count(), 0);
    }

    #[test]
    fn test_ack_then_delta_is_idempotent() {
        let (mut reconciler, mut store) = setup();
        let local = optimistic_node(&mut reconciler, &mut store, "idea");
        assert!(reconciler.confirm(&mut store, local, EntityId::Durable(1)).unwrap());
        assert!(!reconciler.confirm(&mut store, local, EntityId::Durable(1)).unwrap());

        let origin = Origin { session: reconciler.session(), local_id: local };
        let applied = reconciler.apply(&mut store, added(1, "idea", 5.0, Some(origin))).unwrap();
        assert_eq!(applied, Applied::Changed);
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn test_foreign_origin_is_plain_upsert() {
        let (mut reconciler, mut store) = setup();
        let local = optimistic_node(&mut reconciler, &mut store, "mine");
        let foreign = Origin { session: SessionId::new(), local_id: local };
        reconciler.apply(&mut store, added(1, "theirs", 0.0, Some(foreign))).unwrap();
        assert_eq!(store.node_count(), 2);
        assert!(reconciler.is_pending(local));
    }

    #[test]
    fn test_collision_is_dropped_and_store_unchanged() {
        let (mut reconciler, mut store) = setup();
        let local = optimistic_node(&mut reconciler, &mut store, "idea");
        store.upsert_node(Node::new(EntityId::Durable(1), "existing", UserId(2)), None, None);
        let before = store.snapshot();

        let origin = Origin { session: reconciler.session(), local_id: local };
        let result = reconciler.apply(&mut store, added(1, "idea", 5.0, Some(origin)));
        assert_eq!(
            result,
            Err(ReconcileError::Store(StoreError::IdCollision(EntityId::Durable(1))))
        );
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_moves_last_delivered_wins() {
        let (mut reconciler, mut store) = setup();
        reconciler.apply(&mut store, added(1, "T", 0.0, None)).unwrap();
        for (x, y) in [(10.0, 10.0), (200.0, -40.0)] {
            reconciler
                .apply(&mut store, Delta::NodeMoved { id: EntityId::Durable(1), placement_id: PlacementId(101), x, y })
                .unwrap();
        }
        assert_eq!(store.node(EntityId::Durable(1)).unwrap().position, Point::new(200.0, -40.0));
    }

    #[test]
    fn test_unknown_targets_are_ignored() {
        let (mut reconciler, mut store) = setup();
        let moved = Delta::NodeMoved { id: EntityId::Durable(9), placement_id: PlacementId(1), x: 0.0, y: 0.0 };
        assert_eq!(reconciler.apply(&mut store, moved).unwrap(), Applied::Ignored);
        let removed = Delta::EdgeRemoved { id: EntityId::Durable(9), placement_id: PlacementId(1) };
        assert_eq!(reconciler.apply(&mut store, removed).unwrap(), Applied::Ignored);
    }

    #[test]
    fn test_edge_added_brings_missing_endpoints() {
        let (mut reconciler, mut store) = setup();
        let a = Node::new(EntityId::Durable(1), "a", UserId(1));
        let b = Node::new(EntityId::Durable(2), "b", UserId(1));
        let edge = Edge::new(EntityId::Durable(3), a.id, b.id, UserId(1)).with_description("causes");
        reconciler.apply(&mut store, added(1, "a", 0.0, None)).unwrap();

        reconciler
            .apply(
                &mut store,
                Delta::EdgeAdded {
                    edge: edge.filtered(None),
                    endpoint1: Some(a.filtered(None)),
                    endpoint2: Some(b.filtered(None)),
                    placement_id: PlacementId(50),
                    origin: None,
                },
            )
            .unwrap();
        assert_eq!(store.node_count(), 2);
        assert_eq!(store.edge(edge.id).unwrap().edge.description, "causes");

        reconciler
            .apply(&mut store, Delta::NodeRemoved { id: b.id, placement_id: PlacementId(102) })
            .unwrap();
        assert_eq!(store.edge_count(), 0);
    }

    #[test]
    fn test_edge_added_without_endpoint_changes_nothing() {
        let (mut reconciler, mut store) = setup();
        let a = Node::new(EntityId::Durable(1), "a", UserId(1));
        let b = Node::new(EntityId::Durable(2), "b", UserId(1));
        let edge = Edge::new(EntityId::Durable(3), a.id, b.id, UserId(1));

        let result = reconciler.apply(
            &mut store,
            Delta::EdgeAdded {
                edge: edge.filtered(None),
                endpoint1: Some(a.filtered(None)),
                endpoint2: None,
                placement_id: PlacementId(50),
                origin: None,
            },
        );
        assert_eq!(
            result,
            Err(ReconcileError::Store(StoreError::MissingEndpoint { edge: edge.id, endpoint: b.id }))
        );
        assert!(store.is_empty());
        assert_eq!(store.edge_count(), 0);
    }

    #[test]
    fn test_edge_updated_keeps_local_fields() {
        let (mut reconciler, mut store) = setup();
        let a = EntityId::Durable(1);
        let b = EntityId::Durable(2);
        store.upsert_node(Node::new(a, "a", UserId(1)), None, None);
        store.upsert_node(Node::new(b, "b", UserId(1)), None, None);
        let mut edge = Edge::new(EntityId::Durable(3), a, b, UserId(1));
        edge.show_description = true;
        store.upsert_edge(edge.clone(), Some(PlacementId(7))).unwrap();

        let mut changed = edge.clone();
        changed.category = EdgeCategory::Both;
        changed.description = "relates".to_string();
        reconciler
            .apply(
                &mut store,
                Delta::EdgeUpdated {
                    id: edge.id,
                    edge: changed.filtered(None),
                    changed: vec!["category".into(), "description".into()],
                    previous: serde_json::json!({ "category": "none", "description": "" }),
                },
            )
            .unwrap();
        let entry = store.edge(edge.id).unwrap();
        assert_eq!(entry.edge.category, EdgeCategory::Both);
        assert!(entry.edge.show_description);
        assert_eq!(entry.placement_id, Some(PlacementId(7)));
    }

    #[test]
    fn test_rollback_removes_optimistic_entity() {
        let (mut reconciler, mut store) = setup();
        let local = optimistic_node(&mut reconciler, &mut store, "doomed");
        reconciler.rollback(&mut store, local);
        assert!(store.is_empty());
        assert!(!reconciler.is_pending(local));
    }
}
