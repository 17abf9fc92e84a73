//! Per-session in-memory graph for one open space.

use crate::id::{EntityId, PlacementId};
use crate::model::{Edge, Node};
use kurbo::Point;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Graph store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("entity not found: {0}")]
    NotFound(EntityId),
    #[error("id {0} is already in use")]
    IdCollision(EntityId),
    #[error("edge {edge} references missing node {endpoint}")]
    MissingEndpoint { edge: EntityId, endpoint: EntityId },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Updated,
}

/// A node as shown on this session's canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub node: Node,
    pub placement_id: Option<PlacementId>,
    pub position: Point,
    /// False while a persist request for this node is in flight.
    pub confirmed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeEntry {
    pub edge: Edge,
    pub placement_id: Option<PlacementId>,
    pub confirmed: bool,
}

/// An edge taken out of the store, with its place in the draw order.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedEdge {
    pub entry: EdgeEntry,
    pub index: usize,
}

/// What `remove_node` took out of the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedNode {
    pub node: NodeEntry,
    pub index: usize,
    /// Incident edges removed in the same batch, in draw order.
    pub edges: Vec<RemovedEdge>,
}

/// Point-in-time copy of the graph in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<NodeEntry>,
    pub edges: Vec<EdgeEntry>,
}

/// Authoritative graph of one open space for one session.
///
/// Mutation goes through `&mut self`, so a session's event processing is
/// the only writer. Every edge's endpoints are present in the node set at
/// all times.
#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    nodes: HashMap<EntityId, NodeEntry>,
    edges: HashMap<EntityId, EdgeEntry>,
    /// Node ids in insertion order (back to front).
    node_order: Vec<EntityId>,
    /// Edge ids in insertion order.
    edge_order: Vec<EntityId>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a node in place.
    ///
    /// `position` and `placement_id` are only overwritten when given.
    pub fn upsert_node(
        &mut self,
        node: Node,
        placement_id: Option<PlacementId>,
        position: Option<Point>,
    ) -> Upsert {
        let id = node.id;
        if let Some(entry) = self.nodes.get_mut(&id) {
            entry.node = node;
            if placement_id.is_some() {
                entry.placement_id = placement_id;
            }
            if let Some(position) = position {
                entry.position = position;
            }
            return Upsert::Updated;
        }
        self.nodes.insert(
            id,
            NodeEntry {
                node,
                placement_id,
                position: position.unwrap_or(Point::ZERO),
                confirmed: id.is_durable(),
            },
        );
        self.node_order.push(id);
        Upsert::Inserted
    }

    pub fn move_node(&mut self, id: EntityId, position: Point) -> StoreResult<Point> {
        let entry = self.nodes.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let previous = entry.position;
        entry.position = position;
        Ok(previous)
    }

    /// Remove a node together with every edge touching it.
    pub fn remove_node(&mut self, id: EntityId) -> StoreResult<RemovedNode> {
        let node = self.nodes.remove(&id).ok_or(StoreError::NotFound(id))?;
        let index = take_from(&mut self.node_order, id);

        let incident: Vec<(usize, EntityId)> = self
            .edge_order
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, e)| self.edges.get(e).is_some_and(|entry| entry.edge.touches(id)))
            .collect();
        let mut edges = Vec::with_capacity(incident.len());
        for (index, edge_id) in incident {
            if let Some(entry) = self.edges.remove(&edge_id) {
                edges.push(RemovedEdge { entry, index });
            }
        }
        self.edge_order.retain(|e| self.edges.contains_key(e));
        if !edges.is_empty() {
            log::debug!("removing node {} cascaded to {} edge(s)", id, edges.len());
        }

        Ok(RemovedNode { node, index, edges })
    }

    /// Insert or update an edge in place. Both endpoints must already exist.
    pub fn upsert_edge(&mut self, edge: Edge, placement_id: Option<PlacementId>) -> StoreResult<Upsert> {
        for endpoint in [edge.endpoint1_id, edge.endpoint2_id] {
            if !self.nodes.contains_key(&endpoint) {
                return Err(StoreError::MissingEndpoint {
                    edge: edge.id,
                    endpoint,
                });
            }
        }
        let id = edge.id;
        if let Some(entry) = self.edges.get_mut(&id) {
            entry.edge = edge;
            if placement_id.is_some() {
                entry.placement_id = placement_id;
            }
            return Ok(Upsert::Updated);
        }
        self.edges.insert(
            id,
            EdgeEntry {
                edge,
                placement_id,
                confirmed: id.is_durable(),
            },
        );
        self.edge_order.push(id);
        Ok(Upsert::Inserted)
    }

    pub fn remove_edge(&mut self, id: EntityId) -> StoreResult<RemovedEdge> {
        let entry = self.edges.remove(&id).ok_or(StoreError::NotFound(id))?;
        let index = take_from(&mut self.edge_order, id);
        Ok(RemovedEdge { entry, index })
    }

    /// Put back what `remove_node` returned, at its former draw positions.
    ///
    /// Fails without touching the store if the node id is taken again.
    pub fn restore_node(&mut self, removed: RemovedNode) -> StoreResult<()> {
        let RemovedNode { node, index, edges } = removed;
        let id = node.node.id;
        if self.contains(id) {
            return Err(StoreError::IdCollision(id));
        }
        self.nodes.insert(id, node);
        self.node_order.insert(index.min(self.node_order.len()), id);
        for edge in edges {
            let edge_id = edge.entry.edge.id;
            if let Err(err) = self.restore_edge(edge) {
                log::debug!("edge {} not restored: {}", edge_id, err);
            }
        }
        Ok(())
    }

    /// Put back what `remove_edge` returned, at its former draw position.
    pub fn restore_edge(&mut self, removed: RemovedEdge) -> StoreResult<()> {
        let RemovedEdge { entry, index } = removed;
        let id = entry.edge.id;
        if self.contains(id) {
            return Err(StoreError::IdCollision(id));
        }
        for endpoint in [entry.edge.endpoint1_id, entry.edge.endpoint2_id] {
            if !self.nodes.contains_key(&endpoint) {
                return Err(StoreError::MissingEndpoint { edge: id, endpoint });
            }
        }
        self.edges.insert(id, entry);
        self.edge_order.insert(index.min(self.edge_order.len()), id);
        Ok(())
    }

    /// Reassign an entity from `old` to `new`, including every edge endpoint
    /// and direction that referenced `old`.
    ///
    /// Fails without touching the store if `new` is already taken.
    pub fn rewrite_id(&mut self, old: EntityId, new: EntityId) -> StoreResult<()> {
        if old == new {
            return if self.contains(old) { Ok(()) } else { Err(StoreError::NotFound(old)) };
        }
        if self.contains(new) {
            return Err(StoreError::IdCollision(new));
        }

        if let Some(mut entry) = self.nodes.remove(&old) {
            entry.node.id = new;
            self.nodes.insert(new, entry);
            replace_in(&mut self.node_order, old, new);
            for edge in self.edges.values_mut() {
                edge.edge.rewrite_endpoint(old, new);
            }
            return Ok(());
        }

        if let Some(mut entry) = self.edges.remove(&old) {
            entry.edge.id = new;
            self.edges.insert(new, entry);
            replace_in(&mut self.edge_order, old, new);
            return Ok(());
        }

        Err(StoreError::NotFound(old))
    }

    /// Mark an entity as acknowledged (or not) by persistence.
    pub fn set_confirmed(&mut self, id: EntityId, confirmed: bool) -> StoreResult<()> {
        if let Some(entry) = self.nodes.get_mut(&id) {
            entry.confirmed = confirmed;
            return Ok(());
        }
        if let Some(entry) = self.edges.get_mut(&id) {
            entry.confirmed = confirmed;
            return Ok(());
        }
        Err(StoreError::NotFound(id))
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.nodes.contains_key(&id) || self.edges.contains_key(&id)
    }

    pub fn node(&self, id: EntityId) -> Option<&NodeEntry> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: EntityId) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(&id)
    }

    pub fn edge(&self, id: EntityId) -> Option<&EdgeEntry> {
        self.edges.get(&id)
    }

    pub fn edge_mut(&mut self, id: EntityId) -> Option<&mut EdgeEntry> {
        self.edges.get_mut(&id)
    }

    /// Nodes back to front.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Edges in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = &EdgeEntry> {
        self.edge_order.iter().filter_map(|id| self.edges.get(id))
    }

    /// Endpoint positions of an edge.
    pub fn edge_endpoints(&self, edge: &Edge) -> Option<(Point, Point)> {
        let a = self.nodes.get(&edge.endpoint1_id)?;
        let b = self.nodes.get(&edge.endpoint2_id)?;
        Some((a.position, b.position))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            nodes: self.nodes().cloned().collect(),
            edges: self.edges().cloned().collect(),
        }
    }

    /// Drop everything (full reload).
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
        self.node_order.clear();
        self.edge_order.clear();
    }
}

/// Remove `id` from `order`, returning where it was.
fn take_from(order: &mut Vec<EntityId>, id: EntityId) -> usize {
    match order.iter().position(|n| *n == id) {
        Some(index) => {
            order.remove(index);
            index
        }
        None => order.len(),
    }
}

fn replace_in(order: &mut [EntityId], old: EntityId, new: EntityId) {
    for id in order.iter_mut() {
        if *id == old {
            *id = new;
        }
    }
}
