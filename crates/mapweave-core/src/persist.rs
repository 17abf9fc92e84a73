//! Persistence collaborator for nodes, edges, placements and spaces.

use crate::id::{EntityId, PlacementId, SpaceId, UserId};
use crate::model::{Edge, Node, Placeable, Placement, Space};
use kurbo::Point;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Persistence errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("persistence unreachable: {0}")]
    Unreachable(String),
    #[error("persistence error: {0}")]
    Other(String),
}

pub type PersistResult<T> = Result<T, PersistError>;

/// Boxed future returned by persistence and mutation calls.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Placement to be created; persistence assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPlacement {
    pub space_id: SpaceId,
    pub placeable: Placeable,
    pub position: Option<Point>,
    pub user_id: UserId,
}

/// Durable storage. Every call returns the canonical record.
///
/// Entity ids handed out for nodes and edges come from one sequence, so a
/// durable id never names both a node and an edge.
pub trait Persistence: Send + Sync {
    fn space(&self, id: SpaceId) -> BoxFuture<'_, PersistResult<Space>>;

    fn create_node(&self, node: Node) -> BoxFuture<'_, PersistResult<Node>>;
    fn update_node(&self, node: Node) -> BoxFuture<'_, PersistResult<Node>>;
    fn node(&self, id: EntityId) -> BoxFuture<'_, PersistResult<Node>>;

    fn create_edge(&self, edge: Edge) -> BoxFuture<'_, PersistResult<Edge>>;
    fn update_edge(&self, edge: Edge) -> BoxFuture<'_, PersistResult<Edge>>;
    fn edge(&self, id: EntityId) -> BoxFuture<'_, PersistResult<Edge>>;

    fn create_placement(&self, placement: NewPlacement) -> BoxFuture<'_, PersistResult<Placement>>;
    fn update_placement(&self, placement: Placement) -> BoxFuture<'_, PersistResult<Placement>>;
    fn placement(&self, id: PlacementId) -> BoxFuture<'_, PersistResult<Placement>>;
    fn destroy_placement(&self, id: PlacementId) -> BoxFuture<'_, PersistResult<()>>;

    /// Every placement of `placeable`, across spaces.
    fn placements_of(&self, placeable: Placeable) -> BoxFuture<'_, PersistResult<Vec<Placement>>>;
    /// Every placement in `space`, in creation order.
    fn placements_in(&self, space: SpaceId) -> BoxFuture<'_, PersistResult<Vec<Placement>>>;
}

#[derive(Default)]
struct Tables {
    next_id: i64,
    spaces: HashMap<SpaceId, Space>,
    nodes: HashMap<EntityId, Node>,
    edges: HashMap<EntityId, Edge>,
    placements: Vec<Placement>,
}

impl Tables {
    fn next(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory persistence for tests and single-process use.
pub struct MemoryPersistence {
    tables: RwLock<Tables>,
    reachable: AtomicBool,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            reachable: AtomicBool::new(true),
        }
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a space directly (spaces are managed outside the core).
    pub fn insert_space(&self, space: Space) {
        let mut tables = match self.tables.write() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        tables.next_id = tables.next_id.max(space.id.0);
        tables.spaces.insert(space.id, space);
    }

    /// Simulate losing (or regaining) the connection to storage.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn node_count(&self) -> usize {
        self.read(|t| Ok(t.nodes.len())).unwrap_or(0)
    }

    pub fn edge_count(&self) -> usize {
        self.read(|t| Ok(t.edges.len())).unwrap_or(0)
    }

    pub fn placement_count(&self) -> usize {
        self.read(|t| Ok(t.placements.len())).unwrap_or(0)
    }

    fn check(&self) -> PersistResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PersistError::Unreachable("memory store offline".to_string()))
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> PersistResult<T>) -> PersistResult<T> {
        self.check()?;
        let tables = self
            .tables
            .read()
            .map_err(|e| PersistError::Other(format!("Lock error: {}", e)))?;
        f(&tables)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> PersistResult<T>) -> PersistResult<T> {
        self.check()?;
        let mut tables = self
            .tables
            .write()
            .map_err(|e| PersistError::Other(format!("Lock error: {}", e)))?;
        f(&mut tables)
    }
}

impl Persistence for MemoryPersistence {
    fn space(&self, id: SpaceId) -> BoxFuture<'_, PersistResult<Space>> {
        Box::pin(async move {
            self.read(|t| {
                t.spaces
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| PersistError::NotFound(format!("space {}", id)))
            })
        })
    }

    fn create_node(&self, mut node: Node) -> BoxFuture<'_, PersistResult<Node>> {
        Box::pin(async move {
            self.write(|t| {
                node.id = EntityId::Durable(t.next());
                t.nodes.insert(node.id, node.clone());
                Ok(node)
            })
        })
    }

    fn update_node(&self, node: Node) -> BoxFuture<'_, PersistResult<Node>> {
        Box::pin(async move {
            self.write(|t| match t.nodes.get_mut(&node.id) {
                Some(existing) => {
                    *existing = node.clone();
                    Ok(node)
                }
                None => Err(PersistError::NotFound(format!("node {}", node.id))),
            })
        })
    }

    fn node(&self, id: EntityId) -> BoxFuture<'_, PersistResult<Node>> {
        Box::pin(async move {
            self.read(|t| {
                t.nodes
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| PersistError::NotFound(format!("node {}", id)))
            })
        })
    }

    fn create_edge(&self, mut edge: Edge) -> BoxFuture<'_, PersistResult<Edge>> {
        Box::pin(async move {
            self.write(|t| {
                for endpoint in [edge.endpoint1_id, edge.endpoint2_id] {
                    if !t.nodes.contains_key(&endpoint) {
                        return Err(PersistError::NotFound(format!("node {}", endpoint)));
                    }
                }
                edge.id = EntityId::Durable(t.next());
                t.edges.insert(edge.id, edge.clone());
                Ok(edge)
            })
        })
    }

    fn update_edge(&self, edge: Edge) -> BoxFuture<'_, PersistResult<Edge>> {
        Box::pin(async move {
            self.write(|t| match t.edges.get_mut(&edge.id) {
                Some(existing) => {
                    *existing = edge.clone();
                    Ok(edge)
                }
                None => Err(PersistError::NotFound(format!("edge {}", edge.id))),
            })
        })
    }

    fn edge(&self, id: EntityId) -> BoxFuture<'_, PersistResult<Edge>> {
        Box::pin(async move {
            self.read(|t| {
                t.edges
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| PersistError::NotFound(format!("edge {}", id)))
            })
        })
    }

    fn create_placement(&self, placement: NewPlacement) -> BoxFuture<'_, PersistResult<Placement>> {
        Box::pin(async move {
            self.write(|t| {
                if !t.spaces.contains_key(&placement.space_id) {
                    return Err(PersistError::NotFound(format!("space {}", placement.space_id)));
                }
                let placement = Placement {
                    id: PlacementId(t.next()),
                    space_id: placement.space_id,
                    placeable: placement.placeable,
                    position: placement.position,
                    user_id: placement.user_id,
                    updated_by: None,
                };
                t.placements.push(placement.clone());
                Ok(placement)
            })
        })
    }

    fn update_placement(&self, placement: Placement) -> BoxFuture<'_, PersistResult<Placement>> {
        Box::pin(async move {
            self.write(|t| match t.placements.iter_mut().find(|p| p.id == placement.id) {
                Some(existing) => {
                    *existing = placement.clone();
                    Ok(placement)
                }
                None => Err(PersistError::NotFound(format!("placement {}", placement.id))),
            })
        })
    }

    fn placement(&self, id: PlacementId) -> BoxFuture<'_, PersistResult<Placement>> {
        Box::pin(async move {
            self.read(|t| {
                t.placements
                    .iter()
                    .find(|p| p.id == id)
                    .cloned()
                    .ok_or_else(|| PersistError::NotFound(format!("placement {}", id)))
            })
        })
    }

    fn destroy_placement(&self, id: PlacementId) -> BoxFuture<'_, PersistResult<()>> {
        Box::pin(async move {
            self.write(|t| {
                let before = t.placements.len();
                t.placements.retain(|p| p.id != id);
                if t.placements.len() == before {
                    return Err(PersistError::NotFound(format!("placement {}", id)));
                }
                Ok(())
            })
        })
    }

    fn placements_of(&self, placeable: Placeable) -> BoxFuture<'_, PersistResult<Vec<Placement>>> {
        Box::pin(async move {
            self.read(|t| {
                Ok(t.placements
                    .iter()
                    .filter(|p| p.placeable == placeable)
                    .cloned()
                    .collect())
            })
        })
    }

    fn placements_in(&self, space: SpaceId) -> BoxFuture<'_, PersistResult<Vec<Placement>>> {
        Box::pin(async move {
            self.read(|t| {
                Ok(t.placements
                    .iter()
                    .filter(|p| p.space_id == space)
                    .cloned()
                    .collect())
            })
        })
    }
}
