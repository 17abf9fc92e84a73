//! Hit-testing of nodes and edges under the pointer.

use crate::camera::Camera;
use crate::geometry::{in_circle, on_segment};
use crate::id::EntityId;
use crate::store::GraphStore;
use kurbo::Point;
use serde::{Deserialize, Serialize};

/// Hit-test tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HitConfig {
    /// Node display radius in world units.
    pub node_radius: f64,
    /// Edge tolerance in screen pixels.
    pub edge_epsilon: f64,
}

impl Default for HitConfig {
    fn default() -> Self {
        Self {
            node_radius: 25.0,
            edge_epsilon: 5.0,
        }
    }
}

/// What is under a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Node(EntityId),
    Edge(EntityId),
    Canvas,
}

/// Topmost node whose disc contains `screen_point`.
pub fn node_at(store: &GraphStore, camera: &Camera, screen_point: Point, config: &HitConfig) -> Option<EntityId> {
    let world = camera.screen_to_world(screen_point);
    let nodes: Vec<_> = store.nodes().collect();
    nodes
        .into_iter()
        .rev()
        .find(|entry| in_circle(world, entry.position, config.node_radius))
        .map(|entry| entry.node.id)
}

/// Topmost edge within `edge_epsilon` screen pixels of `screen_point`.
pub fn edge_at(store: &GraphStore, camera: &Camera, screen_point: Point, config: &HitConfig) -> Option<EntityId> {
    let world = camera.screen_to_world(screen_point);
    let epsilon = camera.screen_len_to_world(config.edge_epsilon);
    let edges: Vec<_> = store.edges().collect();
    edges
        .into_iter()
        .rev()
        .find(|entry| {
            store
                .edge_endpoints(&entry.edge)
                .is_some_and(|(a, b)| on_segment(world, a, b, epsilon))
        })
        .map(|entry| entry.edge.id)
}

/// Nodes are drawn over edges, so they win.
pub fn hit_test(store: &GraphStore, camera: &Camera, screen_point: Point, config: &HitConfig) -> Target {
    if let Some(node) = node_at(store, camera, screen_point, config) {
        return Target::Node(node);
    }
    match edge_at(store, camera, screen_point, config) {
        Some(edge) => Target::Edge(edge),
        None => Target::Canvas,
    }
}
