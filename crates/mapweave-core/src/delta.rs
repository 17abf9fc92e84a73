//! Typed deltas fanned out to every session subscribed to a space.

use crate::id::{EntityId, PlacementId, SessionId};
use crate::model::{FilteredEdge, FilteredNode, Placeable};
use serde::{Deserialize, Serialize};

/// Tags a delta with the session request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub session: SessionId,
    /// The temporary id the session used for the entity.
    pub local_id: EntityId,
}

/// One mutation, with the minimal payload needed to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Delta {
    NodeAdded {
        node: FilteredNode,
        placement_id: PlacementId,
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Origin>,
    },
    NodeMoved {
        id: EntityId,
        placement_id: PlacementId,
        x: f64,
        y: f64,
    },
    NodeRemoved {
        id: EntityId,
        placement_id: PlacementId,
    },
    EdgeAdded {
        edge: FilteredEdge,
        endpoint1: Option<FilteredNode>,
        endpoint2: Option<FilteredNode>,
        placement_id: PlacementId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Origin>,
    },
    EdgeUpdated {
        id: EntityId,
        /// Current values.
        edge: FilteredEdge,
        /// Names of the fields that changed.
        changed: Vec<String>,
        /// Prior values of the changed fields.
        previous: serde_json::Value,
    },
    EdgeRemoved {
        id: EntityId,
        placement_id: PlacementId,
    },
}

impl Delta {
    /// The node or edge this delta is about.
    pub fn subject(&self) -> Placeable {
        match self {
            Delta::NodeAdded { node, .. } => Placeable::Node(node.id),
            Delta::NodeMoved { id, .. } | Delta::NodeRemoved { id, .. } => Placeable::Node(*id),
            Delta::EdgeAdded { edge, .. } => Placeable::Edge(edge.id),
            Delta::EdgeUpdated { id, .. } | Delta::EdgeRemoved { id, .. } => Placeable::Edge(*id),
        }
    }

    pub fn origin(&self) -> Option<Origin> {
        match self {
            Delta::NodeAdded { origin, .. } | Delta::EdgeAdded { origin, .. } => *origin,
            _ => None,
        }
    }

    /// Wire name of the delta kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Delta::NodeAdded { .. } => "nodeAdded",
            Delta::NodeMoved { .. } => "nodeMoved",
            Delta::NodeRemoved { .. } => "nodeRemoved",
            Delta::EdgeAdded { .. } => "edgeAdded",
            Delta::EdgeUpdated { .. } => "edgeUpdated",
            Delta::EdgeRemoved { .. } => "edgeRemoved",
        }
    }
}
