//! Domain model: nodes, edges, placements and spaces.

use crate::id::{EntityId, PlacementId, SpaceId, UserId};
use kurbo::Point;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Visibility of an entity or space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    #[default]
    Commons,
    Public,
    Private,
}

/// Directionality of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EdgeCategory {
    /// Plain line.
    #[default]
    #[serde(rename = "none")]
    None,
    /// Single arrow following `Edge::direction`.
    #[serde(rename = "from-to")]
    FromTo,
    /// Arrows in both directions.
    #[serde(rename = "both")]
    Both,
}

/// Domain constraint violations. Reported to the initiating session only.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", content = "id", rename_all = "snake_case")]
pub enum ValidationError {
    #[error("node name must not be empty")]
    EmptyName,
    #[error("edge endpoints must differ (both are {0})")]
    SelfLoop(EntityId),
    #[error("edge direction must start at one of its endpoints, got {0}")]
    DirectionMismatch(EntityId),
    #[error("endpoint {0} has not been confirmed yet")]
    UnconfirmedEndpoint(EntityId),
    #[error("only nodes can be placed at coordinates")]
    CoordinatesOnEdge,
}

/// A concept on the shared canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub link: Option<String>,
    /// Category (metacode) name.
    #[serde(default)]
    pub category: String,
    pub permission: Permission,
    /// Space whose permission this node inherits until detached.
    #[serde(default)]
    pub defer_to_space: Option<SpaceId>,
    pub user_id: UserId,
    #[serde(default)]
    pub updated_by: Option<UserId>,
}

impl Node {
    pub fn new(id: EntityId, name: impl Into<String>, user_id: UserId) -> Self {
        Self {
            id,
            name: name.into(),
            description: String::new(),
            link: None,
            category: String::new(),
            permission: Permission::default(),
            defer_to_space: None,
            user_id,
            updated_by: None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        Ok(())
    }

    /// Projection safe to broadcast to every observer of `space`.
    pub fn filtered(&self, space: Option<&Space>) -> FilteredNode {
        FilteredNode {
            id: self.id,
            name: self.name.clone(),
            category: self.category.clone(),
            permission: self.permission,
            user_id: self.user_id,
            collaborator_ids: collaborators(self.defer_to_space, self.user_id, space),
        }
    }
}

/// A relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EntityId,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: EdgeCategory,
    /// Ordered `(from, to)` pair, meaningful only for `EdgeCategory::FromTo`.
    #[serde(default)]
    pub direction: Option<(EntityId, EntityId)>,
    pub permission: Permission,
    #[serde(default)]
    pub defer_to_space: Option<SpaceId>,
    pub endpoint1_id: EntityId,
    pub endpoint2_id: EntityId,
    /// Whether the description is drawn as a label.
    #[serde(default)]
    pub show_description: bool,
    pub user_id: UserId,
    #[serde(default)]
    pub updated_by: Option<UserId>,
}

impl Edge {
    pub fn new(id: EntityId, endpoint1_id: EntityId, endpoint2_id: EntityId, user_id: UserId) -> Self {
        Self {
            id,
            description: String::new(),
            category: EdgeCategory::None,
            direction: None,
            permission: Permission::default(),
            defer_to_space: None,
            endpoint1_id,
            endpoint2_id,
            show_description: false,
            user_id,
            updated_by: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Make this a directed edge from `from` to `to`.
    pub fn directed(mut self, from: EntityId, to: EntityId) -> Self {
        self.category = EdgeCategory::FromTo;
        self.direction = Some((from, to));
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.endpoint1_id == self.endpoint2_id {
            return Err(ValidationError::SelfLoop(self.endpoint1_id));
        }
        if self.category == EdgeCategory::FromTo {
            if let Some((from, _)) = self.direction {
                if from != self.endpoint1_id && from != self.endpoint2_id {
                    return Err(ValidationError::DirectionMismatch(from));
                }
            }
        }
        Ok(())
    }

    pub fn touches(&self, node: EntityId) -> bool {
        self.endpoint1_id == node || self.endpoint2_id == node
    }

    /// Rewrite every reference to `old` (endpoints and direction) to `new`.
    pub(crate) fn rewrite_endpoint(&mut self, old: EntityId, new: EntityId) {
        if self.endpoint1_id == old {
            self.endpoint1_id = new;
        }
        if self.endpoint2_id == old {
            self.endpoint2_id = new;
        }
        if let Some((from, to)) = &mut self.direction {
            if *from == old {
                *from = new;
            }
            if *to == old {
                *to = new;
            }
        }
    }

    pub fn filtered(&self, space: Option<&Space>) -> FilteredEdge {
        FilteredEdge {
            id: self.id,
            description: self.description.clone(),
            category: self.category,
            direction: self.direction,
            permission: self.permission,
            user_id: self.user_id,
            collaborator_ids: collaborators(self.defer_to_space, self.user_id, space),
            endpoint1_id: self.endpoint1_id,
            endpoint2_id: self.endpoint2_id,
        }
    }
}

fn collaborators(defer: Option<SpaceId>, owner: UserId, space: Option<&Space>) -> Vec<UserId> {
    match (defer, space) {
        (Some(defer), Some(space)) if defer == space.id => space
            .editors
            .iter()
            .copied()
            .filter(|editor| *editor != owner)
            .collect(),
        _ => Vec::new(),
    }
}

/// What a placement attaches to its space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Placeable {
    Node(EntityId),
    Edge(EntityId),
}

impl Placeable {
    pub fn entity_id(&self) -> EntityId {
        match self {
            Placeable::Node(id) | Placeable::Edge(id) => *id,
        }
    }
}

/// Attaches a node or edge to a space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: PlacementId,
    pub space_id: SpaceId,
    pub placeable: Placeable,
    /// Canvas coordinates; nodes only.
    #[serde(default)]
    pub position: Option<Point>,
    pub user_id: UserId,
    #[serde(default)]
    pub updated_by: Option<UserId>,
}

impl Placement {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if matches!(self.placeable, Placeable::Edge(_)) && self.position.is_some() {
            return Err(ValidationError::CoordinatesOnEdge);
        }
        Ok(())
    }
}

/// A shared space (map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Space {
    pub id: SpaceId,
    pub name: String,
    pub permission: Permission,
    #[serde(default)]
    pub editors: Vec<UserId>,
}

impl Space {
    pub fn new(id: SpaceId, name: impl Into<String>, permission: Permission) -> Self {
        Self {
            id,
            name: name.into(),
            permission,
            editors: Vec::new(),
        }
    }
}

/// Broadcast-safe view of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredNode {
    pub id: EntityId,
    pub name: String,
    pub category: String,
    pub permission: Permission,
    pub user_id: UserId,
    pub collaborator_ids: Vec<UserId>,
}

impl FilteredNode {
    /// Rebuild a local node from the projection.
    pub fn to_node(&self) -> Node {
        let mut node = Node::new(self.id, self.name.clone(), self.user_id);
        node.category = self.category.clone();
        node.permission = self.permission;
        node
    }
}

/// Broadcast-safe view of an edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredEdge {
    pub id: EntityId,
    pub description: String,
    pub category: EdgeCategory,
    pub direction: Option<(EntityId, EntityId)>,
    pub permission: Permission,
    pub user_id: UserId,
    pub collaborator_ids: Vec<UserId>,
    pub endpoint1_id: EntityId,
    pub endpoint2_id: EntityId,
}

impl FilteredEdge {
    pub fn to_edge(&self) -> Edge {
        let mut edge = Edge::new(self.id, self.endpoint1_id, self.endpoint2_id, self.user_id);
        edge.description = self.description.clone();
        edge.category = self.category;
        edge.direction = self.direction;
        edge.permission = self.permission;
        edge
    }
}
