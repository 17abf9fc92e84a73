//! Server-side mutation path: authorize, validate, persist, then publish.
//!
//! Every operation runs as a sequence of awaited steps. Persistence always
//! completes before the corresponding delta is published, and creation of an
//! entity and of its placement are two separate steps: a failure in between
//! leaves an unplaced entity behind, which is logged and not rolled back.

use crate::audit::{AuditEvent, AuditKind, AuditLog};
use crate::delta::{Delta, Origin};
use crate::hub::BroadcastHub;
use crate::id::{EntityId, PlacementId, SessionId, SpaceId, UserId};
use crate::model::{Edge, Node, Placeable, Placement, Space, ValidationError};
use crate::persist::{BoxFuture, NewPlacement, PersistError, Persistence};
use crate::policy::Policy;
use crate::watch::{WatchReason, WatchRegistry};
use kurbo::Point;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported back to the session that issued a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum MutationError {
    #[error("not permitted: {0}")]
    PolicyDenied(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("network failure: {0}")]
    Network(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{0}")]
    Other(String),
}

impl MutationError {
    /// Short machine-readable name.
    pub fn kind(&self) -> &'static str {
        match self {
            MutationError::PolicyDenied(_) => "policy_denied",
            MutationError::Validation(_) => "validation",
            MutationError::Network(_) => "network",
            MutationError::NotFound(_) => "not_found",
            MutationError::Other(_) => "other",
        }
    }
}

impl From<PersistError> for MutationError {
    fn from(err: PersistError) -> Self {
        match err {
            PersistError::NotFound(what) => MutationError::NotFound(what),
            PersistError::Unreachable(why) => MutationError::Network(why),
            PersistError::Other(why) => MutationError::Other(why),
        }
    }
}

pub type MutationResult<T> = Result<T, MutationError>;

/// Who is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user: UserId,
    pub session: SessionId,
}

/// A mutation request as issued by a session.
///
/// New entities carry the session's local id; the acknowledgement reports
/// it back next to the durable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    CreateNode { space: SpaceId, node: Node, x: f64, y: f64 },
    MoveNode { placement_id: PlacementId, x: f64, y: f64 },
    UpdateNode { space: SpaceId, node: Node },
    CreateEdge { space: SpaceId, edge: Edge },
    UpdateEdge { space: SpaceId, edge: Edge },
    RemovePlacement { placement_id: PlacementId },
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::CreateNode { .. } => "create_node",
            Mutation::MoveNode { .. } => "move_node",
            Mutation::UpdateNode { .. } => "update_node",
            Mutation::CreateEdge { .. } => "create_edge",
            Mutation::UpdateEdge { .. } => "update_edge",
            Mutation::RemovePlacement { .. } => "remove_placement",
        }
    }
}

/// Successful outcome of a [`Mutation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Ack {
    NodeCreated { local_id: EntityId, node: Node, placement: Placement },
    NodeMoved { placement: Placement },
    NodeUpdated { node: Node },
    EdgeCreated { local_id: EntityId, edge: Edge, placement: Placement },
    EdgeUpdated { edge: Edge },
    PlacementRemoved {
        placement_id: PlacementId,
        /// Edge placements removed along with a node placement.
        cascaded: Vec<PlacementId>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedNode {
    pub node: Node,
    pub placement: Placement,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedEdge {
    pub edge: Edge,
    pub placement: Placement,
}

/// Full contents of a space, used for the initial load and full reloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpaceContents {
    pub space: Space,
    pub nodes: Vec<PlacedNode>,
    pub edges: Vec<PlacedEdge>,
}

/// The session's view of the server.
pub trait Remote: Send + Sync {
    fn submit(&self, actor: Actor, mutation: Mutation) -> BoxFuture<'_, MutationResult<Ack>>;
    fn fetch_space(&self, space: SpaceId) -> BoxFuture<'_, MutationResult<SpaceContents>>;
}

/// Mutation path shared by every session of every space.
pub struct SpaceService {
    persistence: Arc<dyn Persistence>,
    hub: Arc<dyn BroadcastHub>,
    policy: Arc<dyn Policy>,
    audit: Arc<dyn AuditLog>,
    watches: Arc<WatchRegistry>,
}

impl SpaceService {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        hub: Arc<dyn BroadcastHub>,
        policy: Arc<dyn Policy>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            persistence,
            hub,
            policy,
            audit,
            watches: Arc::new(WatchRegistry::new()),
        }
    }

    pub fn watches(&self) -> &WatchRegistry {
        &self.watches
    }

    pub async fn apply(&self, actor: Actor, mutation: Mutation) -> MutationResult<Ack> {
        log::debug!("{} requested by user {}", mutation.name(), actor.user);
        match mutation {
            Mutation::CreateNode { space, node, x, y } => {
                self.create_node(actor, space, node, Point::new(x, y)).await
            }
            Mutation::MoveNode { placement_id, x, y } => {
                self.move_node(actor, placement_id, Point::new(x, y)).await
            }
            Mutation::UpdateNode { space, node } => self.update_node(actor, space, node).await,
            Mutation::CreateEdge { space, edge } => self.create_edge(actor, space, edge).await,
            Mutation::UpdateEdge { space, edge } => self.update_edge(actor, space, edge).await,
            Mutation::RemovePlacement { placement_id } => {
                self.remove_placement(actor, placement_id).await
            }
        }
    }

    pub async fn create_node(
        &self,
        actor: Actor,
        space_id: SpaceId,
        mut node: Node,
        position: Point,
    ) -> MutationResult<Ack> {
        let space = self.persistence.space(space_id).await?;
        if !self.policy.can_create(actor.user, &space) {
            return Err(denied("create a node", &space));
        }
        node.validate()?;

        let local_id = node.id;
        node.user_id = actor.user;
        node.updated_by = None;
        if node.defer_to_space == Some(space.id) {
            node.permission = space.permission;
        }
        let node = self.persistence.create_node(node).await?;
        let placement = self
            .place(actor, &space, Placeable::Node(node.id), Some(position))
            .await?;

        self.hub.publish(
            space.id,
            Delta::NodeAdded {
                node: node.filtered(Some(&space)),
                placement_id: placement.id,
                x: position.x,
                y: position.y,
                origin: Some(Origin { session: actor.session, local_id }),
            },
            AuditEvent::new(
                AuditKind::NodeAddedToSpace,
                Placeable::Node(node.id),
                Some(space.id),
                actor.user,
                json!({ "placement_id": placement.id, "x": position.x, "y": position.y }),
            ),
        );
        log::info!("node {} added to space {}", node.id, space.id);
        Ok(Ack::NodeCreated { local_id, node, placement })
    }

    pub async fn move_node(
        &self,
        actor: Actor,
        placement_id: PlacementId,
        position: Point,
    ) -> MutationResult<Ack> {
        let mut placement = self.persistence.placement(placement_id).await?;
        let Placeable::Node(node_id) = placement.placeable else {
            return Err(ValidationError::CoordinatesOnEdge.into());
        };
        let space = self.persistence.space(placement.space_id).await?;
        if !self.policy.can_update(actor.user, &space, placement.placeable) {
            return Err(denied("move a node", &space));
        }
        if placement.position == Some(position) {
            return Ok(Ack::NodeMoved { placement });
        }

        placement.position = Some(position);
        placement.updated_by = Some(actor.user);
        let placement = self.persistence.update_placement(placement).await?;
        self.watches.watch(space.id, actor.user, WatchReason::Contributed);

        self.hub.publish(
            space.id,
            Delta::NodeMoved {
                id: node_id,
                placement_id,
                x: position.x,
                y: position.y,
            },
            AuditEvent::new(
                AuditKind::NodeMovedOnSpace,
                Placeable::Node(node_id),
                Some(space.id),
                actor.user,
                json!({ "placement_id": placement_id, "x": position.x, "y": position.y }),
            ),
        );
        Ok(Ack::NodeMoved { placement })
    }

    /// Edit a node's attributes. Recorded in the audit log only; node edits
    /// are not broadcast.
    pub async fn update_node(&self, actor: Actor, space_id: SpaceId, node: Node) -> MutationResult<Ack> {
        let space = self.persistence.space(space_id).await?;
        let current = self.persistence.node(node.id).await?;
        if !self.policy.can_update(actor.user, &space, Placeable::Node(node.id)) {
            return Err(denied("update a node", &space));
        }
        node.validate()?;

        let mut updated = current.clone();
        updated.name = node.name;
        updated.description = node.description;
        updated.link = node.link;
        updated.category = node.category;
        updated.permission = node.permission;
        updated.updated_by = Some(actor.user);

        let mut diff = Diff::default();
        diff.field("name", &current.name, &updated.name);
        diff.field("description", &current.description, &updated.description);
        diff.field("link", &current.link, &updated.link);
        diff.field("category", &current.category, &updated.category);
        diff.field("permission", &current.permission, &updated.permission);

        let node = self.persistence.update_node(updated).await?;
        if !diff.is_empty() {
            self.audit.append(AuditEvent::new(
                AuditKind::NodeUpdated,
                Placeable::Node(node.id),
                None,
                actor.user,
                diff.meta(),
            ));
        }
        Ok(Ack::NodeUpdated { node })
    }

    pub async fn create_edge(&self, actor: Actor, space_id: SpaceId, mut edge: Edge) -> MutationResult<Ack> {
        let space = self.persistence.space(space_id).await?;
        if !self.policy.can_create(actor.user, &space) {
            return Err(denied("create an edge", &space));
        }
        edge.validate()?;
        for endpoint in [edge.endpoint1_id, edge.endpoint2_id] {
            if !endpoint.is_durable() {
                return Err(ValidationError::UnconfirmedEndpoint(endpoint).into());
            }
        }

        let local_id = edge.id;
        edge.user_id = actor.user;
        edge.updated_by = None;
        if edge.defer_to_space == Some(space.id) {
            edge.permission = space.permission;
        }
        let edge = self.persistence.create_edge(edge).await?;
        let placement = self.place(actor, &space, Placeable::Edge(edge.id), None).await?;

        let endpoint1 = self.persistence.node(edge.endpoint1_id).await.ok();
        let endpoint2 = self.persistence.node(edge.endpoint2_id).await.ok();
        self.hub.publish(
            space.id,
            Delta::EdgeAdded {
                edge: edge.filtered(Some(&space)),
                endpoint1: endpoint1.map(|n| n.filtered(Some(&space))),
                endpoint2: endpoint2.map(|n| n.filtered(Some(&space))),
                placement_id: placement.id,
                origin: Some(Origin { session: actor.session, local_id }),
            },
            AuditEvent::new(
                AuditKind::EdgeAddedToSpace,
                Placeable::Edge(edge.id),
                Some(space.id),
                actor.user,
                json!({ "placement_id": placement.id }),
            ),
        );
        log::info!("edge {} added to space {}", edge.id, space.id);
        Ok(Ack::EdgeCreated { local_id, edge, placement })
    }

    /// Edit an edge. Endpoints are fixed once created.
    ///
    /// When a watched field changes, one `edge_updated` event is recorded
    /// and an `edgeUpdated` delta reaches every space holding the edge.
    pub async fn update_edge(&self, actor: Actor, space_id: SpaceId, edge: Edge) -> MutationResult<Ack> {
        let space = self.persistence.space(space_id).await?;
        let current = self.persistence.edge(edge.id).await?;
        if !self.policy.can_update(actor.user, &space, Placeable::Edge(edge.id)) {
            return Err(denied("update an edge", &space));
        }

        let mut updated = current.clone();
        updated.description = edge.description;
        updated.category = edge.category;
        updated.direction = edge.direction;
        updated.permission = edge.permission;
        updated.defer_to_space = edge.defer_to_space;
        updated.show_description = edge.show_description;
        updated.updated_by = Some(actor.user);
        updated.validate()?;

        let mut diff = Diff::default();
        diff.field("description", &current.description, &updated.description);
        diff.field("category", &current.category, &updated.category);
        diff.field("permission", &current.permission, &updated.permission);
        diff.field("defer_to_space", &current.defer_to_space, &updated.defer_to_space);

        let edge = self.persistence.update_edge(updated).await?;
        if diff.is_empty() {
            return Ok(Ack::EdgeUpdated { edge });
        }

        let event = AuditEvent::new(
            AuditKind::EdgeUpdated,
            Placeable::Edge(edge.id),
            None,
            actor.user,
            diff.meta(),
        );
        let mut spaces: Vec<SpaceId> = self
            .persistence
            .placements_of(Placeable::Edge(edge.id))
            .await?
            .into_iter()
            .map(|p| p.space_id)
            .collect();
        spaces.sort();
        spaces.dedup();

        let mut event = Some(event);
        for target in spaces {
            let holder = self.persistence.space(target).await.ok();
            let delta = Delta::EdgeUpdated {
                id: edge.id,
                edge: edge.filtered(holder.as_ref()),
                changed: diff.changed.clone(),
                previous: Value::Object(diff.previous.clone()),
            };
            match event.take() {
                Some(event) => self.hub.publish(target, delta, event),
                None => self.hub.relay(target, delta),
            }
        }
        if let Some(event) = event {
            self.audit.append(event);
        }
        Ok(Ack::EdgeUpdated { edge })
    }

    /// Remove a node or edge from its space.
    ///
    /// Removing a node placement first removes the placements of the edges
    /// touching that node on the same space.
    pub async fn remove_placement(&self, actor: Actor, placement_id: PlacementId) -> MutationResult<Ack> {
        let placement = self.persistence.placement(placement_id).await?;
        let space = self.persistence.space(placement.space_id).await?;
        if !self.policy.can_destroy(actor.user, &space, placement.placeable) {
            return Err(denied("remove a placement", &space));
        }

        let mut cascaded = Vec::new();
        match placement.placeable {
            Placeable::Edge(_) => self.remove_edge_placement(actor, &space, &placement).await?,
            Placeable::Node(node_id) => {
                for other in self.persistence.placements_in(space.id).await? {
                    let Placeable::Edge(edge_id) = other.placeable else {
                        continue;
                    };
                    let touches = match self.persistence.edge(edge_id).await {
                        Ok(edge) => edge.touches(node_id),
                        Err(err) => {
                            log::warn!("placement {} points at missing edge {}: {}", other.id, edge_id, err);
                            false
                        }
                    };
                    if touches {
                        self.remove_edge_placement(actor, &space, &other).await?;
                        cascaded.push(other.id);
                    }
                }
                self.remove_node_placement(actor, &space, &placement, node_id).await?;
            }
        }
        self.watches.watch(space.id, actor.user, WatchReason::Contributed);
        Ok(Ack::PlacementRemoved { placement_id, cascaded })
    }

    async fn remove_edge_placement(&self, actor: Actor, space: &Space, placement: &Placement) -> MutationResult<()> {
        let edge_id = placement.placeable.entity_id();
        let mut edge = self.persistence.edge(edge_id).await?;
        if edge.defer_to_space == Some(space.id) {
            edge.permission = space.permission;
            edge.defer_to_space = None;
            self.persistence.update_edge(edge).await?;
            log::debug!("edge {} permission rebased to space {}", edge_id, space.id);
        }
        self.persistence.destroy_placement(placement.id).await?;
        self.hub.publish(
            space.id,
            Delta::EdgeRemoved { id: edge_id, placement_id: placement.id },
            AuditEvent::new(
                AuditKind::EdgeRemovedFromSpace,
                Placeable::Edge(edge_id),
                Some(space.id),
                actor.user,
                json!({ "placement_id": placement.id }),
            ),
        );
        Ok(())
    }

    async fn remove_node_placement(
        &self,
        actor: Actor,
        space: &Space,
        placement: &Placement,
        node_id: EntityId,
    ) -> MutationResult<()> {
        let mut node = self.persistence.node(node_id).await?;
        if node.defer_to_space == Some(space.id) {
            node.permission = space.permission;
            node.defer_to_space = None;
            self.persistence.update_node(node).await?;
            log::debug!("node {} permission rebased to space {}", node_id, space.id);
        }
        self.persistence.destroy_placement(placement.id).await?;
        self.hub.publish(
            space.id,
            Delta::NodeRemoved { id: node_id, placement_id: placement.id },
            AuditEvent::new(
                AuditKind::NodeRemovedFromSpace,
                Placeable::Node(node_id),
                Some(space.id),
                actor.user,
                json!({ "placement_id": placement.id }),
            ),
        );
        Ok(())
    }

    async fn place(
        &self,
        actor: Actor,
        space: &Space,
        placeable: Placeable,
        position: Option<Point>,
    ) -> MutationResult<Placement> {
        let request = NewPlacement {
            space_id: space.id,
            placeable,
            position,
            user_id: actor.user,
        };
        match self.persistence.create_placement(request).await {
            Ok(placement) => {
                self.watches.watch(space.id, actor.user, WatchReason::Contributed);
                Ok(placement)
            }
            Err(err) => {
                log::warn!(
                    "{:?} was stored but could not be placed on space {}: {}",
                    placeable,
                    space.id,
                    err
                );
                Err(err.into())
            }
        }
    }

    pub async fn load(&self, space_id: SpaceId) -> MutationResult<SpaceContents> {
        let space = self.persistence.space(space_id).await?;
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for placement in self.persistence.placements_in(space_id).await? {
            match placement.placeable {
                Placeable::Node(id) => match self.persistence.node(id).await {
                    Ok(node) => nodes.push(PlacedNode { node, placement }),
                    Err(err) => log::warn!("skipping placement {}: {}", placement.id, err),
                },
                Placeable::Edge(id) => match self.persistence.edge(id).await {
                    Ok(edge) => edges.push(PlacedEdge { edge, placement }),
                    Err(err) => log::warn!("skipping placement {}: {}", placement.id, err),
                },
            }
        }
        Ok(SpaceContents { space, nodes, edges })
    }
}

impl Remote for SpaceService {
    fn submit(&self, actor: Actor, mutation: Mutation) -> BoxFuture<'_, MutationResult<Ack>> {
        Box::pin(self.apply(actor, mutation))
    }

    fn fetch_space(&self, space: SpaceId) -> BoxFuture<'_, MutationResult<SpaceContents>> {
        Box::pin(self.load(space))
    }
}

fn denied(what: &str, space: &Space) -> MutationError {
    MutationError::PolicyDenied(format!("may not {} on space {}", what, space.id))
}

/// Changed-field bookkeeping for update audit events.
#[derive(Default)]
struct Diff {
    current: Map<String, Value>,
    previous: Map<String, Value>,
    changed: Vec<String>,
}

impl Diff {
    fn field<T: Serialize + PartialEq>(&mut self, name: &str, old: &T, new: &T) {
        let new_value = serde_json::to_value(new).unwrap_or(Value::Null);
        self.current.insert(name.to_string(), new_value);
        if old != new {
            self.previous
                .insert(name.to_string(), serde_json::to_value(old).unwrap_or(Value::Null));
            self.changed.push(name.to_string());
        }
    }

    fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    /// New values, with prior values taking precedence for changed keys.
    fn meta(&self) -> Value {
        let mut meta = self.current.clone();
        for (key, value) in &self.previous {
            meta.insert(key.clone(), value.clone());
        }
        meta.insert("changed".to_string(), json!(self.changed));
        Value::Object(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::hub::{LocalHub, Subscription};
    use crate::model::{EdgeCategory, Permission};
    use crate::persist::MemoryPersistence;
    use crate::policy::{AllowAll, EditorsOnly};
    use crate::test_util::block_on;
    use std::sync::Mutex;

    struct Fixture {
        persistence: Arc<MemoryPersistence>,
        audit: Arc<MemoryAuditLog>,
        hub: Arc<LocalHub>,
        service: SpaceService,
    }

    fn fixture_with(policy: Arc<dyn Policy>) -> Fixture {
        let persistence = Arc::new(MemoryPersistence::new());
        let mut space = Space::new(SpaceId(1), "map", Permission::Public);
        space.editors = vec![UserId(1), UserId(2)];
        persistence.insert_space(space);
        persistence.insert_space(Space::new(SpaceId(2), "other", Permission::Commons));
        let audit = Arc::new(MemoryAuditLog::new());
        let hub = Arc::new(LocalHub::new(audit.clone()));
        let service = SpaceService::new(persistence.clone(), hub.clone(), policy, audit.clone());
        Fixture { persistence, audit, hub, service }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(AllowAll))
    }

    fn actor() -> Actor {
        Actor { user: UserId(1), session: SessionId::new() }
    }

    fn create_node(f: &Fixture, actor: Actor, name: &str) -> (Node, Placement) {
        let node = Node::new(EntityId::local(), name, actor.user);
        match block_on(f.service.create_node(actor, SpaceId(1), node, Point::new(10.0, 20.0))).unwrap() {
            Ack::NodeCreated { node, placement, .. } => (node, placement),
            other => panic!("unexpected ack {:?}", other),
        }
    }

    fn create_edge(f: &Fixture, space: SpaceId, a: EntityId, b: EntityId) -> (Edge, Placement) {
        let edge = Edge::new(EntityId::local(), a, b, UserId(1)).with_description("causes");
        match block_on(f.service.create_edge(actor(), space, edge)).unwrap() {
            Ack::EdgeCreated { edge, placement, .. } => (edge, placement),
            other => panic!("unexpected ack {:?}", other),
        }
    }

    fn drain(sub: &Subscription) -> Vec<Delta> {
        sub.drain()
    }

    #[test]
    fn test_create_node_persists_then_publishes() {
        let f = fixture();
        let sub = f.hub.subscribe(SpaceId(1));
        let actor = actor();
        let local = EntityId::local();
        let ack = block_on(f.service.create_node(
            actor,
            SpaceId(1),
            Node::new(local, "Idea", UserId(99)),
            Point::new(3.0, 4.0),
        ))
        .unwrap();

        let Ack::NodeCreated { local_id, node, placement } = ack else {
            panic!("expected node ack");
        };
        assert_eq!(local_id, local);
        assert!(node.id.is_durable());
        assert_eq!(node.user_id, UserId(1));
        assert_eq!(placement.position, Some(Point::new(3.0, 4.0)));

        let deltas = drain(&sub);
        assert_eq!(deltas.len(), 1);
        match &deltas[0] {
            Delta::NodeAdded { node: filtered, placement_id, x, y, origin } => {
                assert_eq!(filtered.id, node.id);
                assert_eq!(*placement_id, placement.id);
                assert_eq!((*x, *y), (3.0, 4.0));
                assert_eq!(*origin, Some(Origin { session: actor.session, local_id: local }));
            }
            other => panic!("unexpected delta {:?}", other),
        }
        assert_eq!(f.audit.events()[0].kind, AuditKind::NodeAddedToSpace);
        assert_eq!(f.service.watches().watchers(SpaceId(1)).len(), 1);
    }

    #[test]
    fn test_validation_failure_has_no_side_effects() {
        let f = fixture();
        let sub = f.hub.subscribe(SpaceId(1));
        let result = block_on(f.service.create_node(
            actor(),
            SpaceId(1),
            Node::new(EntityId::local(), "", UserId(1)),
            Point::ZERO,
        ));
        assert_eq!(result, Err(MutationError::Validation(ValidationError::EmptyName)));
        assert!(drain(&sub).is_empty());
        assert!(f.audit.is_empty());
        assert_eq!(f.persistence.node_count(), 0);
    }

    #[test]
    fn test_policy_denied_before_any_write() {
        let f = fixture_with(Arc::new(EditorsOnly));
        let outsider = Actor { user: UserId(50), session: SessionId::new() };
        let node = Node::new(EntityId::local(), "Idea", outsider.user);
        let result = block_on(f.service.create_node(outsider, SpaceId(1), node, Point::ZERO));
        assert!(matches!(result, Err(MutationError::PolicyDenied(_))));
        assert_eq!(f.persistence.node_count(), 0);
        assert!(f.audit.is_empty());
    }

    #[test]
    fn test_unreachable_persistence_is_network_failure() {
        let f = fixture();
        f.persistence.set_reachable(false);
        let node = Node::new(EntityId::local(), "Idea", UserId(1));
        let result = block_on(f.service.create_node(actor(), SpaceId(1), node, Point::ZERO));
        assert!(matches!(result, Err(MutationError::Network(_))));
    }

    #[test]
    fn test_create_edge_publishes_one_delta_with_endpoints() {
        let f = fixture();
        let (a, _) = create_node(&f, actor(), "A");
        let (b, _) = create_node(&f, actor(), "B");
        let sub = f.hub.subscribe(SpaceId(1));

        let (edge, placement) = create_edge(&f, SpaceId(1), a.id, b.id);
        assert_eq!(edge.endpoint1_id, a.id);
        assert_eq!(edge.endpoint2_id, b.id);
        assert_eq!(edge.description, "causes");

        let deltas = drain(&sub);
        assert_eq!(deltas.len(), 1);
        let Delta::EdgeAdded { endpoint1, endpoint2, placement_id, .. } = &deltas[0] else {
            panic!("expected edgeAdded");
        };
        assert_eq!(endpoint1.as_ref().map(|n| n.id), Some(a.id));
        assert_eq!(endpoint2.as_ref().map(|n| n.id), Some(b.id));
        assert_eq!(*placement_id, placement.id);
    }

    #[test]
    fn test_edge_needs_durable_endpoints() {
        let f = fixture();
        let (a, _) = create_node(&f, actor(), "A");
        let pending = EntityId::local();
        let edge = Edge::new(EntityId::local(), a.id, pending, UserId(1));
        let result = block_on(f.service.create_edge(actor(), SpaceId(1), edge));
        assert_eq!(
            result,
            Err(MutationError::Validation(ValidationError::UnconfirmedEndpoint(pending)))
        );
        assert_eq!(f.persistence.edge_count(), 0);
    }

    #[test]
    fn test_move_publishes_only_on_change() {
        let f = fixture();
        let (node, placement) = create_node(&f, actor(), "A");
        let sub = f.hub.subscribe(SpaceId(1));

        block_on(f.service.move_node(actor(), placement.id, Point::new(10.0, 20.0))).unwrap();
        assert!(drain(&sub).is_empty());

        block_on(f.service.move_node(actor(), placement.id, Point::new(50.0, 60.0))).unwrap();
        assert_eq!(
            drain(&sub),
            vec![Delta::NodeMoved { id: node.id, placement_id: placement.id, x: 50.0, y: 60.0 }]
        );
        let last = f.audit.events().pop().unwrap();
        assert_eq!(last.kind, AuditKind::NodeMovedOnSpace);
        assert_eq!(last.meta["x"], 50.0);
    }

    #[test]
    fn test_update_edge_reaches_every_space_with_one_audit_event() {
        let f = fixture();
        let (a, _) = create_node(&f, actor(), "A");
        let (b, _) = create_node(&f, actor(), "B");
        let (edge, _) = create_edge(&f, SpaceId(1), a.id, b.id);
        block_on(f.persistence.create_placement(NewPlacement {
            space_id: SpaceId(2),
            placeable: Placeable::Edge(edge.id),
            position: None,
            user_id: UserId(1),
        }))
        .unwrap();

        let first = f.hub.subscribe(SpaceId(1));
        let second = f.hub.subscribe(SpaceId(2));
        let audit_before = f.audit.len();

        let mut changed = edge.clone();
        changed.description = "prevents".to_string();
        changed.category = EdgeCategory::Both;
        block_on(f.service.update_edge(actor(), SpaceId(1), changed)).unwrap();

        assert_eq!(drain(&first).len(), 1);
        let deltas = drain(&second);
        let Delta::EdgeUpdated { changed, previous, edge: filtered, .. } = &deltas[0] else {
            panic!("expected edgeUpdated");
        };
        assert_eq!(changed, &vec!["description".to_string(), "category".to_string()]);
        assert_eq!(previous["description"], "causes");
        assert_eq!(filtered.description, "prevents");

        let events = f.audit.events();
        assert_eq!(events.len(), audit_before + 1);
        let meta = &events[audit_before].meta;
        assert_eq!(meta["description"], "causes");
        assert_eq!(meta["permission"], "commons");
        assert_eq!(meta["changed"][1], "category");
    }

    #[test]
    fn test_update_edge_without_watched_change_is_silent() {
        let f = fixture();
        let (a, _) = create_node(&f, actor(), "A");
        let (b, _) = create_node(&f, actor(), "B");
        let (mut edge, _) = create_edge(&f, SpaceId(1), a.id, b.id);
        let sub = f.hub.subscribe(SpaceId(1));
        let audit_before = f.audit.len();

        edge.show_description = true;
        let Ack::EdgeUpdated { edge } = block_on(f.service.update_edge(actor(), SpaceId(1), edge)).unwrap() else {
            panic!("expected edge ack");
        };
        assert!(edge.show_description);
        assert!(drain(&sub).is_empty());
        assert_eq!(f.audit.len(), audit_before);
    }

    #[test]
    fn test_update_node_is_audited_not_broadcast() {
        let f = fixture();
        let (mut node, _) = create_node(&f, actor(), "A");
        let sub = f.hub.subscribe(SpaceId(1));
        node.name = "Renamed".to_string();
        block_on(f.service.update_node(actor(), SpaceId(1), node)).unwrap();
        assert!(drain(&sub).is_empty());
        let last = f.audit.events().pop().unwrap();
        assert_eq!(last.kind, AuditKind::NodeUpdated);
        assert_eq!(last.meta["changed"], json!(["name"]));
    }

    #[test]
    fn test_remove_node_placement_cascades_edges_first() {
        let f = fixture();
        let (a, pa) = create_node(&f, actor(), "A");
        let (b, _) = create_node(&f, actor(), "B");
        let (c, _) = create_node(&f, actor(), "C");
        let (ab, ab_placement) = create_edge(&f, SpaceId(1), a.id, b.id);
        create_edge(&f, SpaceId(1), b.id, c.id);
        let sub = f.hub.subscribe(SpaceId(1));

        let ack = block_on(f.service.remove_placement(actor(), pa.id)).unwrap();
        assert_eq!(
            ack,
            Ack::PlacementRemoved { placement_id: pa.id, cascaded: vec![ab_placement.id] }
        );
        assert_eq!(
            drain(&sub),
            vec![
                Delta::EdgeRemoved { id: ab.id, placement_id: ab_placement.id },
                Delta::NodeRemoved { id: a.id, placement_id: pa.id },
            ]
        );
    }

    /// Hub that records the stored permission of each removed entity at the
    /// moment its removal is published.
    struct RemovalWitness {
        persistence: Arc<MemoryPersistence>,
        seen: Mutex<Vec<(EntityId, Permission, Option<SpaceId>)>>,
    }

    impl BroadcastHub for RemovalWitness {
        fn publish(&self, _: SpaceId, delta: Delta, _: AuditEvent) {
            let stored = match delta {
                Delta::NodeRemoved { id, .. } => {
                    block_on(self.persistence.node(id)).map(|n| (id, n.permission, n.defer_to_space))
                }
                Delta::EdgeRemoved { id, .. } => {
                    block_on(self.persistence.edge(id)).map(|e| (id, e.permission, e.defer_to_space))
                }
                _ => return,
            };
            self.seen.lock().unwrap().push(stored.unwrap());
        }

        fn relay(&self, _: SpaceId, _: Delta) {}

        fn subscriber_count(&self, _: SpaceId) -> usize {
            0
        }
    }

    #[test]
    fn test_deferred_permission_rebased_before_removal() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence.insert_space(Space::new(SpaceId(1), "map", Permission::Public));
        let audit = Arc::new(MemoryAuditLog::new());
        let hub = Arc::new(RemovalWitness { persistence: persistence.clone(), seen: Mutex::new(Vec::new()) });
        let service = SpaceService::new(persistence.clone(), hub.clone(), Arc::new(AllowAll), audit.clone());

        let mut placed = Vec::new();
        for name in ["A", "B", "C"] {
            let mut node = Node::new(EntityId::local(), name, UserId(1));
            node.defer_to_space = Some(SpaceId(1));
            match block_on(service.create_node(actor(), SpaceId(1), node, Point::ZERO)).unwrap() {
                Ack::NodeCreated { node, placement, .. } => placed.push((node, placement)),
                other => panic!("unexpected ack {:?}", other),
            }
        }
        let (a, b, c) = (placed[0].clone(), placed[1].0.id, placed[2].0.id);
        assert_eq!(a.0.permission, Permission::Public);

        let mut edges = Vec::new();
        for (from, to) in [(a.0.id, b), (b, c)] {
            let mut edge = Edge::new(EntityId::local(), from, to, UserId(1));
            edge.defer_to_space = Some(SpaceId(1));
            match block_on(service.create_edge(actor(), SpaceId(1), edge)).unwrap() {
                Ack::EdgeCreated { edge, placement, .. } => edges.push((edge, placement)),
                other => panic!("unexpected ack {:?}", other),
            }
        }

        // The space turns private after everything was placed.
        persistence.insert_space(Space::new(SpaceId(1), "map", Permission::Private));
        block_on(service.remove_placement(actor(), edges[1].1.id)).unwrap();
        block_on(service.remove_placement(actor(), a.1.id)).unwrap();

        let seen = hub.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (edges[1].0.id, Permission::Private, None),
                (edges[0].0.id, Permission::Private, None),
                (a.0.id, Permission::Private, None),
            ]
        );
        let untouched = block_on(persistence.node(b)).unwrap();
        assert_eq!(untouched.permission, Permission::Public);
        assert_eq!(untouched.defer_to_space, Some(SpaceId(1)));
        assert_eq!(audit.events().pop().unwrap().kind, AuditKind::NodeRemovedFromSpace);
    }

    #[test]
    fn test_removal_registers_contributor() {
        let f = fixture();
        let (_, placement) = create_node(&f, actor(), "A");
        let remover = Actor { user: UserId(2), session: SessionId::new() };
        block_on(f.service.remove_placement(remover, placement.id)).unwrap();

        let watchers = f.service.watches().watchers(SpaceId(1));
        let contributor = watchers.iter().find(|w| w.user_id == UserId(2)).unwrap();
        assert_eq!(contributor.reason, WatchReason::Contributed);
    }

    #[test]
    fn test_load_returns_placed_entities() {
        let f = fixture();
        let (a, _) = create_node(&f, actor(), "A");
        let (b, _) = create_node(&f, actor(), "B");
        create_edge(&f, SpaceId(1), a.id, b.id);
        let contents = block_on(f.service.fetch_space(SpaceId(1))).unwrap();
        assert_eq!(contents.nodes.len(), 2);
        assert_eq!(contents.edges.len(), 1);
        assert_eq!(contents.space.name, "map");
    }

    #[test]
    fn test_error_wire_shape() {
        let err = MutationError::Validation(ValidationError::EmptyName);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "validation");
        assert_eq!(json["detail"]["reason"], "empty_name");
        assert_eq!(err.kind(), "validation");
    }
}
