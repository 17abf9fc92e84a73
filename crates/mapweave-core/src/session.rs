//! A client session: one open space, its graph, and the user's gestures.
//!
//! The session is the single writer of its [`GraphStore`]. Every mutation is
//! applied optimistically, sent to the [`Remote`], and then either confirmed
//! (temporary id rewritten to the durable one) or rolled back.

use crate::camera::Camera;
use crate::gesture::{GestureConfig, GestureStateMachine, Intent, Scene};
use crate::hit::{HitConfig, Target, hit_test};
use crate::hub::DeltaSource;
use crate::id::{EntityId, SpaceId};
use crate::input::InputEvent;
use crate::model::{Edge, Node, ValidationError};
use crate::reconcile::{Applied, SyncReconciler};
use crate::service::{Ack, Actor, Mutation, MutationError, MutationResult, Remote, SpaceContents};
use crate::store::{GraphStore, RemovedEdge, RemovedNode};
use kurbo::Point;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    pub gesture: GestureConfig,
    pub hit: HitConfig,
}

/// Currently selected nodes and edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub nodes: Vec<EntityId>,
    pub edges: Vec<EntityId>,
}

impl Selection {
    pub fn select_node(&mut self, id: EntityId) {
        self.clear();
        self.nodes.push(id);
    }

    /// Add `id` to the node selection, or take it out if already there.
    pub fn toggle_node(&mut self, id: EntityId) {
        match self.nodes.iter().position(|n| *n == id) {
            Some(index) => {
                self.nodes.remove(index);
            }
            None => self.nodes.push(id),
        }
    }

    pub fn select_edge(&mut self, id: EntityId) {
        self.clear();
        self.edges.push(id);
    }

    pub fn add_edge(&mut self, id: EntityId) {
        if !self.edges.contains(&id) {
            self.edges.push(id);
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.edges.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.nodes.contains(&id) || self.edges.contains(&id)
    }

    fn retain(&mut self, keep: impl Fn(EntityId) -> bool) {
        self.nodes.retain(|id| keep(*id));
        self.edges.retain(|id| keep(*id));
    }

    /// Rename or drop references after a confirmation or removal.
    fn retarget(&mut self, old: EntityId, new: Option<EntityId>) {
        for list in [&mut self.nodes, &mut self.edges] {
            list.retain_mut(|id| {
                if *id != old {
                    return true;
                }
                match new {
                    Some(new) => {
                        *id = new;
                        true
                    }
                    None => false,
                }
            });
        }
    }
}

/// Hit-testing view over the session's store and camera.
struct View<'a> {
    store: &'a GraphStore,
    camera: &'a Camera,
    hit: &'a HitConfig,
}

impl Scene for View<'_> {
    fn target_at(&self, screen_point: Point) -> Target {
        hit_test(self.store, self.camera, screen_point, self.hit)
    }

    fn screen_to_world(&self, screen_point: Point) -> Point {
        self.camera.screen_to_world(screen_point)
    }

    fn node_position(&self, id: EntityId) -> Option<Point> {
        self.store.node(id).map(|entry| entry.position)
    }

    fn label_pinned(&self, edge: EntityId) -> bool {
        self.store
            .edge(edge)
            .is_some_and(|entry| entry.edge.show_description && !entry.edge.description.is_empty())
    }
}

pub struct Session {
    actor: Actor,
    space: SpaceId,
    remote: Arc<dyn Remote>,
    source: Box<dyn DeltaSource + Send>,
    store: GraphStore,
    reconciler: SyncReconciler,
    gesture: GestureStateMachine,
    camera: Camera,
    hit: HitConfig,
    selection: Selection,
    /// Edge drawn with hover emphasis.
    emphasized: Option<EntityId>,
    /// Node being shift-dragged and where it started.
    drag_origin: Option<(EntityId, Point)>,
    notices: Vec<MutationError>,
    needs_repaint: bool,
}

impl Session {
    /// Open `space`: subscribe first, then load its contents.
    pub async fn open(
        actor: Actor,
        space: SpaceId,
        remote: Arc<dyn Remote>,
        source: Box<dyn DeltaSource + Send>,
        config: SessionConfig,
    ) -> MutationResult<Self> {
        let mut session = Self {
            actor,
            space,
            remote,
            source,
            store: GraphStore::new(),
            reconciler: SyncReconciler::new(actor.session),
            gesture: GestureStateMachine::new(config.gesture),
            camera: Camera::new(),
            hit: config.hit,
            selection: Selection::default(),
            emphasized: None,
            drag_origin: None,
            notices: Vec::new(),
            needs_repaint: true,
        };
        session.reload().await?;
        Ok(session)
    }

    pub fn actor(&self) -> Actor {
        self.actor
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn gesture(&self) -> &GestureStateMachine {
        &self.gesture
    }

    pub fn emphasized_edge(&self) -> Option<EntityId> {
        self.emphasized
    }

    pub fn hit_config(&self) -> &HitConfig {
        &self.hit
    }

    /// User-facing errors since the last call.
    pub fn take_notices(&mut self) -> Vec<MutationError> {
        std::mem::take(&mut self.notices)
    }

    /// Whether anything visible changed since the last call.
    pub fn take_repaint(&mut self) -> bool {
        std::mem::replace(&mut self.needs_repaint, false)
    }

    /// Discard the local graph and load the space again.
    pub async fn reload(&mut self) -> MutationResult<()> {
        let SpaceContents { nodes, edges, .. } = self.remote.fetch_space(self.space).await?;
        self.store.clear();
        for placed in nodes {
            self.store
                .upsert_node(placed.node, Some(placed.placement.id), placed.placement.position);
        }
        for placed in edges {
            let id = placed.edge.id;
            if let Err(err) = self.store.upsert_edge(placed.edge, Some(placed.placement.id)) {
                log::warn!("space {} lists edge {} without its endpoints: {}", self.space, id, err);
            }
        }
        self.needs_repaint = true;
        log::info!(
            "loaded space {}: {} nodes, {} edges",
            self.space,
            self.store.node_count(),
            self.store.edge_count()
        );
        Ok(())
    }

    /// Apply every delta received so far. Returns how many were applied.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        for delta in self.source.drain() {
            let kind = delta.kind_name();
            match self.reconciler.apply(&mut self.store, delta) {
                Ok(Applied::Confirmed { local, durable }) => {
                    self.selection.retarget(local, Some(durable));
                    applied += 1;
                }
                Ok(Applied::Changed) => applied += 1,
                Ok(Applied::Ignored) => {}
                Err(err) => log::warn!("dropped {} delta: {}", kind, err),
            }
        }
        if applied > 0 {
            self.forget_missing();
            self.needs_repaint = true;
        }
        applied
    }

    /// Drop selection and emphasis of entities no longer in the store.
    fn forget_missing(&mut self) {
        let store = &self.store;
        self.selection.retain(|id| store.contains(id));
        if self.emphasized.is_some_and(|edge| !store.contains(edge)) {
            self.emphasized = None;
        }
    }

    /// Feed one input event through the gesture machine and act on it.
    ///
    /// Returns the intents the UI has to react to itself (prompts and
    /// selection changes).
    pub async fn handle(&mut self, event: InputEvent) -> Vec<Intent> {
        let view = View {
            store: &self.store,
            camera: &self.camera,
            hit: &self.hit,
        };
        let intents = self.gesture.handle(event, &view);
        let mut surfaced = Vec::new();
        for intent in intents {
            match intent {
                Intent::SelectNode(id) => {
                    self.drag_origin = None;
                    self.selection.select_node(id);
                    surfaced.push(intent);
                }
                Intent::ToggleNode(id) => {
                    self.drag_origin = None;
                    self.selection.toggle_node(id);
                    surfaced.push(intent);
                }
                Intent::SelectEdge(id) => {
                    self.selection.select_edge(id);
                    surfaced.push(intent);
                }
                Intent::CanvasClick { .. } => {
                    self.selection.clear();
                    surfaced.push(intent);
                }
                Intent::DragNode { id, to } => {
                    if let Ok(previous) = self.store.move_node(id, to) {
                        self.drag_origin.get_or_insert((id, previous));
                        self.needs_repaint = true;
                    }
                }
                Intent::MoveNode { id, to } => {
                    let origin = self.drag_origin.take();
                    if self.move_node(id, to).await.is_err() {
                        if let Some((dragged, start)) = origin.filter(|(dragged, _)| *dragged == id) {
                            let _ = self.store.move_node(dragged, start);
                        }
                    }
                }
                Intent::Pan(delta) => {
                    self.camera.pan(delta);
                    self.needs_repaint = true;
                }
                Intent::Zoom { at, factor } => {
                    self.camera.zoom_at(at, factor);
                    self.needs_repaint = true;
                }
                Intent::EdgeEmphasis { edge, emphasized } => {
                    self.emphasized = if emphasized { Some(edge) } else { None };
                    self.needs_repaint = true;
                }
                Intent::Cancelled => {
                    self.drag_origin = None;
                    surfaced.push(intent);
                }
                Intent::PromptNodeName { .. }
                | Intent::PromptEdgeDescription { .. }
                | Intent::CreateNode { .. }
                | Intent::CreateEdge { .. } => surfaced.push(intent),
            }
        }
        surfaced
    }

    /// Submit the name or description for the pending creation gesture.
    ///
    /// Returns the durable id of the created entity, or `None` when no
    /// creation gesture was waiting. When several edges are created the
    /// last one is returned.
    pub async fn submit(&mut self, text: &str) -> MutationResult<Option<EntityId>> {
        match self.gesture.submit(text) {
            Some(Intent::CreateNode { name, at }) => self.create_node(&name, at).await.map(Some),
            Some(Intent::CreateEdge { from, to, description }) => self.link(from, to, &description).await.map(Some),
            _ => Ok(None),
        }
    }

    /// Create edges for a finished node-to-node drag.
    ///
    /// With nodes selected, every selected node other than `to` is linked to
    /// `to` and `from` is ignored. Created edges join the selection.
    async fn link(&mut self, from: EntityId, to: EntityId, description: &str) -> MutationResult<EntityId> {
        let sources: Vec<EntityId> = if self.selection.nodes.is_empty() {
            vec![from]
        } else {
            self.selection.nodes.iter().copied().filter(|id| *id != to).collect()
        };
        let mut created = None;
        for source in sources {
            let id = self.create_edge(source, to, description).await?;
            self.selection.add_edge(id);
            created = Some(id);
        }
        match created {
            Some(id) => Ok(id),
            None => Err(self.notice(ValidationError::SelfLoop(to).into())),
        }
    }

    pub fn cancel(&mut self) {
        self.drag_origin = None;
        for intent in self.gesture.cancel() {
            if let Intent::DragNode { id, to } = intent {
                let _ = self.store.move_node(id, to);
                self.needs_repaint = true;
            }
        }
    }

    pub async fn create_node(&mut self, name: &str, at: Point) -> MutationResult<EntityId> {
        let node = Node::new(EntityId::local(), name, self.actor.user);
        if let Err(err) = node.validate() {
            return Err(self.notice(err.into()));
        }
        let local = node.id;
        self.store.upsert_node(node.clone(), None, Some(at));
        self.reconciler.track(local);
        self.needs_repaint = true;

        let mutation = Mutation::CreateNode { space: self.space, node, x: at.x, y: at.y };
        let result = self.remote.submit(self.actor, mutation).await;
        match result {
            Ok(Ack::NodeCreated { node, placement, .. }) => {
                let id = node.id;
                self.confirm(local, id)?;
                self.store.upsert_node(node, Some(placement.id), None);
                Ok(id)
            }
            Ok(other) => Err(self.unexpected(local, other)),
            Err(err) => {
                self.reconciler.rollback(&mut self.store, local);
                Err(self.notice(err))
            }
        }
    }

    /// Create an edge between two confirmed nodes.
    pub async fn create_edge(&mut self, from: EntityId, to: EntityId, description: &str) -> MutationResult<EntityId> {
        for endpoint in [from, to] {
            let confirmed = self.store.node(endpoint).is_some_and(|entry| entry.confirmed);
            if !endpoint.is_durable() || !confirmed {
                return Err(self.notice(ValidationError::UnconfirmedEndpoint(endpoint).into()));
            }
        }
        let edge = Edge::new(EntityId::local(), from, to, self.actor.user).with_description(description);
        if let Err(err) = edge.validate() {
            return Err(self.notice(err.into()));
        }
        let local = edge.id;
        if let Err(err) = self.store.upsert_edge(edge.clone(), None) {
            log::warn!("optimistic edge rejected by store: {}", err);
            return Err(self.notice(MutationError::NotFound(err.to_string())));
        }
        self.reconciler.track(local);
        self.needs_repaint = true;

        let mutation = Mutation::CreateEdge { space: self.space, edge };
        let result = self.remote.submit(self.actor, mutation).await;
        match result {
            Ok(Ack::EdgeCreated { edge, placement, .. }) => {
                let id = edge.id;
                self.confirm(local, id)?;
                self.store.upsert_edge(edge, Some(placement.id)).map_err(|err| {
                    MutationError::Other(err.to_string())
                })?;
                Ok(id)
            }
            Ok(other) => Err(self.unexpected(local, other)),
            Err(err) => {
                self.reconciler.rollback(&mut self.store, local);
                Err(self.notice(err))
            }
        }
    }

    /// Move a placed node; reverted if the server refuses.
    pub async fn move_node(&mut self, id: EntityId, to: Point) -> MutationResult<()> {
        let Some(placement_id) = self.store.node(id).and_then(|entry| entry.placement_id) else {
            return Err(self.notice(ValidationError::UnconfirmedEndpoint(id).into()));
        };
        let Ok(previous) = self.store.move_node(id, to) else {
            return Err(self.notice(MutationError::NotFound(format!("node {}", id))));
        };
        self.needs_repaint = true;

        let mutation = Mutation::MoveNode { placement_id, x: to.x, y: to.y };
        let result = self.remote.submit(self.actor, mutation).await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let _ = self.store.move_node(id, previous);
                Err(self.notice(err))
            }
        }
    }

    /// Send an edited edge; the local copy is restored on failure.
    pub async fn update_edge(&mut self, edge: Edge) -> MutationResult<()> {
        let Some(previous) = self.store.edge(edge.id).map(|entry| entry.edge.clone()) else {
            return Err(self.notice(MutationError::NotFound(format!("edge {}", edge.id))));
        };
        if let Err(err) = edge.validate() {
            return Err(self.notice(err.into()));
        }
        if let Some(entry) = self.store.edge_mut(edge.id) {
            entry.edge = edge.clone();
        }
        self.needs_repaint = true;

        let mutation = Mutation::UpdateEdge { space: self.space, edge };
        let result = self.remote.submit(self.actor, mutation).await;
        match result {
            Ok(Ack::EdgeUpdated { edge }) => {
                if let Some(entry) = self.store.edge_mut(edge.id) {
                    entry.edge = edge;
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) => {
                if let Some(entry) = self.store.edge_mut(previous.id) {
                    entry.edge = previous;
                }
                Err(self.notice(err))
            }
        }
    }

    /// Remove a node or edge from this space. A node takes its incident
    /// edges with it in the same batch.
    pub async fn remove(&mut self, id: EntityId) -> MutationResult<()> {
        let placement_id = if let Some(entry) = self.store.node(id) {
            entry.placement_id
        } else if let Some(entry) = self.store.edge(id) {
            entry.placement_id
        } else {
            return Err(self.notice(MutationError::NotFound(format!("entity {}", id))));
        };
        let Some(placement_id) = placement_id else {
            return Err(self.notice(ValidationError::UnconfirmedEndpoint(id).into()));
        };

        let removed = match self.store.remove_node(id) {
            Ok(removed) => Removed::Node(removed),
            Err(_) => match self.store.remove_edge(id) {
                Ok(removed) => Removed::Edge(removed),
                Err(err) => return Err(self.notice(MutationError::NotFound(err.to_string()))),
            },
        };
        let selection = self.selection.clone();
        let emphasized = self.emphasized;
        self.forget_missing();
        self.needs_repaint = true;

        let result = self
            .remote
            .submit(self.actor, Mutation::RemovePlacement { placement_id })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let restored = match removed {
                    Removed::Node(removed) => self.store.restore_node(removed),
                    Removed::Edge(removed) => self.store.restore_edge(removed),
                };
                match restored {
                    Ok(()) => {
                        self.selection = selection;
                        self.emphasized = emphasized;
                    }
                    Err(restore_err) => log::warn!("could not restore {} after failed removal: {}", id, restore_err),
                }
                Err(self.notice(err))
            }
        }
    }

    fn confirm(&mut self, local: EntityId, durable: EntityId) -> MutationResult<()> {
        match self.reconciler.confirm(&mut self.store, local, durable) {
            Ok(_) => {
                self.selection.retarget(local, Some(durable));
                Ok(())
            }
            Err(err) => Err(self.notice(MutationError::Other(err.to_string()))),
        }
    }

    fn unexpected(&mut self, local: EntityId, ack: Ack) -> MutationError {
        log::warn!("unexpected acknowledgement {:?}", ack);
        self.reconciler.rollback(&mut self.store, local);
        self.notice(MutationError::Other("unexpected acknowledgement".to_string()))
    }

    fn notice(&mut self, err: MutationError) -> MutationError {
        log::debug!("session {} notice: {}", self.actor.session, err);
        self.notices.push(err.clone());
        err
    }
}

enum Removed {
    Node(RemovedNode),
    Edge(RemovedEdge),
}
