//! Turns pointer and keyboard sequences into domain intents.
//!
//! One machine exists per session. It owns the drag in progress, the edge
//! currently hovered and the half-finished creation gesture, so none of that
//! lives in shared state.

use crate::hit::Target;
use crate::id::EntityId;
use crate::input::{InputEvent, InputState, MouseButton, PointerEvent};
use kurbo::{Point, Vec2};
use serde::{Deserialize, Serialize};

/// Gesture tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GestureConfig {
    /// A drag shorter than this (screen pixels) is a click.
    pub click_tolerance: f64,
    /// When set, a drag from a node onto empty canvas links the node to
    /// this one instead of panning.
    pub fixed_center: Option<EntityId>,
    /// Zoom factor applied per scroll step.
    pub zoom_step: f64,
}

impl Default for GestureConfig {
    fn default() -> Self {
        Self {
            click_tolerance: 0.0,
            fixed_center: None,
            zoom_step: 1.1,
        }
    }
}

/// What the machine needs to know about the canvas under the pointer.
pub trait Scene {
    fn target_at(&self, screen_point: Point) -> Target;
    fn screen_to_world(&self, screen_point: Point) -> Point;
    fn node_position(&self, id: EntityId) -> Option<Point>;
    /// Whether the edge's label is shown permanently.
    fn label_pinned(&self, edge: EntityId) -> bool;
}

/// Machine state.
#[derive(Debug, Clone, PartialEq)]
pub enum GestureState {
    Idle,
    /// Primary button held since `start` (screen coordinates).
    Dragging {
        origin: Target,
        start: Point,
        /// Set for a shift-drag on a node: the node's position at press.
        moving_from: Option<Point>,
    },
    /// Canvas drag finished; waiting for the new node's name.
    AwaitingNodeName { at: Point },
    /// Node-to-node drag finished; waiting for the edge description.
    AwaitingEdgeTarget { from: EntityId, to: EntityId },
}

/// Domain intents produced by the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    SelectNode(EntityId),
    /// Shift-click on a node: add it to the selection or take it out.
    ToggleNode(EntityId),
    SelectEdge(EntityId),
    /// Click on empty canvas: deselect everything.
    CanvasClick { at: Point },
    PromptNodeName { at: Point },
    PromptEdgeDescription { from: EntityId, to: EntityId },
    CreateNode { name: String, at: Point },
    CreateEdge { from: EntityId, to: EntityId, description: String },
    /// Live position while a node is shift-dragged.
    DragNode { id: EntityId, to: Point },
    /// Shift-drag released.
    MoveNode { id: EntityId, to: Point },
    /// Screen-space pan.
    Pan(Vec2),
    Zoom { at: Point, factor: f64 },
    /// Temporary hover emphasis of an edge changed; repaint needed.
    EdgeEmphasis { edge: EntityId, emphasized: bool },
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct GestureStateMachine {
    config: GestureConfig,
    state: GestureState,
    input: InputState,
    hovered_edge: Option<EntityId>,
}

impl GestureStateMachine {
    pub fn new(config: GestureConfig) -> Self {
        Self {
            config,
            state: GestureState::Idle,
            input: InputState::new(),
            hovered_edge: None,
        }
    }

    pub fn state(&self) -> &GestureState {
        &self.state
    }

    pub fn hovered_edge(&self) -> Option<EntityId> {
        self.hovered_edge
    }

    pub fn is_idle(&self) -> bool {
        self.state == GestureState::Idle
    }

    pub fn handle(&mut self, event: InputEvent, scene: &dyn Scene) -> Vec<Intent> {
        match event {
            InputEvent::Pointer(event) => {
                self.input.handle_pointer_event(&event);
                self.handle_pointer(event, scene)
            }
            InputEvent::Key(key) => {
                self.input.handle_key_event(&key);
                if key.is_escape() { self.cancel() } else { Vec::new() }
            }
            InputEvent::Blur => {
                self.input.release_all();
                self.cancel()
            }
        }
    }

    /// Complete an `Awaiting*` state with the submitted name or description.
    pub fn submit(&mut self, text: impl Into<String>) -> Option<Intent> {
        let text = text.into();
        let intent = match self.state {
            GestureState::AwaitingNodeName { at } => Intent::CreateNode { name: text, at },
            GestureState::AwaitingEdgeTarget { from, to } => Intent::CreateEdge { from, to, description: text },
            _ => return None,
        };
        self.state = GestureState::Idle;
        Some(intent)
    }

    /// Abandon whatever is in progress. No-op when idle.
    pub fn cancel(&mut self) -> Vec<Intent> {
        let previous = std::mem::replace(&mut self.state, GestureState::Idle);
        match previous {
            GestureState::Idle => Vec::new(),
            GestureState::Dragging { origin: Target::Node(id), moving_from: Some(from), .. } => {
                vec![Intent::DragNode { id, to: from }, Intent::Cancelled]
            }
            _ => vec![Intent::Cancelled],
        }
    }

    fn handle_pointer(&mut self, event: PointerEvent, scene: &dyn Scene) -> Vec<Intent> {
        match event {
            PointerEvent::Down { position, button: MouseButton::Left } => {
                let mut intents = Vec::new();
                if !matches!(self.state, GestureState::Idle) {
                    intents.extend(self.cancel());
                }
                let origin = scene.target_at(position);
                let moving_from = match origin {
                    Target::Node(id) if self.input.shift() => scene.node_position(id),
                    _ => None,
                };
                self.state = GestureState::Dragging { origin, start: position, moving_from };
                intents
            }
            PointerEvent::Down { .. } => Vec::new(),
            PointerEvent::Move { position } => match self.state {
                GestureState::Dragging { origin: Target::Node(id), start, moving_from: Some(from) } => {
                    let offset = scene.screen_to_world(position) - scene.screen_to_world(start);
                    vec![Intent::DragNode { id, to: from + offset }]
                }
                GestureState::Dragging { .. } => Vec::new(),
                _ => self.update_hover(scene.target_at(position), scene),
            },
            PointerEvent::Up { position, button: MouseButton::Left } => self.release(position, scene),
            PointerEvent::Up { .. } => Vec::new(),
            PointerEvent::Scroll { position, delta } => {
                let factor = if delta.y < 0.0 { self.config.zoom_step } else { 1.0 / self.config.zoom_step };
                vec![Intent::Zoom { at: position, factor }]
            }
        }
    }

    fn release(&mut self, position: Point, scene: &dyn Scene) -> Vec<Intent> {
        let GestureState::Dragging { origin, start, moving_from } = self.state else {
            return Vec::new();
        };
        self.state = GestureState::Idle;

        if (position - start).hypot() <= self.config.click_tolerance {
            return vec![match origin {
                Target::Node(id) if self.input.shift() => Intent::ToggleNode(id),
                Target::Node(id) => Intent::SelectNode(id),
                Target::Edge(id) => Intent::SelectEdge(id),
                Target::Canvas => Intent::CanvasClick { at: scene.screen_to_world(position) },
            }];
        }

        if let (Target::Node(id), Some(from)) = (origin, moving_from) {
            let offset = scene.screen_to_world(position) - scene.screen_to_world(start);
            return vec![Intent::MoveNode { id, to: from + offset }];
        }

        let end = scene.target_at(position);
        match (origin, end) {
            (Target::Canvas, Target::Canvas) => {
                let at = scene.screen_to_world(position);
                self.state = GestureState::AwaitingNodeName { at };
                vec![Intent::PromptNodeName { at }]
            }
            (Target::Node(from), Target::Node(to)) if from != to => self.await_edge(from, to),
            (Target::Node(id), Target::Node(_)) => vec![Intent::SelectNode(id)],
            (Target::Node(from), _) => match self.config.fixed_center {
                Some(center) if center != from => self.await_edge(from, center),
                _ => vec![Intent::Pan(position - start)],
            },
            (Target::Edge(_), _) => vec![Intent::Pan(position - start)],
            (Target::Canvas, _) => Vec::new(),
        }
    }

    fn await_edge(&mut self, from: EntityId, to: EntityId) -> Vec<Intent> {
        self.state = GestureState::AwaitingEdgeTarget { from, to };
        vec![Intent::PromptEdgeDescription { from, to }]
    }

    /// Track the hovered edge. Hovering a node counts as leaving the edge.
    fn update_hover(&mut self, target: Target, scene: &dyn Scene) -> Vec<Intent> {
        let hovered = match target {
            Target::Edge(id) => Some(id),
            Target::Node(_) | Target::Canvas => None,
        };
        if hovered == self.hovered_edge {
            return Vec::new();
        }

        let mut intents = Vec::new();
        if let Some(previous) = self.hovered_edge.take() {
            if !scene.label_pinned(previous) {
                intents.push(Intent::EdgeEmphasis { edge: previous, emphasized: false });
            }
        }
        if let Some(edge) = hovered {
            if !scene.label_pinned(edge) {
                intents.push(Intent::EdgeEmphasis { edge, emphasized: true });
            }
        }
        self.hovered_edge = hovered;
        intents
    }
}

impl Default for GestureStateMachine {
    fn default() -> Self {
        Self::new(GestureConfig::default())
    }
}
