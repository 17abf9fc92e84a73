//! Renderer trait abstraction.

use kurbo::{Affine, Point, RoundedRect, Size};
use mapweave_core::camera::Camera;
use mapweave_core::id::EntityId;
use mapweave_core::store::GraphStore;
use peniko::Color;
use thiserror::Error;

/// Renderer errors.
#[derive(Debug, Error)]
pub enum RendererError {
    #[error("Unknown edge: {0}")]
    UnknownEdge(EntityId),
    #[error("Edge {edge} is missing endpoint {endpoint}")]
    MissingEndpoint { edge: EntityId, endpoint: EntityId },
}

/// Result type for renderer operations.
pub type RenderResult<T> = Result<T, RendererError>;

/// Stroke, label and arrow styling shared by every edge.
#[derive(Debug, Clone, Copy)]
pub struct RenderStyle {
    pub stroke_width: f64,
    /// Stroke width while the edge is hovered.
    pub emphasized_stroke_width: f64,
    pub stroke_color: Color,
    pub selection_color: Color,
    pub arrow_size: f64,
    pub font_size: f64,
    pub label_bold: bool,
    pub label_margin: f64,
    pub label_background: Color,
    pub label_color: Color,
    pub background_color: Color,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            stroke_width: 2.0,
            emphasized_stroke_width: 4.0,
            stroke_color: Color::from_rgba8(0x22, 0x22, 0x22, 255),
            selection_color: Color::from_rgba8(59, 130, 246, 255), // Blue
            arrow_size: mapweave_core::geometry::DEFAULT_ARROW_SIZE,
            font_size: 14.0,
            label_bold: true,
            label_margin: 5.0,
            label_background: Color::WHITE,
            label_color: Color::BLACK,
            background_color: Color::WHITE,
        }
    }
}

/// Context for a single render frame.
pub struct RenderContext<'a> {
    /// The graph to render.
    pub store: &'a GraphStore,
    pub camera: &'a Camera,
    /// Viewport size in physical pixels.
    pub viewport_size: Size,
    pub style: RenderStyle,
    /// Edge currently drawn with hover emphasis.
    pub emphasized_edge: Option<EntityId>,
    pub selected: Vec<EntityId>,
}

impl<'a> RenderContext<'a> {
    pub fn new(store: &'a GraphStore, camera: &'a Camera, viewport_size: Size) -> Self {
        Self {
            store,
            camera,
            viewport_size,
            style: RenderStyle::default(),
            emphasized_edge: None,
            selected: Vec::new(),
        }
    }

    pub fn with_style(mut self, style: RenderStyle) -> Self {
        self.style = style;
        self
    }

    /// Set the hovered edge.
    pub fn with_emphasis(mut self, edge: Option<EntityId>) -> Self {
        self.emphasized_edge = edge;
        self
    }

    pub fn with_selection(mut self, selected: Vec<EntityId>) -> Self {
        self.selected = selected;
        self
    }

    /// World-to-screen transform for this frame.
    pub fn transform(&self) -> Affine {
        self.camera.transform()
    }

    pub fn is_selected(&self, id: EntityId) -> bool {
        self.selected.contains(&id)
    }
}

/// Drawing backend. Coordinates are in world space and mapped through
/// `transform`.
pub trait Painter {
    fn stroke_line(&mut self, from: Point, to: Point, width: f64, color: Color, transform: Affine);

    fn stroke_polyline(&mut self, points: &[Point], width: f64, color: Color, transform: Affine);

    fn fill_rounded_rect(&mut self, rect: RoundedRect, color: Color, transform: Affine);

    /// Draw `text` centred on `center`.
    fn fill_text(&mut self, text: &str, center: Point, font_size: f64, bold: bool, color: Color, transform: Affine);

    /// Advance width of `text` in world units.
    fn measure_text(&self, text: &str, font_size: f64, bold: bool) -> f64;
}

/// Trait for graph renderers.
pub trait Renderer {
    /// Draw one frame. Returns the number of items drawn.
    fn render(&self, ctx: &RenderContext, painter: &mut dyn Painter) -> RenderResult<usize>;

    /// Get the background color (for clearing).
    fn background_color(&self, ctx: &RenderContext) -> Color {
        ctx.style.background_color
    }
}
