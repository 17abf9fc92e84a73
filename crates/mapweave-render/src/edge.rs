//! Edge drawing: plain, bidirectional and directed lines with optional
//! labels, plus point containment.

use crate::renderer::{Painter, RenderContext, RenderResult, Renderer, RendererError};
use kurbo::{Affine, Point};
use mapweave_core::camera::Camera;
use mapweave_core::geometry::{MidArrow, label_box, mid_arrow, midpoint, on_segment};
use mapweave_core::hit::HitConfig;
use mapweave_core::id::EntityId;
use mapweave_core::model::{Edge, EdgeCategory};
use mapweave_core::store::GraphStore;

#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeRenderer {
    pub hit: HitConfig,
}

impl EdgeRenderer {
    pub fn new(hit: HitConfig) -> Self {
        Self { hit }
    }

    /// Arrowheads for `edge` drawn between its endpoint positions `p1`
    /// (endpoint1) and `p2` (endpoint2).
    ///
    /// `None` draws no arrow. `Both` draws one arrow each way, whatever the
    /// storage order. `FromTo` points at the declared target, which means
    /// inverting the line when the declared source is endpoint2.
    pub fn arrows(&self, edge: &Edge, p1: Point, p2: Point, size: f64) -> Vec<MidArrow> {
        match edge.category {
            EdgeCategory::None => Vec::new(),
            EdgeCategory::Both => [mid_arrow(p1, p2, size), mid_arrow(p2, p1, size)]
                .into_iter()
                .flatten()
                .collect(),
            EdgeCategory::FromTo => {
                let forward = edge.direction.is_none_or(|(from, _)| from == edge.endpoint1_id);
                let arrow = if forward {
                    mid_arrow(p1, p2, size)
                } else {
                    mid_arrow(p2, p1, size)
                };
                arrow.into_iter().collect()
            }
        }
    }

    /// Draw one edge. Endpoints must already be in the store.
    pub fn render_edge(&self, ctx: &RenderContext, painter: &mut dyn Painter, id: EntityId) -> RenderResult<()> {
        let entry = ctx.store.edge(id).ok_or(RendererError::UnknownEdge(id))?;
        let edge = &entry.edge;
        let (p1, p2) = endpoints(ctx.store, edge)?;
        let style = &ctx.style;
        let transform = ctx.transform();

        let width = if ctx.emphasized_edge == Some(id) {
            style.emphasized_stroke_width
        } else {
            style.stroke_width
        };
        let color = if ctx.is_selected(id) {
            style.selection_color
        } else {
            style.stroke_color
        };

        painter.stroke_line(p1, p2, width, color, transform);
        for arrow in self.arrows(edge, p1, p2, style.arrow_size) {
            painter.stroke_polyline(&[arrow.wings[0], arrow.tip, arrow.wings[1]], width, color, transform);
        }

        if edge.show_description && !edge.description.is_empty() {
            draw_label(painter, &edge.description, midpoint(p1, p2), ctx, transform);
        }
        Ok(())
    }

    /// Whether `screen_point` lies on edge `id` under the given camera.
    pub fn contains(&self, store: &GraphStore, camera: &Camera, id: EntityId, screen_point: Point) -> bool {
        let Some(entry) = store.edge(id) else {
            return false;
        };
        let Some((p1, p2)) = store.edge_endpoints(&entry.edge) else {
            return false;
        };
        let world = camera.screen_to_world(screen_point);
        on_segment(world, p1, p2, camera.screen_len_to_world(self.hit.edge_epsilon))
    }
}

impl Renderer for EdgeRenderer {
    fn render(&self, ctx: &RenderContext, painter: &mut dyn Painter) -> RenderResult<usize> {
        let ids: Vec<EntityId> = ctx.store.edges().map(|entry| entry.edge.id).collect();
        let mut drawn = 0;
        for id in ids {
            match self.render_edge(ctx, painter, id) {
                Ok(()) => drawn += 1,
                Err(err @ RendererError::MissingEndpoint { .. }) => log::warn!("skipping edge: {}", err),
                Err(err) => return Err(err),
            }
        }
        Ok(drawn)
    }
}

fn endpoints(store: &GraphStore, edge: &Edge) -> RenderResult<(Point, Point)> {
    let position = |endpoint: EntityId| {
        store
            .node(endpoint)
            .map(|entry| entry.position)
            .ok_or(RendererError::MissingEndpoint { edge: edge.id, endpoint })
    };
    Ok((position(edge.endpoint1_id)?, position(edge.endpoint2_id)?))
}

fn draw_label(painter: &mut dyn Painter, text: &str, center: Point, ctx: &RenderContext, transform: Affine) {
    let style = &ctx.style;
    let width = painter.measure_text(text, style.font_size, style.label_bold);
    let background = label_box(center, width, style.font_size, style.label_margin);
    painter.fill_rounded_rect(background, style.label_background, transform);
    painter.fill_text(text, center, style.font_size, style.label_bold, style.label_color, transform);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::{DrawCommand, RecordingPainter};
    use kurbo::{Size, Vec2};
    use mapweave_core::id::UserId;
    use mapweave_core::model::Node;

    const A: EntityId = EntityId::Durable(1);
    const B: EntityId = EntityId::Durable(2);
    const E: EntityId = EntityId::Durable(3);

    fn store_with(edge: Edge) -> GraphStore {
        let mut store = GraphStore::new();
        store.upsert_node(Node::new(A, "A", UserId(1)), None, Some(Point::new(0.0, 0.0)));
        store.upsert_node(Node::new(B, "B", UserId(1)), None, Some(Point::new(100.0, 0.0)));
        store.upsert_edge(edge, None).unwrap();
        store
    }

    fn draw(store: &GraphStore, camera: &Camera) -> RecordingPainter {
        let ctx = RenderContext::new(store, camera, Size::new(800.0, 600.0));
        let mut painter = RecordingPainter::new();
        let drawn = EdgeRenderer::default().render(&ctx, &mut painter).unwrap();
        assert_eq!(drawn, 1);
        painter
    }

    #[test]
    fn test_plain_edge_has_no_arrow() {
        let store = store_with(Edge::new(E, A, B, UserId(1)));
        let painter = draw(&store, &Camera::new());
        assert_eq!(painter.lines().count(), 1);
        assert_eq!(painter.polylines().count(), 0);
    }

    #[test]
    fn test_both_draws_two_opposite_arrows() {
        for (first, second) in [(A, B), (B, A)] {
            let mut edge = Edge::new(E, first, second, UserId(1));
            edge.category = EdgeCategory::Both;
            let store = store_with(edge);
            let painter = draw(&store, &Camera::new());
            let tips: Vec<f64> = painter.polylines().map(|points| points[1].x - points[0].x).collect();
            assert_eq!(tips.len(), 2);
            // One arrow opens to the left, the other to the right.
            assert!(tips[0] * tips[1] < 0.0);
        }
    }

    #[test]
    fn test_from_to_inverted_when_declared_from_is_endpoint2() {
        let edge = Edge::new(E, A, B, UserId(1)).directed(B, A);
        let p1 = Point::new(0.0, 0.0);
        let p2 = Point::new(100.0, 0.0);
        let arrows = EdgeRenderer::default().arrows(&edge, p1, p2, 13.0);
        assert_eq!(arrows.len(), 1);
        // Points toward A, which sits at the origin.
        assert!(arrows[0].heading().x < 0.0);

        let forward = Edge::new(E, A, B, UserId(1)).directed(A, B);
        let arrows = EdgeRenderer::default().arrows(&forward, p1, p2, 13.0);
        assert!(arrows[0].heading().x > 0.0);
    }

    #[test]
    fn test_label_only_when_shown_and_non_empty() {
        let mut edge = Edge::new(E, A, B, UserId(1)).with_description("causes");
        let store = store_with(edge.clone());
        assert_eq!(draw(&store, &Camera::new()).texts().count(), 0);

        edge.show_description = true;
        let store = store_with(edge.clone());
        let painter = draw(&store, &Camera::new());
        assert_eq!(painter.texts().collect::<Vec<_>>(), vec!["causes"]);
        let background = painter
            .commands()
            .iter()
            .find_map(|c| match c {
                DrawCommand::RoundedRect { rect, .. } => Some(rect.rect()),
                _ => None,
            })
            .unwrap();
        assert_eq!(background.center(), Point::new(50.0, 0.0));

        edge.description.clear();
        let store = store_with(edge);
        let painter = draw(&store, &Camera::new());
        assert_eq!(painter.texts().count(), 0);
        assert!(!painter.commands().iter().any(|c| matches!(c, DrawCommand::RoundedRect { .. })));
    }

    #[test]
    fn test_emphasis_widens_stroke() {
        let store = store_with(Edge::new(E, A, B, UserId(1)));
        let camera = Camera::new();
        let ctx = RenderContext::new(&store, &camera, Size::new(800.0, 600.0)).with_emphasis(Some(E));
        let mut painter = RecordingPainter::new();
        EdgeRenderer::default().render(&ctx, &mut painter).unwrap();
        match &painter.commands()[0] {
            DrawCommand::Line { width, .. } => assert_eq!(*width, 4.0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_contains_follows_camera() {
        let store = store_with(Edge::new(E, A, B, UserId(1)));
        let mut camera = Camera::new();
        camera.zoom = 2.0;
        camera.offset = Vec2::new(50.0, 50.0);
        let renderer = EdgeRenderer::default();
        let on_line = camera.world_to_screen(Point::new(50.0, 0.0));
        assert!(renderer.contains(&store, &camera, E, on_line));
        assert!(renderer.contains(&store, &camera, E, on_line + Vec2::new(0.0, 4.0)));
        assert!(!renderer.contains(&store, &camera, E, on_line + Vec2::new(0.0, 6.0)));
        assert!(!renderer.contains(&store, &camera, EntityId::Durable(99), on_line));
    }

    #[test]
    fn test_unknown_edge_is_an_error() {
        let store = store_with(Edge::new(E, A, B, UserId(1)));
        let camera = Camera::new();
        let ctx = RenderContext::new(&store, &camera, Size::new(800.0, 600.0));
        let mut painter = RecordingPainter::new();
        let result = EdgeRenderer::default().render_edge(&ctx, &mut painter, EntityId::Durable(42));
        assert!(matches!(result, Err(RendererError::UnknownEdge(_))));
    }
}
