//! In-memory painter for headless rendering and tests.

use crate::renderer::Painter;
use kurbo::{Affine, Point, RoundedRect};
use peniko::Color;

/// Average glyph advance as a fraction of the font size.
const REGULAR_ADVANCE: f64 = 0.55;
const BOLD_ADVANCE: f64 = 0.6;

/// One recorded draw call, already mapped to screen space.
#[derive(Debug, Clone)]
pub enum DrawCommand {
    Line {
        from: Point,
        to: Point,
        width: f64,
        color: Color,
    },
    Polyline {
        points: Vec<Point>,
        width: f64,
        color: Color,
    },
    RoundedRect {
        rect: RoundedRect,
        color: Color,
    },
    Text {
        text: String,
        center: Point,
        font_size: f64,
        bold: bool,
        color: Color,
    },
}

/// Painter that keeps every draw call instead of rasterising it.
#[derive(Debug, Default)]
pub struct RecordingPainter {
    commands: Vec<DrawCommand>,
}

impl RecordingPainter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[DrawCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<DrawCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn lines(&self) -> impl Iterator<Item = &DrawCommand> {
        self.commands.iter().filter(|c| matches!(c, DrawCommand::Line { .. }))
    }

    /// Arrowheads are drawn as polylines.
    pub fn polylines(&self) -> impl Iterator<Item = &[Point]> {
        self.commands.iter().filter_map(|c| match c {
            DrawCommand::Polyline { points, .. } => Some(points.as_slice()),
            _ => None,
        })
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().filter_map(|c| match c {
            DrawCommand::Text { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

impl Painter for RecordingPainter {
    fn stroke_line(&mut self, from: Point, to: Point, width: f64, color: Color, transform: Affine) {
        self.commands.push(DrawCommand::Line {
            from: transform * from,
            to: transform * to,
            width,
            color,
        });
    }

    fn stroke_polyline(&mut self, points: &[Point], width: f64, color: Color, transform: Affine) {
        self.commands.push(DrawCommand::Polyline {
            points: points.iter().map(|p| transform * *p).collect(),
            width,
            color,
        });
    }

    fn fill_rounded_rect(&mut self, rect: RoundedRect, color: Color, transform: Affine) {
        // Pan and uniform zoom only, so the bounding box maps exactly.
        let bounds = transform.transform_rect_bbox(rect.rect());
        let scale = transform.as_coeffs()[0].abs();
        let radius = rect.radii().top_left * scale;
        self.commands.push(DrawCommand::RoundedRect {
            rect: RoundedRect::from_rect(bounds, radius),
            color,
        });
    }

    fn fill_text(&mut self, text: &str, center: Point, font_size: f64, bold: bool, color: Color, transform: Affine) {
        self.commands.push(DrawCommand::Text {
            text: text.to_string(),
            center: transform * center,
            font_size,
            bold,
            color,
        });
    }

    fn measure_text(&self, text: &str, font_size: f64, bold: bool) -> f64 {
        let advance = if bold { BOLD_ADVANCE } else { REGULAR_ADVANCE };
        text.chars().count() as f64 * font_size * advance
    }
}
