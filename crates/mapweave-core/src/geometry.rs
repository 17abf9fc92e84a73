//! Vector math for edges: distances, midpoint arrowheads and label boxes.

use kurbo::{Point, Rect, RoundedRect, Vec2};

/// The arrowhead sits this far past the midpoint, in units of its own length,
/// so that it reads as centred on the line.
pub const ARROW_CENTER_FACTOR: f64 = 1.0 / 0.7;

/// Default arrowhead length.
pub const DEFAULT_ARROW_SIZE: f64 = 13.0;

/// Distance from a point to a line segment.
pub fn point_to_segment_dist(point: Point, a: Point, b: Point) -> f64 {
    let seg = b - a;
    let pv = point - a;
    let len_sq = seg.hypot2();
    if len_sq < f64::EPSILON {
        return pv.hypot();
    }
    let t = (pv.dot(seg) / len_sq).clamp(0.0, 1.0);
    let proj = a + seg * t;
    (point - proj).hypot()
}

/// Whether `point` lies within `epsilon` of the segment `a`-`b`.
pub fn on_segment(point: Point, a: Point, b: Point, epsilon: f64) -> bool {
    point_to_segment_dist(point, a, b) <= epsilon
}

/// Whether `point` lies within the circle of `radius` around `center`.
pub fn in_circle(point: Point, center: Point, radius: f64) -> bool {
    (point - center).hypot2() <= radius * radius
}

pub fn midpoint(a: Point, b: Point) -> Point {
    a.midpoint(b)
}

/// An open arrowhead drawn at the middle of an edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MidArrow {
    /// Point of the arrowhead.
    pub tip: Point,
    /// Where the arrow's axis meets the line behind the tip.
    pub tail: Point,
    /// The two wing ends.
    pub wings: [Point; 2],
}

impl MidArrow {
    /// Unit vector from tail to tip.
    pub fn heading(&self) -> Vec2 {
        let v = self.tip - self.tail;
        let len = v.hypot();
        if len < f64::EPSILON { Vec2::ZERO } else { v / len }
    }
}

/// Compute an arrowhead of length `size` at the middle of `from`-`to`,
/// pointing towards `to`. Returns `None` for a degenerate segment.
pub fn mid_arrow(from: Point, to: Point, size: f64) -> Option<MidArrow> {
    let line = to - from;
    let len = line.hypot();
    if len < f64::EPSILON {
        return None;
    }
    let vect = line * (size / len);
    let mid = midpoint(from, to);
    let tip = mid + vect * ARROW_CENTER_FACTOR;
    let tail = tip - vect;
    let normal = Vec2::new(-vect.y / 2.0, vect.x / 2.0);
    Some(MidArrow {
        tip,
        tail,
        wings: [tail + normal, tail - normal],
    })
}

/// Rounded background box for an edge label of `text_width`, centred on
/// `center`. Corners are fully rounded (radius = half height).
pub fn label_box(center: Point, text_width: f64, font_size: f64, margin: f64) -> RoundedRect {
    let width = text_width + 2.0 * margin;
    let height = font_size + margin;
    let rect = Rect::from_center_size(center, (width, height));
    RoundedRect::from_rect(rect, height / 2.0)
}
