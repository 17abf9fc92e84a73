//! MapWeave Render Library
//!
//! Edge drawing on top of a backend-neutral [`Painter`]. The
//! [`RecordingPainter`] keeps draw calls in memory for headless use.

mod edge;
mod recording;
mod renderer;

pub use edge::EdgeRenderer;
pub use recording::{DrawCommand, RecordingPainter};
pub use renderer::{Painter, RenderContext, RenderResult, RenderStyle, Renderer, RendererError};
