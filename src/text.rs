// Text rendering for the context menu and the help popup

use crate::cpu_renderer::Canvas;
use cosmic_text::{Attrs, Buffer, Color, FontSystem, Metrics, Shaping, SwashCache};
use log::debug;

/// Rasterises short UI strings into BGRA canvases
pub struct TextRenderer {
    font_system: FontSystem,
    cache: SwashCache,
}

impl TextRenderer {
    pub fn new() -> Self {
        let font_system = FontSystem::new();
        debug!("Loaded {} font faces", font_system.db().len());
        Self {
            font_system,
            cache: SwashCache::new(),
        }
    }

    fn layout(&mut self, text: &str, font_size: f32, max_width: Option<f32>) -> Buffer {
        let metrics = Metrics::new(font_size, (font_size * 1.3).ceil());
        let mut buffer = Buffer::new(&mut self.font_system, metrics);
        buffer.set_size(&mut self.font_system, max_width, None);
        buffer.set_text(&mut self.font_system, text, Attrs::new(), Shaping::Advanced);
        buffer.shape_until_scroll(&mut self.font_system, false);
        buffer
    }

    /// Width and height in pixels of `text` laid out without wrapping
    pub fn measure(&mut self, text: &str, font_size: f32) -> (u32, u32) {
        let buffer = self.layout(text, font_size, None);
        let line_height = buffer.metrics().line_height;
        let (width, lines) = buffer
            .layout_runs()
            .fold((0.0f32, 0usize), |(w, n), run| (w.max(run.line_w), n + 1));
        (width.ceil() as u32, (lines as f32 * line_height).ceil() as u32)
    }

    /// Draw `text` with its top-left corner at (x, y). `color` is BGRA.
    pub fn draw(
        &mut self,
        canvas: &mut Canvas,
        x: i32,
        y: i32,
        text: &str,
        font_size: f32,
        color: [u8; 4],
    ) {
        let buffer = self.layout(text, font_size, None);
        let base = Color::rgba(color[2], color[1], color[0], color[3]);
        buffer.draw(
            &mut self.font_system,
            &mut self.cache,
            base,
            |gx, gy, w, h, glyph_color| {
                // Glyph coverage arrives in the alpha channel
                if glyph_color.a() == 0 {
                    return;
                }
                let bgra = [glyph_color.b(), glyph_color.g(), glyph_color.r(), glyph_color.a()];
                for dy in 0..h as i32 {
                    for dx in 0..w as i32 {
                        canvas.blend_pixel(x + gx + dx, y + gy + dy, bgra);
                    }
                }
            },
        );
    }
}
