// CPU rendering into shared-memory ARGB8888 buffers
// Everything outside the image stays at alpha 0, so the desktop shows through

use crate::image_loader::ImageData;

/// A BGRA pixel buffer (ARGB8888 in little-endian)
pub struct Canvas<'a> {
    data: &'a mut [u8],
    width: u32,
    height: u32,
}

impl<'a> Canvas<'a> {
    pub fn new(data: &'a mut [u8], width: u32, height: u32) -> Self {
        debug_assert!(data.len() >= (width * height * 4) as usize);
        Self { data, width, height }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Fill with fully transparent pixels
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..(self.width * self.height * 4) as usize]
    }

    /// Overwrite the canvas with a previously rendered frame of the same size
    pub fn copy_from(&mut self, frame: &[u8]) {
        let len = (self.width * self.height * 4) as usize;
        if frame.len() == len {
            self.data[..len].copy_from_slice(frame);
        }
    }

    fn index(&self, x: i32, y: i32) -> Option<usize> {
        if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
            return None;
        }
        Some(((y as u32 * self.width + x as u32) * 4) as usize)
    }

    /// Write a straight-alpha BGRA colour, premultiplying it
    pub fn draw_pixel(&mut self, x: i32, y: i32, color: [u8; 4]) {
        if let Some(idx) = self.index(x, y) {
            self.data[idx..idx + 4].copy_from_slice(&premultiply(color));
        }
    }

    /// Composite a straight-alpha BGRA colour over the existing pixel
    pub fn blend_pixel(&mut self, x: i32, y: i32, color: [u8; 4]) {
        let Some(idx) = self.index(x, y) else {
            return;
        };
        let src = premultiply(color);
        let inv = 255 - src[3] as u32;
        for c in 0..4 {
            let dst = self.data[idx + c] as u32;
            self.data[idx + c] = (src[c] as u32 + (dst * inv + 127) / 255).min(255) as u8;
        }
    }

    pub fn fill_rect(&mut self, x: i32, y: i32, width: u32, height: u32, color: [u8; 4]) {
        for py in y..y + height as i32 {
            for px in x..x + width as i32 {
                self.draw_pixel(px, py, color);
            }
        }
    }

    /// One-pixel rectangle outline
    pub fn stroke_rect(&mut self, x: i32, y: i32, width: u32, height: u32, color: [u8; 4]) {
        let right = x + width as i32 - 1;
        let bottom = y + height as i32 - 1;
        for px in x..=right {
            self.draw_pixel(px, y, color);
            self.draw_pixel(px, bottom, color);
        }
        for py in y..=bottom {
            self.draw_pixel(x, py, color);
            self.draw_pixel(right, py, color);
        }
    }

    #[cfg(test)]
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let idx = ((y * self.width + x) * 4) as usize;
        [
            self.data[idx],
            self.data[idx + 1],
            self.data[idx + 2],
            self.data[idx + 3],
        ]
    }
}

fn premultiply(color: [u8; 4]) -> [u8; 4] {
    let a = color[3] as u32;
    let mul = |c: u8| ((c as u32 * a + 127) / 255) as u8;
    [mul(color[0]), mul(color[1]), mul(color[2]), color[3]]
}

/// Placement of the image inside the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Size the image is scaled to
    pub width: u32,
    pub height: u32,
    /// Image rows scrolled above the top of the window
    pub scroll_offset: u32,
}

/// Pick the source level for a downscale. Below `threshold` the smallest
/// mipmap still at least as large as the target scale is used.
fn select_level(image: &ImageData, scale_ratio: f32, threshold: f32) -> (u32, u32, &[u8]) {
    if scale_ratio >= threshold || image.mipmaps.is_empty() {
        return (image.width, image.height, &image.rgba_data[..]);
    }

    let mut chosen = None;
    for mipmap in &image.mipmaps {
        let mip_scale = mipmap.width as f32 / image.width as f32;
        if mip_scale < scale_ratio {
            break;
        }
        chosen = Some(mipmap);
    }

    match chosen {
        Some(mipmap) => (mipmap.width, mipmap.height, &mipmap.data[..]),
        None => (image.width, image.height, &image.rgba_data[..]),
    }
}

/// Draw the image with bilinear filtering. Pixels outside the image are
/// cleared to transparent.
pub fn render_image(canvas: &mut Canvas, image: &ImageData, placement: Placement) {
    canvas.clear();
    if placement.width == 0 || placement.height == 0 {
        return;
    }

    let scale_ratio = (placement.width as f32 / image.width as f32)
        .min(placement.height as f32 / image.height as f32);
    let (img_width, img_height, src_data) = select_level(image, scale_ratio, 0.7);

    let scale_x = img_width as f32 / placement.width as f32;
    let scale_y = img_height as f32 / placement.height as f32;

    let visible_w = placement.width.min(canvas.width());
    let visible_h = placement
        .height
        .saturating_sub(placement.scroll_offset)
        .min(canvas.height());

    let get_pixel = |px: u32, py: u32| -> [u8; 4] {
        let idx = ((py * img_width + px) * 4) as usize;
        [
            src_data[idx],
            src_data[idx + 1],
            src_data[idx + 2],
            src_data[idx + 3],
        ]
    };

    for y in 0..visible_h {
        let src_y = ((y + placement.scroll_offset) as f32 * scale_y).min((img_height - 1) as f32);
        let y0 = src_y.floor() as u32;
        let y1 = (y0 + 1).min(img_height - 1);
        let fy = src_y - y0 as f32;

        for x in 0..visible_w {
            let src_x = (x as f32 * scale_x).min((img_width - 1) as f32);
            let x0 = src_x.floor() as u32;
            let x1 = (x0 + 1).min(img_width - 1);
            let fx = src_x - x0 as f32;

            let p00 = get_pixel(x0, y0);
            let p10 = get_pixel(x1, y0);
            let p01 = get_pixel(x0, y1);
            let p11 = get_pixel(x1, y1);

            let interpolate = |c: usize| -> u8 {
                let v0 = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
                let v1 = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
                (v0 * (1.0 - fy) + v1 * fy).round().clamp(0.0, 255.0) as u8
            };

            canvas.draw_pixel(
                x as i32,
                y as i32,
                [interpolate(0), interpolate(1), interpolate(2), interpolate(3)],
            );
        }
    }
}

/// Nearest-neighbour variant of `render_image`, used while the window is
/// being dragged to a new size
pub fn render_image_fast(canvas: &mut Canvas, image: &ImageData, placement: Placement) {
    canvas.clear();
    if placement.width == 0 || placement.height == 0 {
        return;
    }

    let scale_ratio = (placement.width as f32 / image.width as f32)
        .min(placement.height as f32 / image.height as f32);
    let (img_width, img_height, src_data) = select_level(image, scale_ratio * 0.75, 0.5);

    // Fixed-point scale factors
    let scale_x_fp = ((img_width as u64) << 16) / placement.width as u64;
    let scale_y_fp = ((img_height as u64) << 16) / placement.height as u64;
    let img_stride = img_width * 4;

    let visible_w = placement.width.min(canvas.width());
    let visible_h = placement
        .height
        .saturating_sub(placement.scroll_offset)
        .min(canvas.height());

    // Pre-compute X lookup table to avoid repeated calculations per row
    let x_lut: Vec<u32> = (0..visible_w)
        .map(|x| (((x as u64 * scale_x_fp) >> 16) as u32).min(img_width - 1))
        .collect();

    for y in 0..visible_h {
        let src_y = ((((y + placement.scroll_offset) as u64) * scale_y_fp) >> 16) as u32;
        let src_row_offset = (src_y.min(img_height - 1) * img_stride) as usize;

        for (x, &src_x) in x_lut.iter().enumerate() {
            let src_idx = src_row_offset + (src_x * 4) as usize;
            canvas.draw_pixel(
                x as i32,
                y as i32,
                [
                    src_data[src_idx],
                    src_data[src_idx + 1],
                    src_data[src_idx + 2],
                    src_data[src_idx + 3],
                ],
            );
        }
    }
}

/// Subtle corner marks showing where the window can be grabbed for resizing
pub fn render_resize_border(canvas: &mut Canvas, corner_size: u32) {
    let border_color: [u8; 4] = [150, 150, 150, 100];
    let right = canvas.width() as i32 - 1;
    let bottom = canvas.height() as i32 - 1;

    for i in 0..corner_size as i32 {
        // Top-left
        canvas.draw_pixel(i, 0, border_color);
        canvas.draw_pixel(0, i, border_color);
        // Top-right
        canvas.draw_pixel(right - i, 0, border_color);
        canvas.draw_pixel(right, i, border_color);
        // Bottom-left
        canvas.draw_pixel(i, bottom, border_color);
        canvas.draw_pixel(0, bottom - i, border_color);
        // Bottom-right
        canvas.draw_pixel(right - i, bottom, border_color);
        canvas.draw_pixel(right, bottom - i, border_color);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn solid(width: u32, height: u32, alpha: u8) -> ImageData {
        ImageData::from_rgba(RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255])))
            .with_alpha(alpha)
    }

    #[test]
    fn test_background_is_transparent() {
        let image = solid(10, 5, 255);
        let mut buf = vec![7u8; 20 * 20 * 4];
        let mut canvas = Canvas::new(&mut buf, 20, 20);
        render_image(
            &mut canvas,
            &image,
            Placement {
                width: 20,
                height: 10,
                scroll_offset: 0,
            },
        );

        assert_eq!(canvas.pixel(0, 0), [255, 255, 255, 255]);
        assert_eq!(canvas.pixel(19, 9), [255, 255, 255, 255]);
        assert_eq!(canvas.pixel(0, 10), [0, 0, 0, 0]);
        assert_eq!(canvas.pixel(19, 19), [0, 0, 0, 0]);
    }

    #[test]
    fn test_image_alpha_is_carried() {
        for d in 1..=9u32 {
            let alpha = (255.0 * (d as f32 / 10.0)).round() as u8;
            let image = solid(4, 4, alpha);
            let mut buf = vec![0u8; 8 * 8 * 4];
            let mut canvas = Canvas::new(&mut buf, 8, 8);
            let placement = Placement {
                width: 8,
                height: 8,
                scroll_offset: 0,
            };

            render_image(&mut canvas, &image, placement);
            assert_eq!(canvas.pixel(3, 3)[3], alpha);
            // Premultiplied colour
            assert_eq!(canvas.pixel(3, 3)[0], alpha);

            render_image_fast(&mut canvas, &image, placement);
            assert_eq!(canvas.pixel(3, 3)[3], alpha);
        }
    }

    #[test]
    fn test_scroll_offset_shifts_rows() {
        // Top half red, bottom half blue
        let mut img = RgbaImage::from_pixel(4, 4, Rgba([255, 0, 0, 255]));
        for y in 2..4 {
            for x in 0..4 {
                img.put_pixel(x, y, Rgba([0, 0, 255, 255]));
            }
        }
        let image = ImageData::from_rgba(img);

        let mut buf = vec![0u8; 4 * 2 * 4];
        let mut canvas = Canvas::new(&mut buf, 4, 2);
        let placement = Placement {
            width: 4,
            height: 4,
            scroll_offset: 2,
        };
        render_image_fast(&mut canvas, &image, placement);
        // BGRA blue
        assert_eq!(canvas.pixel(0, 0), [255, 0, 0, 255]);

        render_image(&mut canvas, &image, placement);
        assert_eq!(canvas.pixel(0, 1), [255, 0, 0, 255]);
    }

    #[test]
    fn test_scrolled_past_image_end() {
        let image = solid(4, 4, 255);
        let mut buf = vec![0u8; 4 * 4 * 4];
        let mut canvas = Canvas::new(&mut buf, 4, 4);
        render_image(
            &mut canvas,
            &image,
            Placement {
                width: 4,
                height: 4,
                scroll_offset: 3,
            },
        );
        assert_eq!(canvas.pixel(0, 0)[3], 255);
        assert_eq!(canvas.pixel(0, 1), [0, 0, 0, 0]);
    }

    #[test]
    fn test_blend_pixel() {
        let mut buf = vec![0u8; 4];
        let mut canvas = Canvas::new(&mut buf, 1, 1);
        canvas.draw_pixel(0, 0, [0, 0, 200, 255]);
        canvas.blend_pixel(0, 0, [200, 0, 0, 0]);
        assert_eq!(canvas.pixel(0, 0), [0, 0, 200, 255]);
        canvas.blend_pixel(0, 0, [200, 0, 0, 255]);
        assert_eq!(canvas.pixel(0, 0), [200, 0, 0, 255]);
        // Out of bounds writes are ignored
        canvas.blend_pixel(5, -1, [1, 2, 3, 4]);
    }

    #[test]
    fn test_downscale_uses_mipmap() {
        let image = solid(512, 512, 128);
        assert!(!image.mipmaps.is_empty());
        let mut buf = vec![0u8; 64 * 64 * 4];
        let mut canvas = Canvas::new(&mut buf, 64, 64);
        render_image(
            &mut canvas,
            &image,
            Placement {
                width: 64,
                height: 64,
                scroll_offset: 0,
            },
        );
        assert_eq!(canvas.pixel(63, 63)[3], 128);
    }
}
