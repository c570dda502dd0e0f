// Image loading module
// Handles loading and processing of image files

use image::error::{ImageFormatHint, UnsupportedError, UnsupportedErrorKind};
use image::{DynamicImage, ImageFormat, RgbaImage};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions offered by the open dialog and accepted on the command line
pub const SUPPORTED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Why an image could not be opened
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unsupported image type: {} (expected PNG or JPEG)", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("failed to read image file {}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode image {}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("image {} has no pixels", .0.display())]
    Empty(PathBuf),
}

/// Loaded image data ready for display
#[derive(Debug, Clone)]
pub struct ImageData {
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Raw BGRA pixel data (4 bytes per pixel)
    pub rgba_data: Vec<u8>,
    /// Mipmap levels for faster downscaling (progressively half-sized versions)
    pub mipmaps: Vec<MipmapLevel>,
}

/// A single mipmap level
#[derive(Debug, Clone)]
pub struct MipmapLevel {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl ImageData {
    /// Build display data from a decoded RGBA image
    pub fn from_rgba(rgba: RgbaImage) -> Self {
        let (width, height) = rgba.dimensions();

        // Convert RGBA to BGRA (Wayland expects ARGB/BGRA in little-endian)
        let mut bgra_data = rgba.into_raw();
        for pixel in bgra_data.chunks_exact_mut(4) {
            pixel.swap(0, 2); // Swap R and B
        }

        let mipmaps = generate_mipmaps(width, height, &bgra_data);

        Self {
            width,
            height,
            rgba_data: bgra_data,
            mipmaps,
        }
    }

    /// Width divided by height
    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }

    /// Copy of this image with every pixel's alpha replaced by `alpha`,
    /// mipmaps included
    pub fn with_alpha(&self, alpha: u8) -> Self {
        let mut copy = self.clone();
        put_alpha(&mut copy.rgba_data, alpha);
        for level in &mut copy.mipmaps {
            put_alpha(&mut level.data, alpha);
        }
        copy
    }

    #[cfg(test)]
    pub fn alpha_at(&self, x: u32, y: u32) -> u8 {
        self.rgba_data[((y * self.width + x) * 4 + 3) as usize]
    }
}

/// Alpha value for an opacity in [0, 1]
pub fn alpha_for_opacity(opacity: f32) -> u8 {
    (255.0 * opacity.clamp(0.0, 1.0)).round() as u8
}

fn put_alpha(data: &mut [u8], alpha: u8) {
    for pixel in data.chunks_exact_mut(4) {
        pixel[3] = alpha;
    }
}

/// Load a PNG or JPEG image from disk
pub fn load_image(path: &Path) -> Result<ImageData, LoadError> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    if format_from_extension(ext).is_none() {
        return Err(LoadError::UnsupportedFormat(path.to_path_buf()));
    }

    let data = fs::read(path).map_err(|source| LoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let img = load_from_bytes(&data).map_err(|source| LoadError::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    if img.width() == 0 || img.height() == 0 {
        return Err(LoadError::Empty(path.to_path_buf()));
    }

    Ok(ImageData::from_rgba(img.to_rgba8()))
}

/// Generate mipmap levels (progressively half-sized versions)
fn generate_mipmaps(width: u32, height: u32, data: &[u8]) -> Vec<MipmapLevel> {
    let mut mipmaps = Vec::new();
    let mut current_width = width;
    let mut current_height = height;
    let mut current_data = data.to_vec();

    // Generate up to 8 levels or until size is too small
    while current_width > 64 && current_height > 64 && mipmaps.len() < 8 {
        let next_width = current_width / 2;
        let next_height = current_height / 2;

        if next_width < 32 || next_height < 32 {
            break;
        }

        // Box filter, 2x2 average per channel
        let mut next_data = vec![0u8; (next_width * next_height * 4) as usize];
        for y in 0..next_height {
            for x in 0..next_width {
                let mut sum = [0u32; 4];
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let sx = (x * 2 + dx).min(current_width - 1);
                    let sy = (y * 2 + dy).min(current_height - 1);
                    let idx = ((sy * current_width + sx) * 4) as usize;
                    for (c, total) in sum.iter_mut().enumerate() {
                        *total += current_data[idx + c] as u32;
                    }
                }

                let dst_idx = ((y * next_width + x) * 4) as usize;
                for (c, total) in sum.iter().enumerate() {
                    next_data[dst_idx + c] = (total / 4) as u8;
                }
            }
        }

        current_width = next_width;
        current_height = next_height;
        current_data = next_data.clone();

        mipmaps.push(MipmapLevel {
            width: next_width,
            height: next_height,
            data: next_data,
        });
    }

    mipmaps
}

/// Decode raw bytes, accepting only PNG and JPEG content
fn load_from_bytes(data: &[u8]) -> Result<DynamicImage, image::ImageError> {
    let format = image::guess_format(data)?;
    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        let hint = ImageFormatHint::Exact(format);
        return Err(image::ImageError::Unsupported(
            UnsupportedError::from_format_and_kind(hint.clone(), UnsupportedErrorKind::Format(hint)),
        ));
    }

    image::load_from_memory_with_format(data, format)
}

/// Get the image format for an accepted file extension
pub fn format_from_extension(ext: &str) -> Option<ImageFormat> {
    match ext.to_lowercase().as_str() {
        "png" => Some(ImageFormat::Png),
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn write_fixture(name: &str, width: u32, height: u32) -> PathBuf {
        let path = std::env::temp_dir().join(format!("seethru-{}-{}", std::process::id(), name));
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 100, 50, 255]));
        img.save(&path).unwrap();
        path
    }

    #[test]
    fn test_accepted_extensions() {
        assert_eq!(format_from_extension("png"), Some(ImageFormat::Png));
        assert_eq!(format_from_extension("JPG"), Some(ImageFormat::Jpeg));
        assert_eq!(format_from_extension("jpeg"), Some(ImageFormat::Jpeg));
        assert_eq!(format_from_extension("gif"), None);
        assert_eq!(format_from_extension("bmp"), None);
        assert_eq!(format_from_extension(""), None);
    }

    #[test]
    fn test_load_png() {
        let path = write_fixture("load.png", 8, 4);
        let image = load_image(&path).unwrap();
        assert_eq!((image.width, image.height), (8, 4));
        assert_eq!(image.rgba_data.len(), 8 * 4 * 4);
        // Stored as BGRA
        assert_eq!(&image.rgba_data[..4], &[50, 100, 200, 255]);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_rejects_other_extension() {
        let err = load_image(Path::new("/tmp/drawing.gif")).unwrap_err();
        assert!(matches!(err, LoadError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = load_image(Path::new("/nonexistent/seethru/missing.png")).unwrap_err();
        assert!(matches!(err, LoadError::Read { .. }));
    }

    #[test]
    fn test_corrupt_file() {
        let path = std::env::temp_dir().join(format!("seethru-{}-corrupt.png", std::process::id()));
        fs::write(&path, b"definitely not a png").unwrap();
        let err = load_image(&path).unwrap_err();
        assert!(matches!(err, LoadError::Decode { .. }));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_alpha_for_opacity() {
        assert_eq!(alpha_for_opacity(1.0), 255);
        assert_eq!(alpha_for_opacity(0.0), 0);
        assert_eq!(alpha_for_opacity(0.5), 128);
        assert_eq!(alpha_for_opacity(0.3), 77);
        assert_eq!(alpha_for_opacity(2.0), 255);
    }

    #[test]
    fn test_with_alpha_replaces_every_level() {
        let image = ImageData::from_rgba(RgbaImage::from_pixel(256, 256, Rgba([1, 2, 3, 10])));
        assert!(!image.mipmaps.is_empty());

        let copy = image.with_alpha(77);
        assert!(copy.rgba_data.chunks_exact(4).all(|p| p[3] == 77));
        assert!(copy
            .mipmaps
            .iter()
            .all(|level| level.data.chunks_exact(4).all(|p| p[3] == 77)));
        // Colour untouched, original untouched
        assert_eq!(&copy.rgba_data[..3], &[3, 2, 1]);
        assert_eq!(image.alpha_at(0, 0), 10);
    }

    #[test]
    fn test_mipmap_sizes() {
        let image = ImageData::from_rgba(RgbaImage::new(300, 200));
        let sizes: Vec<_> = image.mipmaps.iter().map(|m| (m.width, m.height)).collect();
        assert_eq!(sizes, vec![(150, 100), (75, 50)]);
    }
}
