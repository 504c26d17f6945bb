//! Compositing surface shared by both compositor variants
//!
//! Frame layout: black background, primary frame stretched over the whole
//! canvas, secondary frame mirrored horizontally as a bordered inset in the
//! bottom-right corner.

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

/// Inset width never exceeds this many pixels
pub const INSET_MAX_WIDTH: u32 = 200;
/// Inset width as a fraction of the canvas width
pub const INSET_WIDTH_RATIO: f64 = 0.2;
/// Gap between the inset border and the canvas edges
pub const INSET_MARGIN: u32 = 20;
/// Border drawn around the inset
pub const INSET_BORDER: u32 = 2;

const BLACK: [u8; 4] = [0, 0, 0, 255];
const BORDER_COLOR: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// Placement of the secondary inset on the canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsetLayout {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl InsetLayout {
    /// Width is min(200, 0.2 * canvas width); height keeps the source
    /// aspect ratio. Returns `None` when nothing would be visible.
    pub fn compute(canvas_width: u32, canvas_height: u32, source_width: u32, source_height: u32) -> Option<Self> {
        if source_width == 0 || source_height == 0 {
            return None;
        }

        let width = INSET_MAX_WIDTH.min((canvas_width as f64 * INSET_WIDTH_RATIO) as u32);
        let height = (width as f64 * source_height as f64 / source_width as f64).round() as u32;
        if width == 0 || height == 0 {
            return None;
        }

        Some(Self {
            x: canvas_width.saturating_sub(width + INSET_MARGIN),
            y: canvas_height.saturating_sub(height + INSET_MARGIN),
            width,
            height,
        })
    }
}

/// A canvas owned by exactly one compositor
pub struct Surface {
    canvas: RgbaImage,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            canvas: RgbaImage::from_pixel(width.max(1), height.max(1), Rgba(BLACK)),
        }
    }

    pub fn width(&self) -> u32 {
        self.canvas.width()
    }

    pub fn height(&self) -> u32 {
        self.canvas.height()
    }

    /// Redraw the whole canvas from the given inputs
    pub fn draw(&mut self, primary: Option<&RgbaImage>, secondary: Option<&RgbaImage>) -> &RgbaImage {
        let (width, height) = self.canvas.dimensions();

        for pixel in self.canvas.chunks_exact_mut(4) {
            pixel.copy_from_slice(&BLACK);
        }

        if let Some(primary) = primary {
            // Capture frames are opaque, so the primary replaces the background
            if primary.dimensions() == (width, height) {
                self.canvas.copy_from_slice(primary.as_raw());
            } else if primary.width() > 0 && primary.height() > 0 {
                let scaled = imageops::resize(primary, width, height, FilterType::Triangle);
                self.canvas.copy_from_slice(scaled.as_raw());
            }
        }

        if let Some(secondary) = secondary {
            self.draw_inset(secondary);
        }

        &self.canvas
    }

    fn draw_inset(&mut self, secondary: &RgbaImage) {
        let (width, height) = self.canvas.dimensions();
        let Some(layout) = InsetLayout::compute(width, height, secondary.width(), secondary.height()) else {
            return;
        };

        let left = layout.x.saturating_sub(INSET_BORDER);
        let top = layout.y.saturating_sub(INSET_BORDER);
        let right = (layout.x + layout.width + INSET_BORDER).min(width);
        let bottom = (layout.y + layout.height + INSET_BORDER).min(height);
        for y in top..bottom {
            for x in left..right {
                self.canvas.put_pixel(x, y, BORDER_COLOR);
            }
        }

        let mut inset = imageops::resize(secondary, layout.width, layout.height, FilterType::Triangle);
        imageops::flip_horizontal_in_place(&mut inset);
        imageops::replace(&mut self.canvas, &inset, layout.x as i64, layout.y as i64);
    }

    /// Copy of the last drawn canvas
    pub fn snapshot(&self) -> RgbaImage {
        self.canvas.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbaImage {
        RgbaImage::from_pixel(width, height, Rgba([rgb[0], rgb[1], rgb[2], 255]))
    }

    #[test]
    fn test_inset_layout_caps_width_at_200() {
        let layout = InsetLayout::compute(1280, 720, 640, 480).unwrap();
        assert_eq!(layout.width, 200);
        assert_eq!(layout.height, 150);
        assert_eq!(layout.x, 1280 - 200 - 20);
        assert_eq!(layout.y, 720 - 150 - 20);
    }

    #[test]
    fn test_inset_layout_uses_fifth_of_small_canvas() {
        let layout = InsetLayout::compute(640, 360, 640, 360).unwrap();
        assert_eq!(layout.width, 128);
        assert_eq!(layout.height, 72);
        assert_eq!((layout.x, layout.y), (492, 268));
    }

    #[test]
    fn test_background_is_black_without_inputs() {
        let mut surface = Surface::new(8, 8);
        let canvas = surface.draw(None, None);
        assert!(canvas.pixels().all(|p| *p == Rgba(BLACK)));
    }

    #[test]
    fn test_primary_is_scaled_to_full_canvas() {
        let mut surface = Surface::new(320, 180);
        let primary = solid(64, 36, [10, 200, 30]);
        let canvas = surface.draw(Some(&primary), None);

        assert_eq!(*canvas.get_pixel(0, 0), Rgba([10, 200, 30, 255]));
        assert_eq!(*canvas.get_pixel(319, 179), Rgba([10, 200, 30, 255]));
    }

    #[test]
    fn test_secondary_is_mirrored_inside_border() {
        let mut surface = Surface::new(640, 360);
        let primary = solid(640, 360, [0, 0, 255]);

        // Left half red, right half green
        let secondary = RgbaImage::from_fn(64, 36, |x, _| {
            if x < 32 {
                Rgba([255, 0, 0, 255])
            } else {
                Rgba([0, 255, 0, 255])
            }
        });
        let canvas = surface.draw(Some(&primary), Some(&secondary)).clone();
        let layout = InsetLayout::compute(640, 360, 64, 36).unwrap();

        // Mirrored: the inset's left edge shows the source's right half
        let left = canvas.get_pixel(layout.x + 2, layout.y + layout.height / 2);
        let right = canvas.get_pixel(layout.x + layout.width - 3, layout.y + layout.height / 2);
        assert_eq!(*left, Rgba([0, 255, 0, 255]));
        assert_eq!(*right, Rgba([255, 0, 0, 255]));

        // Border just outside the inset, primary beyond it
        assert_eq!(*canvas.get_pixel(layout.x - 1, layout.y + 5), BORDER_COLOR);
        assert_eq!(*canvas.get_pixel(layout.x - INSET_BORDER, layout.y + 5), BORDER_COLOR);
        assert_eq!(
            *canvas.get_pixel(layout.x - INSET_BORDER - 1, layout.y + 5),
            Rgba([0, 0, 255, 255])
        );
        assert_eq!(*canvas.get_pixel(639, 359), Rgba([0, 0, 255, 255]));
    }
}
