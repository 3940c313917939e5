//! Binary hair-region mask, painted by hand or thresholded from a
//! model-generated segmentation.
//!
//! The raster is RGBA at the source image's resolution. An opaque white
//! pixel marks hair to be replaced. Every other pixel is fully transparent.
//! Nothing in between is ever stored.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{ImageFormat, Rgba, RgbaImage};
use serde::Deserialize;

use crate::codec::ImagePayload;
use crate::error::{GenerationError, Result};

const SELECTED: Rgba<u8> = Rgba([255, 255, 255, 255]);
const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Channels strictly above this count as hair in a segmentation image.
pub const SEGMENTATION_THRESHOLD: u8 = 100;

const MIN_STROKE_PX: f32 = 5.0;
/// Brush size 100 covers this fraction of the image width.
const MAX_STROKE_FRACTION: f32 = 0.15;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    #[default]
    Brush,
    Eraser,
}

/// Stroke width in pixels for a 1-100 brush size.
pub fn stroke_width(image_width: u32, brush_percent: f32) -> f32 {
    let percent = brush_percent.clamp(1.0, 100.0);
    (image_width as f32 * (percent / 100.0) * MAX_STROKE_FRACTION).max(MIN_STROKE_PX)
}

/// Collapses a segmentation pixel to either selected or clear.
pub fn binarize(pixel: Rgba<u8>) -> Rgba<u8> {
    let [r, g, b, _] = pixel.0;
    if r > SEGMENTATION_THRESHOLD && g > SEGMENTATION_THRESHOLD && b > SEGMENTATION_THRESHOLD {
        SELECTED
    } else {
        CLEAR
    }
}

#[derive(Debug, Clone)]
pub struct MaskLayer {
    raster: RgbaImage,
    is_set: bool,
}

impl MaskLayer {
    pub fn new(width: u32, height: u32) -> Self {
        Self { raster: RgbaImage::from_pixel(width, height, CLEAR), is_set: false }
    }

    /// Replaces the whole layer with a thresholded segmentation image,
    /// rescaled to `width` x `height` when the model answered at another size.
    pub fn from_segmentation(width: u32, height: u32, segmentation: &ImagePayload) -> Result<Self> {
        let decoded = image::load_from_memory(&segmentation.bytes)
            .map_err(GenerationError::undecodable_model_image)?
            .to_rgba8();
        let scaled = if decoded.dimensions() == (width, height) {
            decoded
        } else {
            image::imageops::resize(&decoded, width, height, FilterType::Triangle)
        };
        let mut raster = scaled;
        for pixel in raster.pixels_mut() {
            *pixel = binarize(*pixel);
        }
        Ok(Self { raster, is_set: true })
    }

    pub fn width(&self) -> u32 {
        self.raster.width()
    }

    pub fn height(&self) -> u32 {
        self.raster.height()
    }

    /// False until something is painted or detected, and again after `clear`.
    pub fn is_set(&self) -> bool {
        self.is_set
    }

    pub fn is_selected(&self, x: u32, y: u32) -> bool {
        self.raster.get_pixel_checked(x, y).is_some_and(|p| p.0[3] == 255)
    }

    pub fn selected_pixels(&self) -> usize {
        let (w, h) = self.raster.dimensions();
        (0..h).flat_map(|y| (0..w).map(move |x| (x, y))).filter(|&(x, y)| self.is_selected(x, y)).count()
    }

    pub fn paint_stroke(&mut self, points: &[Point], tool: Tool, brush_percent: f32) -> Result<()> {
        if points.is_empty() {
            return Err(GenerationError::InvalidRequest("stroke has no points".into()));
        }
        if points.iter().any(|p| !p.x.is_finite() || !p.y.is_finite()) {
            return Err(GenerationError::InvalidRequest("stroke point is not finite".into()));
        }
        let radius = stroke_width(self.width(), brush_percent) / 2.0;
        let color = match tool {
            Tool::Brush => SELECTED,
            Tool::Eraser => CLEAR,
        };
        if points.len() == 1 {
            self.fill_capsule(points[0], points[0], radius, color);
        } else {
            for pair in points.windows(2) {
                self.fill_capsule(pair[0], pair[1], radius, color);
            }
        }
        self.is_set = true;
        Ok(())
    }

    pub fn clear(&mut self) {
        for pixel in self.raster.pixels_mut() {
            *pixel = CLEAR;
        }
        self.is_set = false;
    }

    /// Black background with the selection composited on top, as PNG.
    pub fn export(&self) -> Result<ImagePayload> {
        let mut out = RgbaImage::from_pixel(self.width(), self.height(), Rgba([0, 0, 0, 255]));
        for (dst, src) in out.pixels_mut().zip(self.raster.pixels()) {
            let alpha = src.0[3] as u32;
            for c in 0..3 {
                dst.0[c] = (src.0[c] as u32 * alpha / 255) as u8;
            }
        }
        let mut buf = Cursor::new(Vec::new());
        out.write_to(&mut buf, ImageFormat::Png)
            .map_err(|e| GenerationError::Mask(e.to_string()))?;
        Ok(ImagePayload::new("image/png", buf.into_inner()))
    }

    /// Sets every pixel whose centre lies within `radius` of segment `a`-`b`.
    fn fill_capsule(&mut self, a: Point, b: Point, radius: f32, color: Rgba<u8>) {
        let (w, h) = self.raster.dimensions();
        if w == 0 || h == 0 {
            return;
        }
        let min_x = (a.x.min(b.x) - radius).floor().max(0.0) as u32;
        let min_y = (a.y.min(b.y) - radius).floor().max(0.0) as u32;
        let max_x = (a.x.max(b.x) + radius).ceil().min((w - 1) as f32);
        let max_y = (a.y.max(b.y) + radius).ceil().min((h - 1) as f32);
        if max_x < 0.0 || max_y < 0.0 {
            return;
        }
        let (max_x, max_y) = (max_x as u32, max_y as u32);

        let (dx, dy) = (b.x - a.x, b.y - a.y);
        let len_sq = dx * dx + dy * dy;
        let r_sq = radius * radius;
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let (px, py) = (x as f32 + 0.5, y as f32 + 0.5);
                let t = if len_sq == 0.0 {
                    0.0
                } else {
                    (((px - a.x) * dx + (py - a.y) * dy) / len_sq).clamp(0.0, 1.0)
                };
                let (cx, cy) = (a.x + t * dx - px, a.y + t * dy - py);
                if cx * cx + cy * cy <= r_sq {
                    self.raster.put_pixel(x, y, color);
                }
            }
        }
    }
}
