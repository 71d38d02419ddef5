//! Match-status overlays drawn over the live feed.
//!
//! [`render`] draws onto any [`Surface`]. [`Overlay`] records the draw calls
//! as a serializable display list for clients; [`RasterSurface`] paints them
//! onto a transparent RGBA image.

use crate::matcher::MatchResult;
use crate::types::FaceDetection;
use ab_glyph::{FontArc, PxScale};
use image::{GrayImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const MATCH_COLOR: Color = Color([0, 128, 0, 255]);
pub const UNKNOWN_COLOR: Color = Color([255, 0, 0, 255]);
pub const MATCH_LABEL: &str = "Match detected";
pub const UNKNOWN_LABEL: &str = "Unknown";
pub const LINE_WIDTH: u32 = 3;
pub const LABEL_SIZE: f32 = 18.0;
/// Gap between the label baseline and the top edge of the box.
pub const LABEL_OFFSET: f32 = 5.0;

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("failed to read font {path}: {source}")]
    FontRead {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid font file: {0}")]
    InvalidFont(String),
}

/// RGBA colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Color(pub [u8; 4]);

/// A drawing target the size of the video frame.
pub trait Surface {
    fn resize(&mut self, width: u32, height: u32);
    fn clear(&mut self);
    fn stroke_rect(
        &mut self,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        color: Color,
        line_width: u32,
    );
    /// `y` is the text baseline.
    fn fill_text(&mut self, text: &str, x: f32, y: f32, size: f32, color: Color);
}

/// Draw every detection's box and label in its match colour.
///
/// A detection without a corresponding result is drawn as unknown.
pub fn render<S: Surface + ?Sized>(
    surface: &mut S,
    detections: &[FaceDetection],
    results: &[MatchResult],
) {
    for (i, face) in detections.iter().enumerate() {
        let matched = results.get(i).is_some_and(|r| r.is_match);
        let (color, label) = if matched {
            (MATCH_COLOR, MATCH_LABEL)
        } else {
            (UNKNOWN_COLOR, UNKNOWN_LABEL)
        };
        let b = &face.bbox;
        surface.stroke_rect(b.x, b.y, b.width, b.height, color, LINE_WIDTH);
        surface.fill_text(label, b.x, b.y - LABEL_OFFSET, LABEL_SIZE, color);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DrawCommand {
    StrokeRect {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        color: Color,
        line_width: u32,
    },
    FillText {
        text: String,
        x: f32,
        y: f32,
        size: f32,
        color: Color,
    },
}

/// Recorded overlay for one detection cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    /// Detection cycle that produced this overlay; 0 before the first cycle.
    pub cycle: u64,
    pub width: u32,
    pub height: u32,
    pub commands: Vec<DrawCommand>,
}

impl Overlay {
    pub fn new(cycle: u64) -> Self {
        Self {
            cycle,
            ..Self::default()
        }
    }

    /// Number of face boxes drawn.
    pub fn box_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|c| matches!(c, DrawCommand::StrokeRect { .. }))
            .count()
    }

    /// Labels in draw order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().filter_map(|c| match c {
            DrawCommand::FillText { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Draw the recorded commands onto another surface.
    pub fn replay<S: Surface + ?Sized>(&self, surface: &mut S) {
        surface.resize(self.width, self.height);
        surface.clear();
        for command in &self.commands {
            match command {
                DrawCommand::StrokeRect { x, y, width, height, color, line_width } => {
                    surface.stroke_rect(*x, *y, *width, *height, *color, *line_width)
                }
                DrawCommand::FillText { text, x, y, size, color } => {
                    surface.fill_text(text, *x, *y, *size, *color)
                }
            }
        }
    }
}

impl Surface for Overlay {
    fn resize(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    fn clear(&mut self) {
        self.commands.clear();
    }

    fn stroke_rect(
        &mut self,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        color: Color,
        line_width: u32,
    ) {
        self.commands.push(DrawCommand::StrokeRect {
            x,
            y,
            width,
            height,
            color,
            line_width,
        });
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, size: f32, color: Color) {
        self.commands.push(DrawCommand::FillText {
            text: text.to_string(),
            x,
            y,
            size,
            color,
        });
    }
}

/// Transparent RGBA canvas.
///
/// Text needs a font; without one, labels are drawn as solid plates of
/// roughly the text's extent.
pub struct RasterSurface {
    image: RgbaImage,
    font: Option<FontArc>,
}

impl RasterSurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbaImage::new(width, height),
            font: None,
        }
    }

    pub fn with_font(mut self, font: FontArc) -> Self {
        self.font = Some(font);
        self
    }

    pub fn load_font(path: &Path) -> Result<FontArc, OverlayError> {
        let bytes = std::fs::read(path).map_err(|source| OverlayError::FontRead {
            path: path.display().to_string(),
            source,
        })?;
        FontArc::try_from_vec(bytes).map_err(|e| OverlayError::InvalidFont(e.to_string()))
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    /// The overlay laid over a grayscale frame of the same size.
    pub fn composite_over(&self, frame: &GrayImage) -> RgbaImage {
        let mut base = image::DynamicImage::ImageLuma8(frame.clone()).into_rgba8();
        image::imageops::overlay(&mut base, &self.image, 0, 0);
        base
    }
}

impl Surface for RasterSurface {
    fn resize(&mut self, width: u32, height: u32) {
        if self.image.dimensions() != (width, height) {
            self.image = RgbaImage::new(width, height);
        }
    }

    fn clear(&mut self) {
        self.image.pixels_mut().for_each(|p| *p = Rgba([0, 0, 0, 0]));
    }

    fn stroke_rect(
        &mut self,
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        color: Color,
        line_width: u32,
    ) {
        let (x, y) = (x.round() as i32, y.round() as i32);
        let (w, h) = (width.round() as i32, height.round() as i32);
        // Thickness grows inward from the box edge.
        for t in 0..line_width as i32 {
            let (iw, ih) = (w - 2 * t, h - 2 * t);
            if iw <= 0 || ih <= 0 {
                break;
            }
            let rect = Rect::at(x + t, y + t).of_size(iw as u32, ih as u32);
            draw_hollow_rect_mut(&mut self.image, rect, Rgba(color.0));
        }
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, size: f32, color: Color) {
        let top = (y - size).round() as i32;
        match &self.font {
            Some(font) => {
                let (x, scale) = (x.round() as i32, PxScale::from(size));
                draw_text_mut(&mut self.image, Rgba(color.0), x, top, scale, font, text);
            }
            None => {
                let width = (text.chars().count() as f32 * size * 0.55).round().max(1.0) as u32;
                let height = size.round().max(1.0) as u32;
                let rect = Rect::at(x.round() as i32, top).of_size(width, height);
                draw_filled_rect_mut(&mut self.image, rect, Rgba(color.0));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, Descriptor, Gender, DESCRIPTOR_DIM};

    fn face(x: f32, y: f32) -> FaceDetection {
        FaceDetection {
            bbox: BoundingBox {
                x, y, width: 20.0, height: 20.0, confidence: 0.9, landmarks: None,
            },
            descriptor: Descriptor::new(vec![0.0; DESCRIPTOR_DIM]).unwrap(),
            age: 40.0,
            gender: Gender::Female,
            gender_probability: 0.8,
        }
    }

    fn result(is_match: bool) -> MatchResult {
        MatchResult { is_match, distance: if is_match { 0.2 } else { 0.9 } }
    }

    #[test]
    fn test_render_colors_by_match() {
        let mut overlay = Overlay::new(1);
        render(&mut overlay, &[face(10.0, 30.0), face(50.0, 30.0)], &[result(true), result(false)]);

        assert_eq!(overlay.box_count(), 2);
        assert_eq!(overlay.labels().collect::<Vec<_>>(), vec![MATCH_LABEL, UNKNOWN_LABEL]);
        assert_eq!(
            overlay.commands[1],
            DrawCommand::FillText {
                text: MATCH_LABEL.into(),
                x: 10.0,
                y: 25.0,
                size: LABEL_SIZE,
                color: MATCH_COLOR,
            }
        );
        assert!(matches!(
            overlay.commands[2],
            DrawCommand::StrokeRect { color: UNKNOWN_COLOR, line_width: LINE_WIDTH, .. }
        ));
    }

    #[test]
    fn test_render_missing_result_is_unknown() {
        let mut overlay = Overlay::new(1);
        render(&mut overlay, &[face(0.0, 30.0)], &[]);
        assert_eq!(overlay.labels().collect::<Vec<_>>(), vec![UNKNOWN_LABEL]);
    }

    #[test]
    fn test_render_nothing_for_no_faces() {
        let mut overlay = Overlay::new(3);
        overlay.resize(64, 48);
        render(&mut overlay, &[], &[]);
        assert_eq!(overlay.box_count(), 0);
        assert!(overlay.commands.is_empty());
    }

    #[test]
    fn test_clear_drops_stale_boxes() {
        let mut overlay = Overlay::new(1);
        render(&mut overlay, &[face(0.0, 30.0)], &[result(true)]);
        overlay.clear();
        assert_eq!(overlay.box_count(), 0);
    }

    #[test]
    fn test_overlay_json_shape() {
        let mut overlay = Overlay::new(7);
        overlay.resize(640, 480);
        render(&mut overlay, &[face(1.0, 30.0)], &[result(false)]);
        let json = serde_json::to_value(&overlay).unwrap();
        assert_eq!(json["cycle"], 7);
        assert_eq!(json["commands"][0]["op"], "stroke_rect");
        assert_eq!(json["commands"][1]["text"], UNKNOWN_LABEL);
    }

    #[test]
    fn test_raster_stroke_and_clear() {
        let mut surface = RasterSurface::new(40, 40);
        surface.stroke_rect(5.0, 5.0, 10.0, 10.0, MATCH_COLOR, 2);
        let img = surface.image();
        assert_eq!(img.get_pixel(5, 5).0, MATCH_COLOR.0);
        assert_eq!(img.get_pixel(14, 14).0, MATCH_COLOR.0);
        assert_eq!(img.get_pixel(6, 6).0, MATCH_COLOR.0);
        assert_eq!(img.get_pixel(10, 10).0, [0, 0, 0, 0]);

        surface.clear();
        assert!(surface.image().pixels().all(|p| p.0[3] == 0));
    }

    #[test]
    fn test_replay_onto_raster_matches_frame_size() {
        let mut overlay = Overlay::new(2);
        overlay.resize(80, 60);
        render(&mut overlay, &[face(30.0, 30.0)], &[result(true)]);

        let mut raster = RasterSurface::new(1, 1);
        overlay.replay(&mut raster);
        assert_eq!(raster.image().dimensions(), (80, 60));
        assert_eq!(raster.image().get_pixel(30, 30).0, MATCH_COLOR.0);
        // Label plate sits above the box.
        assert_eq!(raster.image().get_pixel(31, 20).0, MATCH_COLOR.0);

        let composite = raster.composite_over(&GrayImage::new(80, 60));
        let [r, g, _, a] = composite.get_pixel(30, 30).0;
        assert!(r < 10 && g > 100 && a == 255);
        assert_eq!(composite.get_pixel(50, 50).0, [0, 0, 0, 255]);
    }
}
