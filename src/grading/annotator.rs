//! Draws grading marks on each page's source image: a green check beside
//! correct answers, a red ellipse around incorrect ones, an orange
//! rectangle for unanswered slots.
//!
//! `imageproc` has no precedent in the host application itself; this
//! module's drawing primitives are grounded in the sibling pack repo's
//! visualization bridge, which draws hollow rectangles over a page render
//! using the same crate.

use image::{DynamicImage, ImageOutputFormat, Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_ellipse_mut, draw_hollow_ellipse_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use super::error::{GradingError, Outcome};
use super::types::{GradedItem, Page};

const CORRECT_COLOR: Rgba<u8> = Rgba([0x07, 0xA8, 0x6C, 0xFF]);
const INCORRECT_COLOR: Rgba<u8> = Rgba([0xE5, 0x48, 0x4D, 0xFF]);
const UNANSWERED_COLOR: Rgba<u8> = Rgba([0xF5, 0x9E, 0x0B, 0xFF]);

pub struct Annotator {
    pub jpeg_quality: u8,
}

impl Annotator {
    pub fn new(jpeg_quality: u8) -> Self {
        Self { jpeg_quality }
    }

    /// Draws every item belonging to `page` onto a copy of that page's
    /// normalized bytes, in ascending `position` order so later marks
    /// overlay earlier ones, and re-encodes at the same JPEG quality as
    /// preprocessing.
    pub fn annotate_page(&self, page: &Page, items: &[&GradedItem]) -> Outcome<Vec<u8>> {
        let decoded = image::load_from_memory(&page.normalized_bytes)
            .map_err(|e| GradingError::InvalidImage(e.to_string()))?;
        let mut canvas: RgbaImage = decoded.to_rgba8();

        let mut ordered: Vec<&&GradedItem> = items.iter().collect();
        ordered.sort_by_key(|item| item.position);

        for item in ordered {
            draw_mark(&mut canvas, item);
        }

        let mut bytes = Vec::new();
        let mut cursor = std::io::Cursor::new(&mut bytes);
        DynamicImage::ImageRgba8(canvas)
            .write_to(&mut cursor, ImageOutputFormat::Jpeg(self.jpeg_quality))
            .map_err(|e| GradingError::InvalidImage(e.to_string()))?;
        Ok(bytes)
    }
}

fn draw_mark(canvas: &mut RgbaImage, item: &GradedItem) {
    let has_answer = !item.llm_text.trim().is_empty();
    let [x1, y1, x2, y2] = item.bbox;

    if item.is_correct && has_answer {
        draw_check(canvas, x1, y1, x2, y2);
    } else if !item.is_correct && has_answer {
        draw_incorrect_ellipse(canvas, x1, y1, x2, y2);
    } else {
        draw_unanswered_rect(canvas, x1, y1, x2, y2);
    }
}

/// Green check: three-point polyline `(x, y+0.55s) → (x+0.35s, y+s) →
/// (x+s, y)` anchored at `(x2+8, y1-6)`, size `s = clip(bbox_height*0.8, 30,
/// 50)`, stroke width 6.
fn draw_check(canvas: &mut RgbaImage, _x1: f32, y1: f32, x2: f32, y2: f32) {
    let bbox_height = y2 - y1;
    let s = (bbox_height * 0.8).clamp(30.0, 50.0);
    let x = x2 + 8.0;
    let y = y1 - 6.0;

    let p0 = (x, y + 0.55 * s);
    let p1 = (x + 0.35 * s, y + s);
    let p2 = (x + s, y);

    draw_thick_line(canvas, p0, p1, 6, CORRECT_COLOR);
    draw_thick_line(canvas, p1, p2, 6, CORRECT_COLOR);
}

/// Red ellipse centered on the bbox center, axes `bbox_w/2+6, bbox_h/2+6`,
/// stroke width 6.
fn draw_incorrect_ellipse(canvas: &mut RgbaImage, x1: f32, y1: f32, x2: f32, y2: f32) {
    let center = (((x1 + x2) / 2.0) as i32, ((y1 + y2) / 2.0) as i32);
    let rx = ((x2 - x1) / 2.0 + 6.0).max(1.0) as i32;
    let ry = ((y2 - y1) / 2.0 + 6.0).max(1.0) as i32;
    draw_thick_ellipse(canvas, center, rx, ry, 6, INCORRECT_COLOR);
}

/// Orange rectangle exactly at the bbox, stroke width 4.
fn draw_unanswered_rect(canvas: &mut RgbaImage, x1: f32, y1: f32, x2: f32, y2: f32) {
    let w = (x2 - x1).max(1.0) as u32;
    let h = (y2 - y1).max(1.0) as u32;
    let rect = Rect::at(x1 as i32, y1 as i32).of_size(w, h);
    draw_thick_rect(canvas, rect, 4, UNANSWERED_COLOR);
}

/// `imageproc`'s line/rect/ellipse primitives are 1px; thickness is
/// approximated the way hand-rolled vector renderers commonly do it over
/// this crate — nested/offset redraws at each pixel of stroke width.
fn draw_thick_line(canvas: &mut RgbaImage, p0: (f32, f32), p1: (f32, f32), width: i32, color: Rgba<u8>) {
    let dx = p1.0 - p0.0;
    let dy = p1.1 - p0.1;
    let len = (dx * dx + dy * dy).sqrt().max(1.0);
    // unit normal to the segment, used to offset parallel copies
    let nx = -dy / len;
    let ny = dx / len;

    let half = width / 2;
    for offset in -half..=half {
        let ox = nx * offset as f32;
        let oy = ny * offset as f32;
        imageproc::drawing::draw_line_segment_mut(
            canvas,
            (p0.0 + ox, p0.1 + oy),
            (p1.0 + ox, p1.1 + oy),
            color,
        );
    }
}

fn draw_thick_rect(canvas: &mut RgbaImage, rect: Rect, width: i32, color: Rgba<u8>) {
    for offset in 0..width {
        if rect.width() <= (offset * 2) as u32 || rect.height() <= (offset * 2) as u32 {
            break;
        }
        let inset = Rect::at(rect.left() + offset, rect.top() + offset)
            .of_size(rect.width() - (offset * 2) as u32, rect.height() - (offset * 2) as u32);
        draw_hollow_rect_mut(canvas, inset, color);
    }
}

fn draw_thick_ellipse(canvas: &mut RgbaImage, center: (i32, i32), rx: i32, ry: i32, width: i32, color: Rgba<u8>) {
    for offset in 0..width {
        let this_rx = rx - offset;
        let this_ry = ry - offset;
        if this_rx <= 0 || this_ry <= 0 {
            break;
        }
        draw_hollow_ellipse_mut(canvas, center, this_rx, this_ry, color);
    }
    // ensures a visible mark even when the computed radii collapse to zero
    if rx <= 0 || ry <= 0 {
        draw_filled_ellipse_mut(canvas, center, 2, 2, color);
    }
}
