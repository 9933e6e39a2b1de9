//! Annotated layout image: every cell's box filled in its category colour at
//! 30 % opacity, outlined, and labelled `{index}_{category}`.
//!
//! Labels need a TrueType/OpenType font. One is loaded from the configured
//! path or from well-known system locations; when none is found the boxes are
//! still drawn and the labels are skipped.

use crate::layout::LayoutCell;
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use tracing::{debug, info, warn};

/// Fill opacity in percent.
const FILL_OPACITY: u16 = 30;
const LABEL_SCALE: f32 = 20.0;

const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Font for cell labels, if one could be loaded.
pub struct LabelFont(Option<FontVec>);

impl LabelFont {
    /// Load `preferred`, falling back to system fonts.
    pub fn load(preferred: Option<&Path>) -> Self {
        if let Some(path) = preferred {
            match std::fs::read(path).map(FontVec::try_from_vec) {
                Ok(Ok(font)) => return LabelFont(Some(font)),
                _ => warn!("Could not load label font {}, trying system fonts", path.display()),
            }
        }
        for path in SYSTEM_FONTS {
            if let Ok(Ok(font)) = std::fs::read(path).map(FontVec::try_from_vec) {
                info!("Loaded label font: {}", path);
                return LabelFont(Some(font));
            }
        }
        debug!("No label font found, cell labels will be skipped");
        LabelFont(None)
    }

    /// No labels at all.
    pub fn none() -> Self {
        LabelFont(None)
    }

    pub fn is_available(&self) -> bool {
        self.0.is_some()
    }
}

/// Draw `cells` onto a copy of `page`.
pub fn draw_layout(page: &RgbImage, cells: &[LayoutCell], font: &LabelFont) -> RgbImage {
    let mut out = page.clone();
    let (w, h) = out.dimensions();

    for (i, cell) in cells.iter().enumerate() {
        let Some((x, y, cw, ch)) = cell.bbox.clamped_rect(w, h) else {
            continue;
        };
        let color = cell.category.color();
        fill_translucent(&mut out, x, y, cw, ch, color);
        draw_hollow_rect_mut(&mut out, Rect::at(x as i32, y as i32).of_size(cw, ch), Rgb(color));

        if let Some(ref f) = font.0 {
            let label = format!("{i}_{}", cell.category);
            let lx = (x + cw).min(w.saturating_sub(1)) as i32;
            draw_text_mut(&mut out, Rgb(color), lx, y as i32, PxScale::from(LABEL_SCALE), f, &label);
        }
    }
    out
}

fn fill_translucent(img: &mut RgbImage, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
    for py in y..y + h {
        for px in x..x + w {
            let p = img.get_pixel_mut(px, py);
            for c in 0..3 {
                let under = u16::from(p[c]) * (100 - FILL_OPACITY);
                let over = u16::from(color[c]) * FILL_OPACITY;
                p[c] = ((under + over + 50) / 100) as u8;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BBox, Category};

    fn cell(b: BBox, category: Category) -> LayoutCell {
        LayoutCell {
            bbox: b,
            category,
            text: None,
        }
    }

    #[test]
    fn fills_box_in_category_colour() {
        let page = RgbImage::from_pixel(100, 100, Rgb([255, 255, 255]));
        let out = draw_layout(&page, &[cell(BBox::new(10, 10, 50, 50), Category::Title)], &LabelFont::none());

        // Interior: white blended 30 % toward red.
        assert_eq!(out.get_pixel(30, 30), &Rgb([255, 179, 179]));
        // Outline is solid.
        assert_eq!(out.get_pixel(10, 30), &Rgb([255, 0, 0]));
        // Outside untouched.
        assert_eq!(out.get_pixel(80, 80), &Rgb([255, 255, 255]));
    }

    #[test]
    fn out_of_bounds_cells_are_skipped() {
        let page = RgbImage::from_pixel(20, 20, Rgb([0, 0, 0]));
        let out = draw_layout(&page, &[cell(BBox::new(40, 40, 60, 60), Category::Text)], &LabelFont::none());
        assert_eq!(out, page);
    }

    #[test]
    fn missing_font_path_falls_back_quietly() {
        // Whatever the host has installed, loading never panics.
        let font = LabelFont::load(Some(Path::new("/definitely/missing.ttf")));
        let page = RgbImage::from_pixel(200, 60, Rgb([255, 255, 255]));
        let out = draw_layout(&page, &[cell(BBox::new(0, 0, 100, 40), Category::Caption)], &font);
        assert_eq!(out.dimensions(), (200, 60));
    }
}
