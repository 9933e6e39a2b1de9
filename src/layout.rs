//! Layout records produced from model replies.
//!
//! A [`LayoutCell`] is one detected region of a page. Its [`BBox`] is always
//! in exactly one pixel space; the parser hands cells over in normalised
//! space and [`crate::pipeline::transform::to_original_space`] maps them back
//! exactly once.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// `[x1, y1, x2, y2]` in integer pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BBox(pub [i64; 4]);

impl BBox {
    pub fn new(x1: i64, y1: i64, x2: i64, y2: i64) -> Self {
        BBox([x1, y1, x2, y2])
    }

    pub fn x1(&self) -> i64 {
        self.0[0]
    }

    pub fn y1(&self) -> i64 {
        self.0[1]
    }

    pub fn x2(&self) -> i64 {
        self.0[2]
    }

    pub fn y2(&self) -> i64 {
        self.0[3]
    }

    /// Clamp to an image of `width`×`height` and return `(x, y, w, h)`,
    /// or `None` when nothing of the box remains.
    pub fn clamped_rect(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let (w, h) = (i64::from(width), i64::from(height));
        let x1 = self.x1().min(self.x2()).clamp(0, w);
        let x2 = self.x1().max(self.x2()).clamp(0, w);
        let y1 = self.y1().min(self.y2()).clamp(0, h);
        let y2 = self.y1().max(self.y2()).clamp(0, h);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some((x1 as u32, y1 as u32, (x2 - x1) as u32, (y2 - y1) as u32))
    }
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "[{a}, {b}, {c}, {d}]")
    }
}

// Models occasionally emit `12.0` instead of `12`; accept any JSON number
// and truncate toward zero.
impl<'de> Deserialize<'de> for BBox {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = <[f64; 4]>::deserialize(deserializer)?;
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(serde::de::Error::custom("bbox coordinate is not finite"));
        }
        Ok(BBox(raw.map(|v| v as i64)))
    }
}

/// Closed set of layout categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Title,
    Text,
    Table,
    Formula,
    Picture,
    Caption,
    Footnote,
    #[serde(rename = "List-item")]
    ListItem,
    #[serde(rename = "Page-header")]
    PageHeader,
    #[serde(rename = "Page-footer")]
    PageFooter,
    #[serde(rename = "Section-header")]
    SectionHeader,
}

impl Category {
    /// Label drawn on annotated images and used in file listings.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Title => "Title",
            Category::Text => "Text",
            Category::Table => "Table",
            Category::Formula => "Formula",
            Category::Picture => "Picture",
            Category::Caption => "Caption",
            Category::Footnote => "Footnote",
            Category::ListItem => "List-item",
            Category::PageHeader => "Page-header",
            Category::PageFooter => "Page-footer",
            Category::SectionHeader => "Section-header",
        }
    }

    /// Annotation colour.
    pub fn color(self) -> [u8; 3] {
        match self {
            Category::Text | Category::Footnote | Category::PageHeader => [0, 128, 0],
            Category::Picture => [255, 0, 255],
            Category::Caption => [255, 165, 0],
            Category::SectionHeader => [0, 255, 255],
            Category::Formula => [128, 128, 128],
            Category::Table => [255, 192, 203],
            Category::Title => [255, 0, 0],
            Category::ListItem => [0, 0, 255],
            Category::PageFooter => [128, 0, 128],
        }
    }

    pub fn is_page_furniture(self) -> bool {
        matches!(self, Category::PageHeader | Category::PageFooter)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected region of a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutCell {
    pub bbox: BBox,
    pub category: Category,
    /// Absent for Picture cells and in layout-only replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}
