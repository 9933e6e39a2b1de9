//! Per-page Markdown assembly from layout cells.
//!
//! Cells are walked in the order the model returned them (reading order).
//! Pictures become inline PNG data URIs cropped from the original page,
//! formulas become `$$` display blocks, everything else passes through
//! trimmed. Blocks are separated by one blank line.

use crate::layout::{Category, LayoutCell};
use crate::pipeline::encode;
use image::RgbImage;
use tracing::debug;

/// Build the page's Markdown.
///
/// With `skip_page_header_footer`, Page-header and Page-footer cells are left
/// out. Cells with no text after trimming contribute nothing.
pub fn assemble(page: &RgbImage, cells: &[LayoutCell], skip_page_header_footer: bool) -> String {
    let mut blocks: Vec<String> = Vec::with_capacity(cells.len());

    for cell in cells {
        if skip_page_header_footer && cell.category.is_page_furniture() {
            continue;
        }
        let block = match cell.category {
            Category::Picture => picture_block(page, cell),
            Category::Formula => formula_block(cell.text.as_deref().unwrap_or_default()),
            _ => {
                let text = cell.text.as_deref().unwrap_or_default().trim();
                (!text.is_empty()).then(|| text.to_string())
            }
        };
        if let Some(b) = block {
            blocks.push(b);
        }
    }

    blocks.join("\n\n")
}

fn picture_block(page: &RgbImage, cell: &LayoutCell) -> Option<String> {
    let crop = encode::crop(page, &cell.bbox)?;
    match encode::png_data_uri(&crop) {
        Ok(uri) => Some(format!("![]({uri})")),
        Err(e) => {
            debug!("Skipping picture at {}: {e}", cell.bbox);
            None
        }
    }
}

/// Wrap LaTeX as a display block, unwrapping an existing `$$…$$` first.
pub fn formula_block(text: &str) -> Option<String> {
    let mut body = text.trim();
    if body.len() >= 4 && body.starts_with("$$") && body.ends_with("$$") {
        body = body[2..body.len() - 2].trim();
    }
    if body.is_empty() {
        return None;
    }
    Some(format!("$$\n{body}\n$$"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BBox;
    use image::Rgb;

    fn cell(category: Category, text: Option<&str>) -> LayoutCell {
        LayoutCell {
            bbox: BBox::new(0, 0, 10, 10),
            category,
            text: text.map(str::to_string),
        }
    }

    fn page() -> RgbImage {
        RgbImage::from_pixel(40, 40, Rgb([200, 10, 10]))
    }

    #[test]
    fn joins_blocks_with_blank_line() {
        let cells = [
            cell(Category::Title, Some("  Hello ")),
            cell(Category::Text, Some("World")),
        ];
        assert_eq!(assemble(&page(), &cells, false), "Hello\n\nWorld");
    }

    #[test]
    fn formula_is_rewrapped() {
        assert_eq!(formula_block("$$ E = mc^2 $$").unwrap(), "$$\nE = mc^2\n$$");
        assert_eq!(formula_block("a+b").unwrap(), "$$\na+b\n$$");
        assert_eq!(formula_block("  "), None);
    }

    #[test]
    fn picture_embeds_crop() {
        let md = assemble(&page(), &[cell(Category::Picture, None)], false);
        assert!(md.starts_with("![](data:image/png;base64,"));
        assert!(md.ends_with(')'));
    }

    #[test]
    fn page_furniture_can_be_skipped() {
        let cells = [
            cell(Category::PageHeader, Some("ACME Corp")),
            cell(Category::Text, Some("Body")),
            cell(Category::PageFooter, Some("3")),
        ];
        assert_eq!(assemble(&page(), &cells, true), "Body");
        assert_eq!(assemble(&page(), &cells, false), "ACME Corp\n\nBody\n\n3");
    }

    #[test]
    fn table_html_passes_through() {
        let html = "<table><tr><td>1</td></tr></table>";
        assert_eq!(assemble(&page(), &[cell(Category::Table, Some(html))], false), html);
    }
}
