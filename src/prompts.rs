//! Instruction text sent with each page image.
//!
//! Centralising every prompt here keeps the per-mode wording in one place and
//! lets unit tests inspect the exact text without a live model.

use crate::config::PromptMode;
use crate::layout::BBox;

/// Placeholder tokens the recognition model expects ahead of the text part.
pub const IMAGE_PLACEHOLDER: &str = "<|img|><|imgpad|><|endofimg|>";

/// Full layout: bbox, category and text for every element.
pub const LAYOUT_ALL_PROMPT: &str = r#"Please output the layout information from the PDF image, including each layout element's bbox, its category, and the corresponding text content within the bbox.

1. Bbox format: [x1, y1, x2, y2]

2. Layout Categories: The possible categories are ['Caption', 'Footnote', 'Formula', 'List-item', 'Page-footer', 'Page-header', 'Picture', 'Section-header', 'Table', 'Text', 'Title'].

3. Text Extraction & Formatting Rules:
    - Picture: For the 'Picture' category, the text field should be omitted.
    - Formula: Format its text as LaTeX.
    - Table: Format its text as HTML.
    - All Others (Text, Title, etc.): Format their text as Markdown.

4. Constraints:
    - The output text must be the original text from the image, with no translation.
    - All layout elements must be sorted according to human reading order.

5. Final Output: The entire output must be a single JSON object.
"#;

/// Layout detection without text.
pub const LAYOUT_ONLY_PROMPT: &str = "Please output the layout information from this PDF image, including each layout's bbox and its category. The bbox should be in the format [x1, y1, x2, y2]. The layout categories for the PDF document include ['Caption', 'Footnote', 'Formula', 'List-item', 'Page-footer', 'Page-header', 'Picture', 'Section-header', 'Table', 'Text', 'Title']. Do not output the corresponding text. The layout result should be in JSON format.";

/// Plain text extraction.
pub const OCR_PROMPT: &str = "Extract the text content from this image.";

/// Text inside a region; the bbox literal is appended by [`build_prompt`].
pub const GROUNDING_OCR_PROMPT: &str =
    "Extract text from the given bounding box on the image (format: [x1, y1, x2, y2]).\nBounding Box:\n";

/// Base instruction for `mode`.
pub fn instruction(mode: PromptMode) -> &'static str {
    match mode {
        PromptMode::LayoutAll => LAYOUT_ALL_PROMPT,
        PromptMode::LayoutOnly => LAYOUT_ONLY_PROMPT,
        PromptMode::Ocr => OCR_PROMPT,
        PromptMode::GroundingOcr => GROUNDING_OCR_PROMPT,
    }
}

/// Build the instruction for one page.
///
/// `region` must already be in the normalised image's pixel space; it is
/// only used in grounding mode.
pub fn build_prompt(mode: PromptMode, region: Option<BBox>) -> String {
    let mut prompt = instruction(mode).to_string();
    if let (PromptMode::GroundingOcr, Some(bbox)) = (mode, region) {
        prompt.push_str(&bbox.to_string());
    }
    prompt
}

/// Prefix the placeholder tokens to a prompt, as sent on the wire.
pub fn with_image_placeholder(prompt: &str) -> String {
    format!("{IMAGE_PLACEHOLDER}{prompt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grounding_appends_region_literal() {
        let p = build_prompt(PromptMode::GroundingOcr, Some(BBox::new(10, 20, 30, 40)));
        assert!(p.ends_with("Bounding Box:\n[10, 20, 30, 40]"));
    }

    #[test]
    fn region_ignored_outside_grounding() {
        let p = build_prompt(PromptMode::LayoutAll, Some(BBox::new(1, 2, 3, 4)));
        assert_eq!(p, LAYOUT_ALL_PROMPT);
    }

    #[test]
    fn layout_prompts_name_every_category() {
        for name in ["Caption", "List-item", "Page-footer", "Section-header", "Title"] {
            assert!(LAYOUT_ALL_PROMPT.contains(name));
            assert!(LAYOUT_ONLY_PROMPT.contains(name));
        }
    }

    #[test]
    fn placeholder_prefix() {
        assert_eq!(
            with_image_placeholder(OCR_PROMPT),
            "<|img|><|imgpad|><|endofimg|>Extract the text content from this image."
        );
    }
}
