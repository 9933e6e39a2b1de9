//! Turn a model reply into layout cells.
//!
//! Replies are supposed to be a bare JSON array of cells, but models
//! regularly wrap it in prose or a ```json fence. Parsing therefore runs in
//! three steps:
//!
//! 1. strict parse of the whole reply;
//! 2. repair: re-parse the slice from the first `{`/`[` to the last `}`/`]`;
//! 3. give up and keep the reply verbatim as a degraded page.
//!
//! Only a JSON *array* of cells counts as a layout. Items that are not
//! cells (an unknown category, a short bbox) are dropped one by one; an array
//! with no usable item, or anything else, degrades the page. It never fails
//! the job.

use crate::config::PromptMode;
use crate::layout::LayoutCell;
use crate::pipeline::transform::PageGeometry;
use tracing::{debug, warn};

/// Result of parsing one reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// Unstructured mode; the reply is passed through untouched.
    Raw(String),
    /// Cells already mapped back into original-image pixels.
    Cells(Vec<LayoutCell>),
    /// Structured mode, but no usable layout. Holds the reply verbatim.
    Degraded(String),
}

impl ParseOutcome {
    /// `true` when a structured reply could not be used.
    pub fn filtered(&self) -> bool {
        matches!(self, ParseOutcome::Degraded(_))
    }
}

/// Parse `raw` for `mode`, mapping cells through `geometry`.
pub fn parse(raw: &str, mode: PromptMode, geometry: &PageGeometry) -> ParseOutcome {
    if !mode.is_structured() {
        return ParseOutcome::Raw(raw.to_string());
    }

    let value = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => Some(value),
        Err(_) => repair(raw),
    };
    let Some(serde_json::Value::Array(items)) = value else {
        debug!("Reply holds no JSON array");
        return ParseOutcome::Degraded(raw.to_string());
    };

    match cells_of(items) {
        Some(cells) => restore(cells, raw, geometry),
        None => ParseOutcome::Degraded(raw.to_string()),
    }
}

/// Deserialize array items one by one, dropping those that are not cells.
/// `None` when the array had items but none of them was a cell.
fn cells_of(items: Vec<serde_json::Value>) -> Option<Vec<LayoutCell>> {
    let total = items.len();
    let cells: Vec<LayoutCell> = items
        .into_iter()
        .enumerate()
        .filter_map(|(i, item)| match serde_json::from_value::<LayoutCell>(item) {
            Ok(cell) => Some(cell),
            Err(e) => {
                warn!("Dropping reply item {i}: {e}");
                None
            }
        })
        .collect();
    if cells.is_empty() && total > 0 {
        return None;
    }
    Some(cells)
}

fn restore(mut cells: Vec<LayoutCell>, raw: &str, geometry: &PageGeometry) -> ParseOutcome {
    match geometry.restore(&mut cells) {
        Ok(()) => ParseOutcome::Cells(cells),
        Err(e) => {
            debug!("Could not map reply cells to original space: {e}");
            ParseOutcome::Degraded(raw.to_string())
        }
    }
}

/// Re-parse the outermost bracketed slice of `text`.
///
/// The slice starts at the earliest `{` or `[` and ends at the latest `}` or
/// `]`. A missing opener or closer kind is simply ignored.
pub fn repair(text: &str) -> Option<serde_json::Value> {
    let start = [text.find('{'), text.find('[')].into_iter().flatten().min()?;
    let end = [text.rfind('}'), text.rfind(']')].into_iter().flatten().max()?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
