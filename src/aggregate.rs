//! Document aggregation: merge ordered per-page artifacts into one combined
//! JSON layout and one combined Markdown document.
//!
//! Pages are read back from disk one at a time, so a large document never has
//! every page's content in memory at once before the merge itself.
//!
//! The combined Markdown names each page with a `# Page N` heading (1-based)
//! and separates pages with a horizontal rule:
//!
//! ```text
//! # Page 1
//!
//! …
//!
//! ---
//!
//! # Page 2
//! …
//! ```

use crate::error::PipelineError;
use crate::layout::LayoutCell;
use crate::pipeline::page::PageResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Separator placed between page sections of the combined Markdown.
pub const PAGE_SEPARATOR: &str = "\n\n---\n\n";

/// One page of the combined JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEntry {
    /// 0-based page index.
    pub page: usize,
    /// Empty for degraded and plain-text pages.
    pub cells: Vec<LayoutCell>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub filtered: bool,
}

/// Output of [`merge`].
#[derive(Debug, Clone, PartialEq)]
pub struct MergedDocument {
    pub pages: Vec<PageEntry>,
    pub markdown: String,
}

/// Merge `pages`, which must already be in source page order.
///
/// A degraded page contributes its raw text under the same heading as a
/// structured page, and no cells.
pub async fn merge(pages: &[PageResult]) -> Result<MergedDocument, PipelineError> {
    let mut entries = Vec::with_capacity(pages.len());
    let mut sections = Vec::with_capacity(pages.len());

    for result in pages {
        let cells = match &result.layout_info_path {
            Some(path) if !result.filtered => read_cells(path).await?,
            _ => Vec::new(),
        };
        let md = read_to_string(&result.md_content_path).await?;
        debug!(
            "Merged page {}: {} cells, {} bytes",
            result.page_no + 1,
            cells.len(),
            md.len()
        );

        entries.push(PageEntry {
            page: result.page_no,
            cells,
            filtered: result.filtered,
        });
        sections.push((result.page_no, md));
    }

    Ok(MergedDocument {
        pages: entries,
        markdown: combine_markdown(&sections),
    })
}

/// Join `(page_no, markdown)` sections under `# Page N` headings.
pub fn combine_markdown(sections: &[(usize, String)]) -> String {
    sections
        .iter()
        .map(|(page_no, md)| format!("# Page {}\n\n{md}", page_no + 1))
        .collect::<Vec<_>>()
        .join(PAGE_SEPARATOR)
}

async fn read_to_string(path: &Path) -> Result<String, PipelineError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PipelineError::Aggregation(format!("{}: {e}", path.display())))
}

async fn read_cells(path: &Path) -> Result<Vec<LayoutCell>, PipelineError> {
    let raw = read_to_string(path).await?;
    serde_json::from_str(&raw)
        .map_err(|e| PipelineError::Aggregation(format!("{}: {e}", path.display())))
}

// ── Artifact naming ──────────────────────────────────────────────────────

/// File locations of one job, all under `<output_dir>/<base>_<hash>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub work_dir: PathBuf,
    pub base: String,
    pub hash_id: String,
}

impl ArtifactPaths {
    pub fn new(output_dir: &Path, base: &str, hash_id: &str) -> Self {
        Self {
            work_dir: output_dir.join(format!("{base}_{hash_id}")),
            base: base.to_string(),
            hash_id: hash_id.to_string(),
        }
    }

    /// Stem for one page's files. Single images have no page suffix.
    pub fn page_stem(&self, page_no: usize, paginated: bool) -> String {
        if paginated {
            format!("{}_page_{page_no}", self.base)
        } else {
            self.base.clone()
        }
    }

    fn stem(&self) -> String {
        format!("{}_{}", self.base, self.hash_id)
    }

    pub fn combined_json(&self) -> PathBuf {
        self.work_dir.join(format!("{}_combined.json", self.stem()))
    }

    pub fn combined_md(&self) -> PathBuf {
        self.work_dir.join(format!("{}_combined.md", self.stem()))
    }

    pub fn docx(&self) -> PathBuf {
        self.work_dir.join(format!("{}.docx", self.stem()))
    }

    pub fn zip(&self) -> PathBuf {
        self.work_dir.join(format!("{}.zip", self.stem()))
    }

    /// One [`PageResult`] per line.
    pub fn results_jsonl(&self) -> PathBuf {
        self.work_dir.join(format!("{}.jsonl", self.base))
    }

    /// Entry names inside the ZIP bundle: docx, md, json.
    pub fn bundle_entries(&self) -> [String; 3] {
        let stem = self.stem();
        [
            format!("{stem}.docx"),
            format!("{stem}.md"),
            format!("{stem}.json"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BBox, Category};

    #[test]
    fn sections_get_headings_and_rules() {
        let md = combine_markdown(&[(0, "Alpha".into()), (1, "Beta".into())]);
        assert_eq!(md, "# Page 1\n\nAlpha\n\n---\n\n# Page 2\n\nBeta");
    }

    #[test]
    fn single_page_has_no_separator() {
        assert_eq!(combine_markdown(&[(0, "Hello".into())]), "# Page 1\n\nHello");
        assert_eq!(combine_markdown(&[]), "");
    }

    #[test]
    fn artifact_names() {
        let p = ArtifactPaths::new(Path::new("/out"), "report", "1a2b3c4d");
        assert_eq!(p.work_dir, PathBuf::from("/out/report_1a2b3c4d"));
        assert_eq!(
            p.combined_json(),
            PathBuf::from("/out/report_1a2b3c4d/report_1a2b3c4d_combined.json")
        );
        assert_eq!(p.zip(), PathBuf::from("/out/report_1a2b3c4d/report_1a2b3c4d.zip"));
        assert_eq!(p.results_jsonl(), PathBuf::from("/out/report_1a2b3c4d/report.jsonl"));
        assert_eq!(p.page_stem(2, true), "report_page_2");
        assert_eq!(p.page_stem(0, false), "report");
    }

    #[tokio::test]
    async fn merge_reads_artifacts_in_given_order() {
        let dir = tempfile::tempdir().unwrap();
        let cells = vec![LayoutCell {
            bbox: BBox::new(0, 0, 10, 10),
            category: Category::Text,
            text: Some("B".into()),
        }];
        let json = dir.path().join("p1.json");
        std::fs::write(&json, serde_json::to_string(&cells).unwrap()).unwrap();
        std::fs::write(dir.path().join("p0.md"), "raw reply").unwrap();
        std::fs::write(dir.path().join("p1.md"), "B").unwrap();

        let pages = vec![
            PageResult {
                page_no: 0,
                input_height: 28,
                input_width: 28,
                layout_info_path: None,
                layout_image_path: None,
                md_content_path: dir.path().join("p0.md"),
                filtered: true,
                error: None,
            },
            PageResult {
                page_no: 1,
                input_height: 28,
                input_width: 28,
                layout_info_path: Some(json),
                layout_image_path: None,
                md_content_path: dir.path().join("p1.md"),
                filtered: false,
                error: None,
            },
        ];

        let merged = merge(&pages).await.unwrap();
        assert_eq!(merged.pages[0].cells.len(), 0);
        assert!(merged.pages[0].filtered);
        assert_eq!(merged.pages[1].cells, cells);
        assert_eq!(merged.markdown, "# Page 1\n\nraw reply\n\n---\n\n# Page 2\n\nB");

        let value = serde_json::to_value(&merged.pages).unwrap();
        assert!(value[1].get("filtered").is_none());
    }

    #[tokio::test]
    async fn missing_page_file_is_an_aggregation_error() {
        let pages = vec![PageResult {
            page_no: 0,
            input_height: 28,
            input_width: 28,
            layout_info_path: None,
            layout_image_path: None,
            md_content_path: PathBuf::from("/no/such/page.md"),
            filtered: false,
            error: None,
        }];
        assert!(matches!(
            merge(&pages).await,
            Err(PipelineError::Aggregation(_))
        ));
    }
}
