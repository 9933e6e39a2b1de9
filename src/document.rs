//! Combined-document rendering: Markdown → DOCX, plus the ZIP bundle.
//!
//! Only the Markdown the pipeline itself produces has to be understood, so
//! the converter works line by line:
//!
//! | Line | DOCX |
//! |------|------|
//! | `#`…`#########` heading | `Heading1`…`Heading9` paragraph |
//! | `![](data:image/…;base64,…)` | embedded picture, 5 in wide (`[Image]` if undecodable) |
//! | `$$` … `$$` block | one `Formula` paragraph, verbatim |
//! | anything else | plain paragraph, `**bold**` / `*italic*` markers stripped |
//!
//! Blank lines are dropped.

use crate::aggregate::ArtifactPaths;
use crate::error::PipelineError;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use docx_rs::{Docx, Paragraph, Pic, Run, Style, StyleType};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

static IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"!\[[^\]]*\]\((data:image/[^;]+;base64,([^)]+))\)").expect("valid regex")
});
static BOLD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*\*(.+?)\*\*").expect("valid regex"));
static ITALIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\*(.+?)\*").expect("valid regex"));

/// EMU per inch.
const EMU_PER_INCH: u32 = 914_400;
/// Embedded picture width.
const PICTURE_WIDTH_EMU: u32 = 5 * EMU_PER_INCH;

/// Turns the combined Markdown into a binary document.
pub trait DocumentRenderer: Send + Sync {
    /// Write the rendered document to `path`.
    fn render(&self, markdown: &str, path: &Path) -> Result<(), PipelineError>;
}

/// [`DocumentRenderer`] producing Office Open XML via `docx-rs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocxRenderer;

/// One rendered unit of the Markdown.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Heading { level: usize, text: String },
    /// Decoded image bytes.
    Image(Vec<u8>),
    /// A data-URI line whose payload did not decode.
    BrokenImage,
    Formula(String),
    Paragraph(String),
}

/// Classify Markdown lines into [`Block`]s.
pub fn parse_blocks(markdown: &str) -> Vec<Block> {
    let lines: Vec<&str> = markdown.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i].trim();
        i += 1;
        if line.is_empty() {
            continue;
        }

        if line.starts_with('#') {
            let level = line.len() - line.trim_start_matches('#').len();
            blocks.push(Block::Heading {
                level: level.min(9),
                text: line.trim_start_matches('#').trim().to_string(),
            });
        } else if line.starts_with("![") && line.contains("](data:image/") {
            let decoded = IMAGE_RE
                .captures(line)
                .and_then(|c| c.get(2))
                .and_then(|m| STANDARD.decode(m.as_str()).ok());
            blocks.push(match decoded {
                Some(bytes) => Block::Image(bytes),
                None => Block::BrokenImage,
            });
        } else if line.starts_with("$$") {
            // A one-line `$$ x $$` closes itself; otherwise read to the closer.
            let mut formula = vec![line.to_string()];
            let closed_inline = line.len() >= 4 && line.ends_with("$$");
            if !closed_inline {
                while i < lines.len() {
                    let next = lines[i];
                    i += 1;
                    formula.push(next.to_string());
                    if next.trim().ends_with("$$") {
                        break;
                    }
                }
            }
            blocks.push(Block::Formula(formula.join("\n")));
        } else {
            let text = BOLD_RE.replace_all(line, "$1");
            let text = ITALIC_RE.replace_all(&text, "$1");
            blocks.push(Block::Paragraph(text.into_owned()));
        }
    }
    blocks
}

impl DocxRenderer {
    fn build(&self, markdown: &str) -> Docx {
        let mut docx = Docx::new().add_style(
            Style::new("Formula", StyleType::Paragraph)
                .name("Intense Quote")
                .italic(),
        );
        for level in 1..=9usize {
            docx = docx.add_style(
                Style::new(&format!("Heading{level}"), StyleType::Paragraph)
                    .name(&format!("Heading {level}"))
                    .size(heading_size(level))
                    .bold(),
            );
        }

        for block in parse_blocks(markdown) {
            let paragraph = match block {
                Block::Heading { level, text } => Paragraph::new()
                    .add_run(Run::new().add_text(text))
                    .style(&format!("Heading{level}")),
                Block::Image(bytes) => picture_paragraph(&bytes),
                Block::BrokenImage => text_paragraph("[Image]"),
                Block::Formula(text) => {
                    let mut run = Run::new();
                    for (n, line) in text.lines().enumerate() {
                        if n > 0 {
                            run = run.add_break(docx_rs::BreakType::TextWrapping);
                        }
                        run = run.add_text(line);
                    }
                    Paragraph::new().add_run(run).style("Formula")
                }
                Block::Paragraph(text) => text_paragraph(&text),
            };
            docx = docx.add_paragraph(paragraph);
        }
        docx
    }
}

impl DocumentRenderer for DocxRenderer {
    fn render(&self, markdown: &str, path: &Path) -> Result<(), PipelineError> {
        let file = File::create(path).map_err(|e| PipelineError::write(path, e))?;
        self.build(markdown)
            .build()
            .pack(file)
            .map_err(|e| PipelineError::Aggregation(format!("DOCX packaging failed: {e}")))?;
        debug!("Wrote {}", path.display());
        Ok(())
    }
}

fn text_paragraph(text: &str) -> Paragraph {
    Paragraph::new().add_run(Run::new().add_text(text))
}

// Half-points: 16pt for level 1 down to 11pt.
fn heading_size(level: usize) -> usize {
    32usize.saturating_sub((level - 1) * 2).max(22)
}

fn picture_paragraph(bytes: &[u8]) -> Paragraph {
    // Pic::new decodes the buffer itself and cannot report failure.
    let Ok(img) = image::load_from_memory(bytes) else {
        warn!("Embedded image did not decode, writing placeholder");
        return text_paragraph("[Image]");
    };
    let (w, h) = (img.width().max(1), img.height().max(1));
    let height_emu = (u64::from(PICTURE_WIDTH_EMU) * u64::from(h) / u64::from(w)) as u32;
    let pic = Pic::new(bytes).size(PICTURE_WIDTH_EMU, height_emu);
    Paragraph::new().add_run(Run::new().add_image(pic))
}

// ── ZIP bundle ───────────────────────────────────────────────────────────

/// Pack the job's DOCX, combined Markdown and combined JSON into one ZIP.
///
/// Missing inputs are skipped. Returns the ZIP path.
pub fn bundle(paths: &ArtifactPaths) -> Result<PathBuf, PipelineError> {
    let zip_path = paths.zip();
    let file = File::create(&zip_path).map_err(|e| PipelineError::write(&zip_path, e))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let sources = [paths.docx(), paths.combined_md(), paths.combined_json()];
    for (source, entry) in sources.iter().zip(paths.bundle_entries()) {
        let mut buf = Vec::new();
        match File::open(source) {
            Ok(mut f) => f
                .read_to_end(&mut buf)
                .map_err(|e| PipelineError::Aggregation(format!("{}: {e}", source.display())))?,
            Err(_) => {
                debug!("Bundle: {} missing, skipped", source.display());
                continue;
            }
        };
        zip.start_file(entry, options)
            .map_err(|e| PipelineError::Aggregation(format!("ZIP entry failed: {e}")))?;
        zip.write_all(&buf)
            .map_err(|e| PipelineError::write(&zip_path, e))?;
    }

    zip.finish()
        .map_err(|e| PipelineError::Aggregation(format!("ZIP finalisation failed: {e}")))?;
    Ok(zip_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::encode;
    use image::{Rgb, RgbImage};

    #[test]
    fn headings_and_paragraphs() {
        let blocks = parse_blocks("# Page 1\n\n## Intro\n\nSome **bold** and *italic* text\n");
        assert_eq!(
            blocks,
            vec![
                Block::Heading {
                    level: 1,
                    text: "Page 1".into()
                },
                Block::Heading {
                    level: 2,
                    text: "Intro".into()
                },
                Block::Paragraph("Some bold and italic text".into()),
            ]
        );
    }

    #[test]
    fn formula_block_spans_lines() {
        let blocks = parse_blocks("$$\nE = mc^2\n$$\nafter");
        assert_eq!(
            blocks,
            vec![
                Block::Formula("$$\nE = mc^2\n$$".into()),
                Block::Paragraph("after".into())
            ]
        );
    }

    #[test]
    fn data_uri_image_is_decoded() {
        let uri = encode::png_data_uri(&RgbImage::from_pixel(4, 2, Rgb([0, 0, 0]))).unwrap();
        let blocks = parse_blocks(&format!("![]({uri})"));
        assert!(matches!(&blocks[0], Block::Image(bytes) if bytes.starts_with(b"\x89PNG")));
        assert_eq!(
            parse_blocks("![](data:image/png;base64,@@@)"),
            vec![Block::BrokenImage]
        );
    }

    #[test]
    fn docx_and_bundle_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ArtifactPaths::new(dir.path(), "doc", "abcd1234");
        std::fs::create_dir_all(&paths.work_dir).unwrap();

        let uri = encode::png_data_uri(&RgbImage::from_pixel(8, 8, Rgb([9, 9, 9]))).unwrap();
        let md = format!("# Page 1\n\nHello\n\n![]({uri})\n\n$$\nx^2\n$$");
        std::fs::write(paths.combined_md(), &md).unwrap();
        std::fs::write(paths.combined_json(), "[]").unwrap();
        DocxRenderer.render(&md, &paths.docx()).unwrap();

        let zip_path = bundle(&paths).unwrap();
        let mut archive = zip::ZipArchive::new(File::open(zip_path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["doc_abcd1234.docx", "doc_abcd1234.json", "doc_abcd1234.md"]);
        let mut md_entry = String::new();
        archive
            .by_name("doc_abcd1234.md")
            .unwrap()
            .read_to_string(&mut md_entry)
            .unwrap();
        assert_eq!(md_entry, md);
    }
}
