//! PDF rasterisation: render pages to RGB images via pdfium.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and blocks for the whole render. `tokio::task::spawn_blocking` moves
//! the work onto the blocking pool so runtime worker threads keep polling
//! inference futures meanwhile.
//!
//! ## Why fall back to 72 DPI?
//!
//! Page sizes vary wildly: an A0 poster at 200 DPI is over 9 000 px tall.
//! When a page would exceed `max_side` pixels on either side it is rendered
//! again at 72 DPI (one pixel per point) instead of failing the job.

use crate::error::PipelineError;
use crate::pipeline::encode;
use async_trait::async_trait;
use image::RgbImage;
use pdfium_render::prelude::*;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// PDF points per inch.
const POINTS_PER_INCH: f32 = 72.0;

/// Renders document pages to RGB rasters.
///
/// Implementations must return one image per requested page, in page order.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Render pages of `path` at `dpi`. `pages` is a 0-based range; `None`
    /// means every page.
    async fn rasterize(
        &self,
        path: &Path,
        dpi: u32,
        pages: Option<Range<usize>>,
    ) -> Result<Vec<RgbImage>, PipelineError>;
}

/// [`Rasterizer`] backed by a dynamically loaded pdfium library.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    max_side: u32,
    library_path: Option<PathBuf>,
}

impl PdfiumRasterizer {
    pub fn new(max_side: u32) -> Self {
        Self {
            max_side,
            library_path: None,
        }
    }

    /// Load pdfium from an explicit library file instead of the search order.
    pub fn with_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(path.into());
        self
    }
}

#[async_trait]
impl Rasterizer for PdfiumRasterizer {
    async fn rasterize(
        &self,
        path: &Path,
        dpi: u32,
        pages: Option<Range<usize>>,
    ) -> Result<Vec<RgbImage>, PipelineError> {
        let path = path.to_path_buf();
        let max_side = self.max_side;
        let library = self.library_path.clone();

        tokio::task::spawn_blocking(move || {
            let pdfium = load_pdfium(library.as_deref())?;
            render_pages_blocking(&pdfium, &path, dpi, max_side, pages)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("Render task panicked: {e}")))?
    }
}

/// Bind to pdfium.
///
/// Discovery order:
/// 1. explicit `library` path
/// 2. `PDFIUM_DYNAMIC_LIB_PATH` env var
/// 3. alongside the running executable
/// 4. system library search paths
fn load_pdfium(library: Option<&Path>) -> Result<Pdfium, PipelineError> {
    let explicit = library
        .map(|p| p.to_string_lossy().into_owned())
        .or_else(|| std::env::var("PDFIUM_DYNAMIC_LIB_PATH").ok());
    if let Some(path) = explicit {
        debug!(path = %path, "Loading pdfium from explicit path");
        let bindings = Pdfium::bind_to_library(&path)
            .map_err(|e| PipelineError::PdfiumBindingFailed(format!("{path}: {e}")))?;
        return Ok(Pdfium::new(bindings));
    }

    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        let lib_path =
            Pdfium::pdfium_platform_library_name_at_path(exe_dir.to_string_lossy().as_ref());
        if let Ok(bindings) = Pdfium::bind_to_library(&lib_path) {
            debug!(dir = %exe_dir.display(), "Loaded pdfium next to executable");
            return Ok(Pdfium::new(bindings));
        }
    }

    let bindings = Pdfium::bind_to_system_library()
        .map_err(|e| PipelineError::PdfiumBindingFailed(e.to_string()))?;
    Ok(Pdfium::new(bindings))
}

fn render_pages_blocking(
    pdfium: &Pdfium,
    path: &Path,
    dpi: u32,
    max_side: u32,
    pages: Option<Range<usize>>,
) -> Result<Vec<RgbImage>, PipelineError> {
    let document = pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| PipelineError::Rasterization {
            detail: format!("{}: {e}", path.display()),
        })?;

    let doc_pages = document.pages();
    let total = doc_pages.len() as usize;
    let range = clamp_range(pages, total);
    info!("PDF loaded: {} pages, rendering {:?}", total, range);

    let mut out = Vec::with_capacity(range.len());
    for idx in range {
        let index = u16::try_from(idx).map_err(|_| PipelineError::Rasterization {
            detail: format!("page index {idx} exceeds pdfium limit"),
        })?;
        let page = doc_pages
            .get(index)
            .map_err(|e| PipelineError::Rasterization {
                detail: format!("page {}: {e}", idx + 1),
            })?;

        let (w_pt, h_pt) = (page.width().value, page.height().value);
        let effective_dpi = effective_dpi(w_pt, h_pt, dpi, max_side);
        if effective_dpi != dpi {
            warn!(
                page = idx + 1,
                dpi,
                max_side,
                "Page exceeds {max_side}px at {dpi} DPI, rendering at 72 DPI"
            );
        }

        let config = PdfRenderConfig::new().scale_page_by_factor(effective_dpi as f32 / POINTS_PER_INCH);
        let bitmap = page
            .render_with_config(&config)
            .map_err(|e| PipelineError::Rasterization {
                detail: format!("page {}: {e}", idx + 1),
            })?;

        let image = encode::to_rgb(&bitmap.as_image());
        debug!(
            "Rendered page {} → {}x{} px",
            idx + 1,
            image.width(),
            image.height()
        );
        out.push(image);
    }
    Ok(out)
}

/// DPI to render at: `dpi`, or 72 when that would exceed `max_side`.
pub fn effective_dpi(width_pt: f32, height_pt: f32, dpi: u32, max_side: u32) -> u32 {
    let scale = dpi as f32 / POINTS_PER_INCH;
    let (w, h) = (width_pt * scale, height_pt * scale);
    if w > max_side as f32 || h > max_side as f32 {
        POINTS_PER_INCH as u32
    } else {
        dpi
    }
}

/// Scale a raster image as if its pixels were points rendered at `dpi`.
///
/// Follows the page fallback: when the scaled image would exceed `max_side`,
/// the image is returned at its own size.
pub fn upscale_image(image: RgbImage, dpi: u32, max_side: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    let dpi = effective_dpi(w as f32, h as f32, dpi, max_side);
    if dpi == POINTS_PER_INCH as u32 {
        return image;
    }
    let scale = dpi as f32 / POINTS_PER_INCH;
    let (sw, sh) = (
        ((w as f32 * scale).round() as u32).max(1),
        ((h as f32 * scale).round() as u32).max(1),
    );
    debug!("Upscaled image {w}x{h} → {sw}x{sh} px at {dpi} DPI");
    encode::resize(&image, sw, sh)
}

fn clamp_range(pages: Option<Range<usize>>, total: usize) -> Range<usize> {
    match pages {
        Some(r) => r.start.min(total)..r.end.min(total),
        None => 0..total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letter_page_keeps_requested_dpi() {
        // 612×792 pt at 200 DPI is 1700×2200 px.
        assert_eq!(effective_dpi(612.0, 792.0, 200, 4500), 200);
    }

    #[test]
    fn poster_falls_back_to_72() {
        // A0 is 2384×3370 pt.
        assert_eq!(effective_dpi(2384.0, 3370.0, 200, 4500), 72);
    }

    #[test]
    fn image_is_upscaled_like_a_page() {
        let img = RgbImage::new(100, 50);
        assert_eq!(upscale_image(img.clone(), 144, 4500).dimensions(), (200, 100));
        assert_eq!(upscale_image(img, 72, 4500).dimensions(), (100, 50));
        let big = RgbImage::new(3000, 1000);
        assert_eq!(upscale_image(big, 200, 4500).dimensions(), (3000, 1000));
    }

    #[test]
    fn range_is_clamped_to_document() {
        assert_eq!(clamp_range(None, 3), 0..3);
        assert_eq!(clamp_range(Some(1..10), 3), 1..3);
        assert_eq!(clamp_range(Some(5..7), 3), 3..3);
    }
}
