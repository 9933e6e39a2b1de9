//! Error types for the doclayout library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`PipelineError`], **fatal**: the job cannot proceed at all (source
//!   cannot be read or rasterised, artifacts cannot be written, merge
//!   failed). Returned as `Err(PipelineError)` from the orchestrator and
//!   recorded as the terminal `error` of the job's progress snapshot.
//!
//! * [`PageError`], **non-fatal**: a single page could not be recognised
//!   (inference timeout, unparseable reply, unsupported aspect ratio). Stored
//!   inside [`crate::pipeline::page::PageResult`]; the page degrades to raw
//!   text and the job keeps going.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the doclayout library.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Geometry errors ───────────────────────────────────────────────────
    /// Image is too elongated to normalise.
    #[error("Aspect ratio too high: {height}x{width} exceeds 200:1")]
    AspectRatio { height: u32, width: u32 },

    /// A coordinate transform was given a zero-sized image.
    #[error("Cannot scale coordinates: degenerate size {width}x{height}")]
    DivideByZero { width: u32, height: u32 },

    // ── Input errors ──────────────────────────────────────────────────────
    /// The input string is not a usable source.
    #[error("Invalid input '{input}': {reason}")]
    InvalidInput { input: String, reason: String },

    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'")]
    FileNotFound { path: PathBuf },

    /// Source is neither a PDF nor a supported raster image.
    #[error("Unsupported file type '{extension}' for '{path}'")]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'")]
    DownloadTimeout { url: String, secs: u64 },

    /// Raster image bytes could not be decoded.
    #[error("Failed to decode image: {0}")]
    ImageDecode(String),

    // ── Rasterisation errors ──────────────────────────────────────────────
    /// The source document could not be rendered to page images.
    #[error("Rasterisation failed: {detail}")]
    Rasterization { detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_DYNAMIC_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Inference errors ──────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("Vision provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Assembly errors ───────────────────────────────────────────────────
    /// Merging page artifacts or rendering the combined document failed.
    #[error("Assembly failed: {0}")]
    Aggregation(String),

    /// Could not create or write an artifact file.
    #[error("Failed to write artifact '{path}': {source}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config / job errors ───────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A job with the same content hash is still being processed.
    #[error("Job {hash_id} is already running")]
    JobAlreadyRunning { hash_id: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Shorthand for [`PipelineError::ArtifactWrite`].
    pub(crate) fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::ArtifactWrite {
            path: path.into(),
            source,
        }
    }
}

/// A non-fatal error for a single page.
///
/// The page is kept in the output with `filtered = true` and this error's
/// text (or the model's raw reply) as its content. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The page image could not be normalised (aspect ratio out of range).
    #[error("Page {page}: normalisation failed: {detail}")]
    Normalization { page: usize, detail: String },

    /// The inference call failed after all retries.
    #[error("Page {page}: inference failed after {retries} retries: {detail}")]
    Inference {
        page: usize,
        retries: u32,
        detail: String,
    },

    /// The inference call timed out.
    #[error("Page {page}: inference timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// The model replied, but not with a usable layout.
    #[error("Page {page}: model output is not a valid layout")]
    OutputParse { page: usize },
}
