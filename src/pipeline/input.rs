//! Input resolution: turn whatever the caller handed us into a PDF path or
//! an RGB page, plus the content hash that names the job.
//!
//! ## Why download to a temp file?
//!
//! pdfium wants a file-system path. Downloading to a `TempDir` gives it one
//! while guaranteeing cleanup when [`ResolvedSource`] is dropped, even if the
//! job fails halfway.
//!
//! ## Why hash the bytes?
//!
//! The first eight hex digits of the SHA-256 over the source bytes name the
//! job's work directory, so resubmitting the same file lands in the same
//! place and concurrent submissions of it can be detected.

use crate::error::PipelineError;
use crate::pipeline::encode;
use image::DynamicImage;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Raster extensions accepted as single-page input.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Where a document comes from. Resolved exactly once per job.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// An already decoded page.
    InMemory { image: DynamicImage, name: String },
    /// A local PDF or raster image.
    FilePath(PathBuf),
    /// An `http(s)://` URL to a PDF or raster image.
    RemoteUrl(String),
}

impl InputSource {
    /// Classify a CLI-style argument as a URL or a local path.
    pub fn parse(input: &str) -> Result<Self, PipelineError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::InvalidInput {
                input: input.to_string(),
                reason: "empty input".into(),
            });
        }
        if is_url(trimmed) {
            Ok(InputSource::RemoteUrl(trimmed.to_string()))
        } else {
            Ok(InputSource::FilePath(PathBuf::from(trimmed)))
        }
    }

    pub fn in_memory(image: DynamicImage, name: impl Into<String>) -> Self {
        InputSource::InMemory {
            image,
            name: name.into(),
        }
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Decoded document content.
pub enum SourceKind {
    /// Multi-page document to rasterise.
    Pdf(PathBuf),
    /// Single page, already RGB.
    Image(image::RgbImage),
}

/// A resolved input, ready for the extract stage.
pub struct ResolvedSource {
    /// Base name (file stem) used in artifact names.
    pub name: String,
    /// First eight hex digits of the SHA-256 of the source bytes.
    pub hash_id: String,
    pub kind: SourceKind,
    // Keeps downloaded files alive until processing completes.
    _temp_dir: Option<TempDir>,
}

impl std::fmt::Debug for ResolvedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            SourceKind::Pdf(p) => format!("Pdf({})", p.display()),
            SourceKind::Image(img) => format!("Image({}x{})", img.width(), img.height()),
        };
        f.debug_struct("ResolvedSource")
            .field("name", &self.name)
            .field("hash_id", &self.hash_id)
            .field("kind", &kind)
            .finish()
    }
}

/// Content fingerprint used as the job key.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

/// Resolve `source` into a PDF path or a decoded page.
pub async fn resolve(
    source: InputSource,
    download_timeout_secs: u64,
) -> Result<ResolvedSource, PipelineError> {
    match source {
        InputSource::InMemory { image, name } => {
            let (rgb, hash_id) = tokio::task::spawn_blocking(move || {
                let rgb = encode::to_rgb(&image);
                let png = encode::png_bytes(&rgb)
                    .map_err(|e| PipelineError::ImageDecode(e.to_string()))?;
                Ok::<_, PipelineError>((rgb, content_hash(&png)))
            })
            .await
            .map_err(|e| PipelineError::Internal(format!("Hash task panicked: {e}")))??;
            Ok(ResolvedSource {
                name: sanitize_name(&name),
                hash_id,
                kind: SourceKind::Image(rgb),
                _temp_dir: None,
            })
        }
        InputSource::FilePath(path) => {
            let bytes = read_local(&path).await?;
            classify(path, bytes, None).await
        }
        InputSource::RemoteUrl(url) => {
            let (path, bytes, temp_dir) = download_url(&url, download_timeout_secs).await?;
            classify(path, bytes, Some(temp_dir)).await
        }
    }
}

async fn read_local(path: &Path) -> Result<Vec<u8>, PipelineError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PipelineError::FileNotFound {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(PipelineError::InvalidInput {
            input: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Decide between PDF and raster by extension, then by content.
async fn classify(
    path: PathBuf,
    bytes: Vec<u8>,
    temp_dir: Option<TempDir>,
) -> Result<ResolvedSource, PipelineError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(sanitize_name)
        .unwrap_or_else(|| "document".to_string());
    let hash_id = content_hash(&bytes);

    if extension == "pdf" || bytes.starts_with(b"%PDF") {
        debug!("Resolved PDF: {}", path.display());
        return Ok(ResolvedSource {
            name,
            hash_id,
            kind: SourceKind::Pdf(path),
            _temp_dir: temp_dir,
        });
    }

    let known_image = IMAGE_EXTENSIONS.contains(&extension.as_str());
    let decoded = tokio::task::spawn_blocking(move || image::load_from_memory(&bytes))
        .await
        .map_err(|e| PipelineError::Internal(format!("Decode task panicked: {e}")))?;

    match decoded {
        Ok(img) => {
            debug!("Resolved image: {} ({}x{})", path.display(), img.width(), img.height());
            Ok(ResolvedSource {
                name,
                hash_id,
                kind: SourceKind::Image(encode::to_rgb(&img)),
                _temp_dir: temp_dir,
            })
        }
        Err(e) if known_image => Err(PipelineError::ImageDecode(e.to_string())),
        Err(_) => Err(PipelineError::UnsupportedFormat { path, extension }),
    }
}

// Keep artifact names to a single path component.
fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' || c.is_control() { '_' } else { c })
        .collect();
    let cleaned = cleaned.trim().trim_matches('.').to_string();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}

/// Download a URL into a temporary directory.
async fn download_url(
    url: &str,
    timeout_secs: u64,
) -> Result<(PathBuf, Vec<u8>, TempDir), PipelineError> {
    info!("Downloading source from: {}", url);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            PipelineError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            PipelineError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    })?;

    if !response.status().is_success() {
        return Err(PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: format!("HTTP {}", response.status()),
        });
    }

    let filename = extract_filename(url);
    let temp_dir = TempDir::new().map_err(|e| PipelineError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);

    let bytes = response
        .bytes()
        .await
        .map_err(|e| PipelineError::DownloadFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?
        .to_vec();

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| PipelineError::write(&file_path, e))?;

    info!("Downloaded to: {}", file_path.display());
    Ok((file_path, bytes, temp_dir))
}

/// Last URL path segment with an extension, else a generic name.
fn extract_filename(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return last.to_string();
                }
            }
        }
    }
    "downloaded".to_string()
}
