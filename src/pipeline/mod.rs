//! Per-page pipeline stages.
//!
//! ```text
//! input ──▶ render ──▶ normalize ──▶ inference ──▶ parse ──▶ transform
//!                                                    │
//!                                                    ▼
//!                                     annotate + markdown ──▶ page artifacts
//! ```
//!
//! 1. [`input`]     resolve a path, URL or in-memory image; fingerprint it
//! 2. [`render`]    rasterise PDF pages; pdfium runs in `spawn_blocking`
//! 3. [`normalize`] pick the aligned, pixel-budgeted size sent to the model
//! 4. [`encode`]    RGB conversion, resizing, PNG / data-URI encoding
//! 5. [`inference`] the vision-model call with timeout and optional retry
//! 6. [`parse`]     strict parse, bracket repair, or degrade to raw text
//! 7. [`transform`] map boxes between original and normalized pixel space
//! 8. [`annotate`] and [`markdown`] derive the page image and text
//! 9. [`page`]      ties 3–8 together for one page

pub mod annotate;
pub mod encode;
pub mod inference;
pub mod input;
pub mod markdown;
pub mod normalize;
pub mod page;
pub mod parse;
pub mod render;
pub mod transform;
