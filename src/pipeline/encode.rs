//! Image helpers: RGB conversion, resizing, cropping and PNG encoding.
//!
//! Every page enters the pipeline as an 8-bit RGB image with any alpha
//! composited onto white, so transparent scans render the way a viewer shows
//! them rather than on black.
//!
//! ## Why PNG for the model?
//! Lossless compression keeps glyph edges crisp. JPEG artefacts on rendered
//! text confuse vision models and degrade recognition at low DPI.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::ImageData;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::io::Cursor;
use tracing::debug;

use crate::layout::BBox;

/// Flatten any image to RGB, compositing alpha onto white.
pub fn to_rgb(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }
    let rgba = img.to_rgba8();
    let mut out = RgbImage::new(rgba.width(), rgba.height());
    for (dst, src) in out.pixels_mut().zip(rgba.pixels()) {
        let a = u16::from(src[3]);
        let blend = |c: u8| ((u16::from(c) * a + 255 * (255 - a) + 127) / 255) as u8;
        *dst = Rgb([blend(src[0]), blend(src[1]), blend(src[2])]);
    }
    out
}

/// Resize to exactly `width`×`height` with bicubic filtering.
pub fn resize(img: &RgbImage, width: u32, height: u32) -> RgbImage {
    if img.width() == width && img.height() == height {
        return img.clone();
    }
    image::imageops::resize(img, width, height, FilterType::CatmullRom)
}

/// Crop the region under `bbox`, clamped to the image. `None` if empty.
pub fn crop(img: &RgbImage, bbox: &BBox) -> Option<RgbImage> {
    let (x, y, w, h) = bbox.clamped_rect(img.width(), img.height())?;
    Some(image::imageops::crop_imm(img, x, y, w, h).to_image())
}

/// Encode as PNG bytes.
pub fn png_bytes(img: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// Encode as a `data:image/png;base64,…` URI.
pub fn png_data_uri(img: &RgbImage) -> Result<String, image::ImageError> {
    let b64 = STANDARD.encode(png_bytes(img)?);
    Ok(format!("data:image/png;base64,{b64}"))
}

/// Encode a normalised page as a base64 PNG ready for the vision API.
///
/// `detail: "high"` keeps OpenAI-style tilers from collapsing the page into a
/// single low-resolution overview tile.
pub fn encode_page(img: &RgbImage) -> Result<ImageData, image::ImageError> {
    let b64 = STANDARD.encode(png_bytes(img)?);
    debug!("Encoded image → {} bytes base64", b64.len());
    Ok(ImageData::new(b64, "image/png").with_detail("high"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn transparent_pixels_become_white() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 0])));
        let rgb = to_rgb(&img);
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([255, 255, 255]));
    }

    #[test]
    fn opaque_pixels_are_unchanged() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([10, 20, 30, 255])));
        assert_eq!(to_rgb(&img).get_pixel(1, 1), &Rgb([10, 20, 30]));
    }

    #[test]
    fn crop_clamps_to_image() {
        let img = RgbImage::from_pixel(50, 40, Rgb([1, 2, 3]));
        let c = crop(&img, &BBox::new(40, 30, 90, 90)).unwrap();
        assert_eq!(c.dimensions(), (10, 10));
        assert!(crop(&img, &BBox::new(60, 0, 70, 10)).is_none());
    }

    #[test]
    fn encode_small_image() {
        let img = RgbImage::from_pixel(10, 10, Rgb([255, 0, 0]));
        let data = encode_page(&img).expect("encode should succeed");
        assert_eq!(data.mime_type, "image/png");
        let decoded = STANDARD.decode(&data.data).expect("valid base64");
        assert_eq!(&decoded[1..4], b"PNG");
    }

    #[test]
    fn data_uri_prefix() {
        let img = RgbImage::from_pixel(3, 3, Rgb([0, 0, 0]));
        assert!(png_data_uri(&img)
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn resize_hits_exact_size() {
        let img = RgbImage::new(100, 50);
        assert_eq!(resize(&img, 56, 28).dimensions(), (56, 28));
    }
}
