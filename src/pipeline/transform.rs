//! Bounding-box mapping between original and normalised pixel spaces.
//!
//! The model only ever sees the normalised image, so boxes going into a
//! prompt are scaled down (or up) into that space, and boxes coming back in a
//! reply are scaled into the original image's space. The forward direction
//! truncates, so the inverse maps a normalised coordinate `k` to the middle
//! of the cell `[k, k + 1)` it came from. A round trip stays within one pixel
//! per coordinate as long as the normaliser keeps at least half of each side,
//! which holds for anything up to four times `max_pixels`.

use crate::error::PipelineError;
use crate::layout::{BBox, LayoutCell};
use crate::pipeline::normalize::SizeBudget;

/// Map boxes given in original-image pixels into a `norm_w`×`norm_h` image.
pub fn to_normalized_space(
    bboxes: &[BBox],
    orig_w: u32,
    orig_h: u32,
    norm_w: u32,
    norm_h: u32,
) -> Result<Vec<BBox>, PipelineError> {
    let (sx, sy) = scales(orig_w, orig_h, norm_w, norm_h)?;
    Ok(bboxes
        .iter()
        .map(|b| {
            let [x1, y1, x2, y2] = b.0;
            BBox([
                (x1 as f64 * sx) as i64,
                (y1 as f64 * sy) as i64,
                (x2 as f64 * sx) as i64,
                (y2 as f64 * sy) as i64,
            ])
        })
        .collect())
}

/// Map reply cells back into original-image pixels, in place.
///
/// `input_w`×`input_h` is the size of the image that was handed to the
/// normaliser; the normalised size is recomputed from it with `budget`.
pub fn to_original_space(
    cells: &mut [LayoutCell],
    orig_w: u32,
    orig_h: u32,
    input_w: u32,
    input_h: u32,
    budget: &SizeBudget,
) -> Result<(), PipelineError> {
    if input_w == 0 || input_h == 0 {
        return Err(PipelineError::DivideByZero {
            width: input_w,
            height: input_h,
        });
    }
    let (norm_h, norm_w) = budget.apply(input_h, input_w)?;
    scales(orig_w, orig_h, norm_w, norm_h)?;
    let (ow, oh, nw, nh) = (
        i64::from(orig_w),
        i64::from(orig_h),
        i64::from(norm_w),
        i64::from(norm_h),
    );

    for cell in cells.iter_mut() {
        let [x1, y1, x2, y2] = cell.bbox.0;
        cell.bbox = BBox([
            back(x1, ow, nw),
            back(y1, oh, nh),
            back(x2, ow, nw),
            back(y2, oh, nh),
        ]);
    }
    Ok(())
}

/// Everything needed to map a page's reply cells back to original pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageGeometry {
    pub orig_w: u32,
    pub orig_h: u32,
    pub input_w: u32,
    pub input_h: u32,
    pub budget: SizeBudget,
}

impl PageGeometry {
    pub fn restore(&self, cells: &mut [LayoutCell]) -> Result<(), PipelineError> {
        to_original_space(
            cells,
            self.orig_w,
            self.orig_h,
            self.input_w,
            self.input_h,
            &self.budget,
        )
    }
}

// floor((k + 0.5) * orig / norm), the centre of the truncation preimage of `k`.
fn back(k: i64, orig: i64, norm: i64) -> i64 {
    ((2 * k + 1) * orig).div_euclid(2 * norm)
}

// normalised / original, per axis.
fn scales(orig_w: u32, orig_h: u32, norm_w: u32, norm_h: u32) -> Result<(f64, f64), PipelineError> {
    if orig_w == 0 || orig_h == 0 || norm_w == 0 || norm_h == 0 {
        return Err(PipelineError::DivideByZero {
            width: orig_w.min(norm_w),
            height: orig_h.min(norm_h),
        });
    }
    Ok((
        f64::from(norm_w) / f64::from(orig_w),
        f64::from(norm_h) / f64::from(orig_h),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Category;
    use proptest::prelude::*;

    fn cell(b: BBox) -> LayoutCell {
        LayoutCell {
            bbox: b,
            category: Category::Text,
            text: None,
        }
    }

    #[test]
    fn title_box_maps_into_812x588() {
        let budget = SizeBudget::default();
        let (nh, nw) = budget.apply(600, 800).unwrap();
        let fwd = to_normalized_space(&[BBox::new(0, 0, 100, 40)], 800, 600, nw, nh).unwrap();
        assert_eq!(fwd[0], BBox::new(0, 0, 101, 39));

        let mut cells = vec![cell(fwd[0])];
        to_original_space(&mut cells, 800, 600, 800, 600, &budget).unwrap();
        assert_eq!(cells[0].bbox, BBox::new(0, 0, 100, 40));
    }

    #[test]
    fn shrunk_image_round_trips_within_one_pixel() {
        let budget = SizeBudget::default();
        let (nh, nw) = budget.apply(4500, 6000).unwrap();
        assert_eq!((nw, nh), (3864, 2884));

        let original = BBox::new(45, 45, 5999, 4499);
        let fwd = to_normalized_space(&[original], 6000, 4500, nw, nh).unwrap();
        assert_eq!(fwd[0].0[0], 28);

        let mut cells = vec![cell(fwd[0])];
        to_original_space(&mut cells, 6000, 4500, 6000, 4500, &budget).unwrap();
        for (a, b) in original.0.iter().zip(cells[0].bbox.0.iter()) {
            assert!((a - b).abs() <= 1, "{:?} -> {:?}", original, cells[0].bbox);
        }
    }

    #[test]
    fn degenerate_sizes_fail() {
        assert!(matches!(
            to_normalized_space(&[BBox::new(0, 0, 1, 1)], 0, 10, 28, 28),
            Err(PipelineError::DivideByZero { .. })
        ));
        let mut cells = vec![cell(BBox::new(0, 0, 1, 1))];
        assert!(matches!(
            to_original_space(&mut cells, 10, 10, 0, 10, &SizeBudget::default()),
            Err(PipelineError::DivideByZero { .. })
        ));
    }

    #[test]
    fn empty_cell_list_is_fine() {
        let mut cells: Vec<LayoutCell> = Vec::new();
        to_original_space(&mut cells, 800, 600, 800, 600, &SizeBudget::default()).unwrap();
    }

    proptest! {
        #[test]
        fn round_trip_within_one_pixel(
            w in 300u32..8000,
            h in 300u32..8000,
            fx1 in 0.0f64..1.0,
            fy1 in 0.0f64..1.0,
            fx2 in 0.0f64..1.0,
            fy2 in 0.0f64..1.0,
        ) {
            let budget = SizeBudget::default();
            let (nh, nw) = budget.apply(h, w).unwrap();
            // Below half scale one normalised pixel covers more than two originals.
            prop_assume!(nw * 2 >= w && nh * 2 >= h);
            let px = |f: f64, side: u32| (f * f64::from(side)) as i64;
            let original = BBox::new(px(fx1, w), px(fy1, h), px(fx2, w), px(fy2, h));

            let fwd = to_normalized_space(&[original], w, h, nw, nh).unwrap();
            let mut cells = vec![cell(fwd[0])];
            to_original_space(&mut cells, w, h, w, h, &budget).unwrap();

            for (a, b) in original.0.iter().zip(cells[0].bbox.0.iter()) {
                prop_assert!((a - b).abs() <= 1, "{:?} -> {:?}", original, cells[0].bbox);
            }
        }
    }
}
