//! Size normalisation: pick the resolution a page is sent to the model at.
//!
//! Both output sides are positive multiples of `factor` and their product
//! stays inside `[min_pixels, max_pixels]`. The function is pure so the
//! inverse coordinate transform can recompute the exact same size later
//! instead of storing it.
//!
//! ## Why two passes when growing?
//!
//! Growing a tiny image by `sqrt(min_pixels / area)` and then ceiling each
//! side to the grid can overshoot the pixel ceiling. When it does, the result
//! is shrunk once more with floor rounding, which always lands under it.

use crate::error::PipelineError;

/// Side alignment used by the recognition model's patch grid.
pub const DEFAULT_FACTOR: u32 = 28;

/// Smallest pixel budget accepted (4 × 28 × 28).
pub const DEFAULT_MIN_PIXELS: u64 = 3136;

/// Largest pixel budget accepted (11 289 600 = 14 400 patches of 28 × 28).
pub const DEFAULT_MAX_PIXELS: u64 = 11_289_600;

/// Longest / shortest side ratio beyond which an image is rejected.
pub const MAX_ASPECT_RATIO: f64 = 200.0;

/// Alignment and pixel budget for one normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeBudget {
    pub factor: u32,
    pub min_pixels: u64,
    pub max_pixels: u64,
}

impl Default for SizeBudget {
    fn default() -> Self {
        Self {
            factor: DEFAULT_FACTOR,
            min_pixels: DEFAULT_MIN_PIXELS,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }
}

impl SizeBudget {
    /// [`normalize`] with this budget.
    pub fn apply(&self, height: u32, width: u32) -> Result<(u32, u32), PipelineError> {
        normalize(height, width, self.factor, self.min_pixels, self.max_pixels)
    }
}

/// Compute the normalised `(height, width)` for an image.
///
/// # Errors
/// * [`PipelineError::AspectRatio`] when `max(h, w) / min(h, w) > 200`.
/// * [`PipelineError::DivideByZero`] for a zero-sized side or a zero factor.
pub fn normalize(
    height: u32,
    width: u32,
    factor: u32,
    min_pixels: u64,
    max_pixels: u64,
) -> Result<(u32, u32), PipelineError> {
    if height == 0 || width == 0 || factor == 0 {
        return Err(PipelineError::DivideByZero { width, height });
    }

    let (h, w) = (f64::from(height), f64::from(width));
    if h.max(w) / h.min(w) > MAX_ASPECT_RATIO {
        return Err(PipelineError::AspectRatio { height, width });
    }

    let f = f64::from(factor);
    let (min_p, max_p) = (min_pixels as f64, max_pixels as f64);

    let mut h_bar = round_by_factor(h, f).max(f);
    let mut w_bar = round_by_factor(w, f).max(f);

    if h_bar * w_bar > max_p {
        let beta = (h * w / max_p).sqrt();
        h_bar = floor_by_factor(h / beta, f).max(f);
        w_bar = floor_by_factor(w / beta, f).max(f);
    } else if h_bar * w_bar < min_p {
        let beta = (min_p / (h * w)).sqrt();
        h_bar = ceil_by_factor(h * beta, f);
        w_bar = ceil_by_factor(w * beta, f);

        if h_bar * w_bar > max_p {
            let beta = (h_bar * w_bar / max_p).sqrt();
            h_bar = floor_by_factor(h_bar / beta, f).max(f);
            w_bar = floor_by_factor(w_bar / beta, f).max(f);
        }
    }

    Ok((h_bar as u32, w_bar as u32))
}

// Ties go to the even multiple, matching the reference resizer.
fn round_by_factor(v: f64, f: f64) -> f64 {
    (v / f).round_ties_even() * f
}

fn ceil_by_factor(v: f64, f: f64) -> f64 {
    (v / f).ceil() * f
}

fn floor_by_factor(v: f64, f: f64) -> f64 {
    (v / f).floor() * f
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn norm(h: u32, w: u32) -> Result<(u32, u32), PipelineError> {
        SizeBudget::default().apply(h, w)
    }

    #[test]
    fn in_budget_image_snaps_to_grid() {
        assert_eq!(norm(600, 800).unwrap(), (588, 812));
        assert_eq!(norm(1000, 1000).unwrap(), (1008, 1008));
    }

    #[test]
    fn large_page_shrinks_under_ceiling() {
        let (h, w) = norm(6600, 5100).unwrap();
        assert!(u64::from(h) * u64::from(w) <= DEFAULT_MAX_PIXELS);
        assert_eq!(h % 28, 0);
        assert_eq!(w % 28, 0);
    }

    #[test]
    fn tiny_image_grows_to_floor() {
        assert_eq!(norm(1, 1).unwrap(), (56, 56));
        let (h, w) = norm(20, 30).unwrap();
        assert!(u64::from(h) * u64::from(w) >= DEFAULT_MIN_PIXELS);
    }

    #[test]
    fn growth_overshoot_is_corrected() {
        // A budget window narrower than one grid step forces the second pass.
        let (h, w) = normalize(10, 10, 28, 1000, 1100).unwrap();
        assert!(u64::from(h) * u64::from(w) <= 1100);
        assert!(h >= 28 && w >= 28);
    }

    #[test]
    fn extreme_aspect_ratio_rejected() {
        assert!(matches!(
            norm(10, 2001),
            Err(PipelineError::AspectRatio { height: 10, width: 2001 })
        ));
        assert!(norm(10, 2000).is_ok());
    }

    #[test]
    fn zero_side_rejected() {
        assert!(matches!(norm(0, 10), Err(PipelineError::DivideByZero { .. })));
    }

    #[test]
    fn normalised_size_is_a_fixed_point() {
        let (h, w) = norm(1700, 2200).unwrap();
        assert_eq!(norm(h, w).unwrap(), (h, w));
    }

    proptest! {
        #[test]
        fn output_respects_grid_and_budget(h in 1u32..20_000, w in 1u32..20_000) {
            let ratio = f64::from(h.max(w)) / f64::from(h.min(w));
            prop_assume!(ratio <= MAX_ASPECT_RATIO);
            let (nh, nw) = norm(h, w).unwrap();
            prop_assert!(nh > 0 && nw > 0);
            prop_assert_eq!(nh % DEFAULT_FACTOR, 0);
            prop_assert_eq!(nw % DEFAULT_FACTOR, 0);
            let area = u64::from(nh) * u64::from(nw);
            prop_assert!(area >= DEFAULT_MIN_PIXELS, "area {} below floor", area);
            prop_assert!(area <= DEFAULT_MAX_PIXELS, "area {} above ceiling", area);
        }

        #[test]
        fn elongated_input_always_fails(short in 1u32..50, extra in 1u32..1000) {
            let long = short * 200 + extra;
            prop_assert!(norm(short, long).is_err());
            prop_assert!(norm(long, short).is_err());
        }
    }
}
