//! Resolution helpers shared by dataset generation and training preprocessing
//!
//! Generation requests are sized from the source image's aspect ratio and
//! clamped to a maximum side and a maximum pixel area. Training images are
//! only ever scaled down to fit a pixel budget, never up.

/// Longest side allowed for generation requests
pub const DEFAULT_MAX_SIDE: u32 = 2048;

/// Alignment required by the latent space (VAE downsamples by 8)
const LATENT_ALIGNMENT: u32 = 8;

/// Compute a generation resolution for a `width` x `height` source image
///
/// The result keeps the source aspect ratio, fits inside `max_side` on both
/// axes, covers at most `max_area` pixels and has both sides rounded down to
/// a multiple of 8.
pub fn adjusted_resolution(width: u32, height: u32, max_area: u64, max_side: u32) -> (u32, u32) {
    let mut width = width as f64;
    let mut height = height as f64;

    if width > max_side as f64 || height > max_side as f64 {
        let scale = max_side as f64 / width.max(height);
        width = (width * scale).trunc();
        height = (height * scale).trunc();
    }

    let area = width * height;
    if area > max_area as f64 {
        let scale = (max_area as f64 / area).sqrt();
        width = (width * scale).trunc();
        height = (height * scale).trunc();
    }

    let mut width = align_down(width as u32, LATENT_ALIGNMENT);
    let mut height = align_down(height as u32, LATENT_ALIGNMENT);

    // Float truncation can leave the product a hair over budget
    while (width as u64) * (height as u64) > max_area {
        if width >= height {
            width -= LATENT_ALIGNMENT;
        } else {
            height -= LATENT_ALIGNMENT;
        }
    }

    (width, height)
}

/// Compute the training resolution for a `height` x `width` image
///
/// Images larger than `target_area` are scaled down (keeping aspect ratio);
/// every image then has both sides trimmed to a multiple of `divisible`.
/// Returns `(height, width)`.
pub fn adaptive_size(height: u32, width: u32, target_area: u64, divisible: u32) -> (u32, u32) {
    debug_assert!(divisible > 0, "divisible must be non-zero");

    let mut height = height;
    let mut width = width;
    let img_area = height as u64 * width as u64;

    if img_area > target_area {
        let scale = (target_area as f64 / img_area as f64).sqrt();
        width = ((width as f64 * scale / divisible as f64).floor() as u32) * divisible;
        height = ((height as f64 * scale / divisible as f64).floor() as u32) * divisible;
    }

    (align_down(height, divisible), align_down(width, divisible))
}

fn align_down(value: u32, multiple: u32) -> u32 {
    value - value % multiple
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_adjusted_resolution_keeps_small_images() {
        assert_eq!(adjusted_resolution(832, 1216, 1536 * 1536, 2048), (832, 1216));
        // Non-aligned sides are rounded down
        assert_eq!(adjusted_resolution(837, 1219, 1536 * 1536, 2048), (832, 1216));
    }

    #[test]
    fn test_adjusted_resolution_clamps_long_side() {
        // 4096x2048 -> 2048x1024 (area 2M < 1536^2 = 2.36M)
        assert_eq!(adjusted_resolution(4096, 2048, 1536 * 1536, 2048), (2048, 1024));
    }

    #[test]
    fn test_adjusted_resolution_clamps_area() {
        let (w, h) = adjusted_resolution(2000, 2000, 1024 * 1024, 2048);
        assert_eq!((w, h), (1024, 1024));

        let (w, h) = adjusted_resolution(3000, 2000, 1536 * 1536, 2048);
        assert!(w * h <= 1536 * 1536);
        assert_eq!(w % 8, 0);
        assert_eq!(h % 8, 0);
        // Aspect ratio survives within rounding
        let ratio = w as f64 / h as f64;
        assert!((ratio - 1.5).abs() < 0.02, "ratio {ratio}");
    }

    #[test]
    fn test_adaptive_size_no_upscale() {
        assert_eq!(adaptive_size(512, 768, 1024 * 1024, 8), (512, 768));
        assert_eq!(adaptive_size(515, 770, 1024 * 1024, 8), (512, 768));
    }

    #[test]
    fn test_adaptive_size_downscales() {
        // 2048x2048 with a 1024^2 budget -> exactly 1024x1024
        assert_eq!(adaptive_size(2048, 2048, 1024 * 1024, 8), (1024, 1024));

        let (h, w) = adaptive_size(1500, 3000, 1024 * 1024, 64);
        assert_eq!(h % 64, 0);
        assert_eq!(w % 64, 0);
        assert!((h as u64) * (w as u64) <= 1024 * 1024);
    }

    proptest! {
        #[test]
        fn prop_adjusted_resolution_within_bounds(
            width in 1u32..12_000,
            height in 1u32..12_000,
            max in 64u32..4096,
        ) {
            let max_area = max as u64 * max as u64;
            let (w, h) = adjusted_resolution(width, height, max_area, DEFAULT_MAX_SIDE);
            prop_assert!(w <= DEFAULT_MAX_SIDE);
            prop_assert!(h <= DEFAULT_MAX_SIDE);
            prop_assert!((w as u64) * (h as u64) <= max_area);
            prop_assert_eq!(w % 8, 0);
            prop_assert_eq!(h % 8, 0);
        }

        #[test]
        fn prop_adaptive_size_within_budget(
            height in 1u32..8_000,
            width in 1u32..8_000,
            resolution in 256u32..2048,
            divisible in prop::sample::select(vec![8u32, 16, 32, 64]),
        ) {
            let target_area = resolution as u64 * resolution as u64;
            let (h, w) = adaptive_size(height, width, target_area, divisible);
            prop_assert!(h <= height && w <= width);
            prop_assert!((h as u64) * (w as u64) <= target_area.max(height as u64 * width as u64));
            if (height as u64) * (width as u64) > target_area {
                prop_assert!((h as u64) * (w as u64) <= target_area);
            }
            prop_assert_eq!(h % divisible, 0);
            prop_assert_eq!(w % divisible, 0);
        }
    }
}
