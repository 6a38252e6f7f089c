//! Change detectors.
//!
//! Stateless comparisons between two observations of the object in view.
//! Invalid input yields the "maximally different" sentinel (`0.0` IoU,
//! `+inf` distance) instead of an error.

use crate::frame::{GrayPatch, Rect};

/// Side length both patches are resized to before comparison.
pub const TEXTURE_SIZE: u32 = 96;

/// Intersection-over-union; `0.0` when the boxes do not overlap or either
/// has non-positive area.
pub fn iou(a: Rect, b: Rect) -> f32 {
    if !a.is_well_formed() || !b.is_well_formed() {
        return 0.0;
    }
    let iw = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let ih = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = iw * ih;
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

/// Euclidean distance between box centers.
pub fn centroid_distance(a: Rect, b: Rect) -> f32 {
    if !a.is_finite() || !b.is_finite() {
        return f32::INFINITY;
    }
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    (ax - bx).hypot(ay - by)
}

/// Downsampled copy used as the stored texture of a region of interest.
pub fn texture_signature(patch: &GrayPatch) -> Option<GrayPatch> {
    if patch.is_empty() {
        return None;
    }
    Some(patch.resized(TEXTURE_SIZE, TEXTURE_SIZE))
}

/// Mean absolute pixel difference (0..=255) after resizing both patches to
/// `TEXTURE_SIZE`².
pub fn texture_delta(a: &GrayPatch, b: &GrayPatch) -> f32 {
    let (Some(a), Some(b)) = (texture_signature(a), texture_signature(b)) else {
        return f32::INFINITY;
    };
    let pa = a.pixels();
    let pb = b.pixels();
    if pa.len() != pb.len() || pa.is_empty() {
        return f32::INFINITY;
    }
    let total: u64 = pa
        .iter()
        .zip(pb)
        .map(|(x, y)| u64::from(x.abs_diff(*y)))
        .sum();
    total as f32 / pa.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_identical_boxes_is_one() {
        let r = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert!((iou(r, r) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_partial_overlap() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(5.0, 0.0, 15.0, 10.0);
        // inter 50, union 150
        assert!((iou(a, b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn iou_disjoint_and_degenerate_are_zero() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        assert_eq!(iou(a, Rect::new(20.0, 20.0, 30.0, 30.0)), 0.0);
        assert_eq!(iou(a, Rect::new(5.0, 5.0, 5.0, 9.0)), 0.0);
        assert_eq!(iou(a, Rect::new(f32::NAN, 0.0, 1.0, 1.0)), 0.0);
    }

    #[test]
    fn centroid_distance_is_euclidean() {
        let a = Rect::new(0.0, 0.0, 2.0, 2.0);
        let b = Rect::new(3.0, 4.0, 5.0, 6.0);
        assert!((centroid_distance(a, b) - 5.0).abs() < 1e-6);
        assert_eq!(
            centroid_distance(a, Rect::new(f32::INFINITY, 0.0, 1.0, 1.0)),
            f32::INFINITY
        );
    }

    #[test]
    fn texture_delta_of_uniform_patches() {
        let dark = GrayPatch::filled(40, 30, 10);
        let light = GrayPatch::filled(200, 120, 60);
        assert!(texture_delta(&dark, &dark).abs() < 1e-6);
        assert!((texture_delta(&dark, &light) - 50.0).abs() < 0.5);
    }

    #[test]
    fn texture_delta_of_empty_patch_is_maximal() {
        let empty = GrayPatch::filled(0, 0, 0);
        let patch = GrayPatch::filled(8, 8, 0);
        assert_eq!(texture_delta(&empty, &patch), f32::INFINITY);
    }
}
