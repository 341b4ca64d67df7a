//! Box arithmetic on normalized center-form boxes.

use crate::annotation::{BBox, Normalized};

/// A box as its four edges. `bottom` is the smaller y value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Corners {
    pub left: f64,
    pub right: f64,
    pub bottom: f64,
    pub top: f64,
}

impl Corners {
    pub fn width(&self) -> f64 {
        self.right - self.left
    }

    pub fn height(&self) -> f64 {
        self.top - self.bottom
    }
}

/// Converts a center-form box to its edges.
pub fn to_corners(bbox: &BBox<Normalized>) -> Corners {
    Corners {
        left: bbox.cx - bbox.w / 2.0,
        right: bbox.cx + bbox.w / 2.0,
        bottom: bbox.cy - bbox.h / 2.0,
        top: bbox.cy + bbox.h / 2.0,
    }
}

/// Intersection over union of two boxes.
///
/// The intersection is clamped at zero, so disjoint boxes score 0. When the
/// union is not positive (two empty boxes) or a box is not finite the result
/// is 0 rather than NaN.
pub fn iou(a: &BBox<Normalized>, b: &BBox<Normalized>) -> f64 {
    if !a.is_finite() || !b.is_finite() {
        return 0.0;
    }
    // Areas come from the corners so identical boxes score exactly 1.
    let ca = to_corners(a);
    let cb = to_corners(b);

    let inter_w = (ca.right.min(cb.right) - ca.left.max(cb.left)).max(0.0);
    let inter_h = (ca.top.min(cb.top) - ca.bottom.max(cb.bottom)).max(0.0);
    let intersection = inter_w * inter_h;
    let union = ca.width() * ca.height() + cb.width() * cb.height() - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// The smallest box enclosing both boxes.
pub fn merge_boxes(a: &BBox<Normalized>, b: &BBox<Normalized>) -> BBox<Normalized> {
    let ca = to_corners(a);
    let cb = to_corners(b);
    BBox::from_edges(
        ca.left.min(cb.left),
        ca.right.max(cb.right),
        ca.bottom.min(cb.bottom),
        ca.top.max(cb.top),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(cx: f64, cy: f64, w: f64, h: f64) -> BBox<Normalized> {
        BBox::new(cx, cy, w, h)
    }

    #[test]
    fn corners_of_center_box() {
        let c = to_corners(&bbox(0.5, 0.5, 0.2, 0.4));
        assert!((c.left - 0.4).abs() < 1e-12);
        assert!((c.right - 0.6).abs() < 1e-12);
        assert!((c.bottom - 0.3).abs() < 1e-12);
        assert!((c.top - 0.7).abs() < 1e-12);
        assert!((c.width() - 0.2).abs() < 1e-12);
    }

    #[test]
    fn identical_boxes() {
        let a = bbox(0.5, 0.5, 0.2, 0.2);
        assert_eq!(iou(&a, &a), 1.0);
    }

    #[test]
    fn disjoint_boxes() {
        assert_eq!(iou(&bbox(0.1, 0.1, 0.1, 0.1), &bbox(0.9, 0.9, 0.1, 0.1)), 0.0);
    }

    #[test]
    fn half_overlap() {
        // Two unit-height boxes overlapping on half their width: 1 / 3.
        let a = bbox(0.25, 0.5, 0.5, 1.0);
        let b = bbox(0.5, 0.5, 0.5, 1.0);
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn degenerate_boxes_are_zero() {
        let point = bbox(0.5, 0.5, 0.0, 0.0);
        assert_eq!(iou(&point, &point), 0.0);
        let nan = bbox(f64::NAN, 0.5, 0.1, 0.1);
        assert_eq!(iou(&nan, &bbox(0.5, 0.5, 0.1, 0.1)), 0.0);
    }

    #[test]
    fn merged_box_encloses_both() {
        let m = merge_boxes(&bbox(0.2, 0.2, 0.2, 0.2), &bbox(0.6, 0.5, 0.2, 0.2));
        let c = to_corners(&m);
        assert!((c.left - 0.1).abs() < 1e-12);
        assert!((c.right - 0.7).abs() < 1e-12);
        assert!((c.bottom - 0.1).abs() < 1e-12);
        assert!((c.top - 0.6).abs() < 1e-12);
    }
}
