//! Bounding boxes in center form.

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

use super::space::{Normalized, Pixel};

/// An axis-aligned bounding box in center form `(cx, cy, w, h)`.
///
/// The `TSpace` parameter should be either [`Pixel`] or [`Normalized`].
/// Parts always store `BBox<Normalized>`; pixel boxes are derived on demand
/// through [`BBox::to_pixel`].
///
/// The constructor does not reject negative sizes or out-of-range centers.
/// Geometry on such boxes is still defined (see [`crate::matching::iou`]).
#[derive(Clone, Copy, PartialEq)]
pub struct BBox<TSpace> {
    pub cx: f64,
    pub cy: f64,
    pub w: f64,
    pub h: f64,
    _space: PhantomData<TSpace>,
}

impl<TSpace> BBox<TSpace> {
    /// Creates a new box from its center and size.
    #[inline]
    pub fn new(cx: f64, cy: f64, w: f64, h: f64) -> Self {
        Self {
            cx,
            cy,
            w,
            h,
            _space: PhantomData,
        }
    }

    /// Creates a box from its edges (`left <= right`, `bottom <= top`).
    #[inline]
    pub fn from_edges(left: f64, right: f64, bottom: f64, top: f64) -> Self {
        let w = right - left;
        let h = top - bottom;
        Self::new(left + w / 2.0, bottom + h / 2.0, w, h)
    }

    /// Returns true if all four values are finite.
    #[inline]
    pub fn is_finite(&self) -> bool {
        self.cx.is_finite() && self.cy.is_finite() && self.w.is_finite() && self.h.is_finite()
    }

    /// Returns the values as a `[cx, cy, w, h]` array.
    #[inline]
    pub fn to_array(&self) -> [f64; 4] {
        [self.cx, self.cy, self.w, self.h]
    }
}

impl BBox<Normalized> {
    /// Converts to pixel coordinates for an image of the given size.
    pub fn to_pixel(&self, image_width: f64, image_height: f64) -> BBox<Pixel> {
        BBox::new(
            self.cx * image_width,
            self.cy * image_height,
            self.w * image_width,
            self.h * image_height,
        )
    }

    /// Returns a copy with every value clamped to `[0, 1]`.
    pub fn clamped(&self) -> Self {
        BBox::new(
            self.cx.clamp(0.0, 1.0),
            self.cy.clamp(0.0, 1.0),
            self.w.clamp(0.0, 1.0),
            self.h.clamp(0.0, 1.0),
        )
    }
}

impl BBox<Pixel> {
    /// Converts to coordinates normalized by the given image size.
    pub fn to_normalized(&self, image_width: f64, image_height: f64) -> BBox<Normalized> {
        BBox::new(
            self.cx / image_width,
            self.cy / image_height,
            self.w / image_width,
            self.h / image_height,
        )
    }

    /// Returns the integer crop rectangle `(x, y, width, height)` inside an
    /// image of the given size, clamped to the image and at least one pixel
    /// wide and tall.
    pub fn crop_rect(&self, image_width: u32, image_height: u32) -> (u32, u32, u32, u32) {
        if image_width == 0 || image_height == 0 {
            return (0, 0, 0, 0);
        }
        if !self.is_finite() {
            return (0, 0, image_width, image_height);
        }
        let max_x = image_width.saturating_sub(1) as f64;
        let max_y = image_height.saturating_sub(1) as f64;
        let left = (self.cx - self.w / 2.0).floor().clamp(0.0, max_x);
        let top = (self.cy - self.h / 2.0).floor().clamp(0.0, max_y);
        let right = (self.cx + self.w / 2.0).ceil().clamp(left + 1.0, image_width as f64);
        let bottom = (self.cy + self.h / 2.0)
            .ceil()
            .clamp(top + 1.0, image_height as f64);
        (
            left as u32,
            top as u32,
            (right - left) as u32,
            (bottom - top) as u32,
        )
    }
}

impl<TSpace> std::fmt::Debug for BBox<TSpace> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BBox")
            .field("cx", &self.cx)
            .field("cy", &self.cy)
            .field("w", &self.w)
            .field("h", &self.h)
            .finish()
    }
}

impl<TSpace> Default for BBox<TSpace> {
    fn default() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }
}

// Boxes are persisted as a bare `[cx, cy, w, h]` array.
impl<TSpace> Serialize for BBox<TSpace> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_array().serialize(serializer)
    }
}

impl<'de, TSpace> Deserialize<'de> for BBox<TSpace> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let [cx, cy, w, h] = <[f64; 4]>::deserialize(deserializer)?;
        Ok(BBox::new(cx, cy, w, h))
    }
}
