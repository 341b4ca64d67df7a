//! Coordinate space marker types.
//!
//! Boxes carry their coordinate space as a zero-sized type parameter so that
//! normalized placements and derived pixel rectangles cannot be mixed up.

use std::fmt;

/// Marker type for pixel coordinates, absolute within one concrete image.
///
/// Pixel boxes are only ever derived (for cropping or for handing boxes to an
/// external engine); they are never stored on a part.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pixel {}

/// Marker type for coordinates normalized to `[0, 1]` relative to the
/// owning assembly's image.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Normalized {}

impl fmt::Debug for Pixel {
    fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {}
    }
}

impl fmt::Debug for Normalized {
    fn fmt(&self, _: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {}
    }
}
