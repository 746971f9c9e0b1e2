//! Axis-aligned bounding boxes.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An axis-aligned box given by its lower and upper corners.
///
/// Containment is closed on all six faces. A box whose lower corner exceeds
/// its upper corner on any axis is empty; [`Box3::empty`] is the identity for
/// [`Box3::union`] and [`Box3::extend`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Box3 {
    pub lower: Vector3<f32>,
    pub upper: Vector3<f32>,
}

impl Box3 {
    pub fn new(lower: Vector3<f32>, upper: Vector3<f32>) -> Self {
        Self { lower, upper }
    }

    /// Creates a box from `[lx, ly, lz]` and `[ux, uy, uz]`.
    pub fn from_corners(lower: [f32; 3], upper: [f32; 3]) -> Self {
        Self::new(Vector3::from(lower), Vector3::from(upper))
    }

    /// The empty box (lower = +inf, upper = -inf).
    pub fn empty() -> Self {
        Self::new(
            Vector3::repeat(f32::INFINITY),
            Vector3::repeat(f32::NEG_INFINITY),
        )
    }

    /// A zero-sized box at the origin.
    pub fn zero() -> Self {
        Self::new(Vector3::zeros(), Vector3::zeros())
    }

    pub fn is_empty(&self) -> bool {
        (0..3).any(|axis| self.lower[axis] > self.upper[axis])
    }

    /// Grows the box to include `point`.
    pub fn extend(&mut self, point: &Vector3<f32>) {
        self.lower = self.lower.inf(point);
        self.upper = self.upper.sup(point);
    }

    /// Smallest box containing both boxes.
    pub fn union(&self, other: &Box3) -> Box3 {
        Box3::new(self.lower.inf(&other.lower), self.upper.sup(&other.upper))
    }

    /// True if `lower <= point <= upper` on every axis.
    pub fn contains(&self, point: &Vector3<f32>) -> bool {
        (0..3).all(|axis| self.lower[axis] <= point[axis] && point[axis] <= self.upper[axis])
    }

    /// Same as [`Box3::contains`] for a raw `[x, y, z, ...]` record.
    #[inline]
    pub fn contains_xyz(&self, x: f32, y: f32, z: f32) -> bool {
        self.lower.x <= x
            && x <= self.upper.x
            && self.lower.y <= y
            && y <= self.upper.y
            && self.lower.z <= z
            && z <= self.upper.z
    }

    /// The box padded by `width` on every face.
    pub fn grow(&self, width: f32) -> Box3 {
        let pad = Vector3::repeat(width);
        Box3::new(self.lower - pad, self.upper + pad)
    }

    /// Interpolates between the corners with a per-axis fraction.
    ///
    /// Computed as `(1 - f) * lower + f * upper` so `f = 0` and `f = 1`
    /// reproduce the corners bit for bit.
    pub fn lerp(&self, fraction: &Vector3<f32>) -> Vector3<f32> {
        Vector3::from_fn(|axis, _| {
            let f = fraction[axis];
            (1.0 - f) * self.lower[axis] + f * self.upper[axis]
        })
    }

    pub fn size(&self) -> Vector3<f32> {
        self.upper - self.lower
    }

    pub fn center(&self) -> Vector3<f32> {
        (self.lower + self.upper) * 0.5
    }

    /// Replaces an empty box with [`Box3::zero`].
    pub fn or_zero(self) -> Box3 {
        if self.is_empty() {
            Box3::zero()
        } else {
            self
        }
    }

    /// Wire order: lower x, y, z then upper x, y, z.
    pub fn to_array(&self) -> [f32; 6] {
        [
            self.lower.x,
            self.lower.y,
            self.lower.z,
            self.upper.x,
            self.upper.y,
            self.upper.z,
        ]
    }

    pub fn from_array(values: [f32; 6]) -> Self {
        Self::from_corners(
            [values[0], values[1], values[2]],
            [values[3], values[4], values[5]],
        )
    }
}

impl Default for Box3 {
    fn default() -> Self {
        Box3::zero()
    }
}

impl fmt::Display for Box3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[({}, {}, {}) - ({}, {}, {})]",
            self.lower.x, self.lower.y, self.lower.z, self.upper.x, self.upper.y, self.upper.z
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_empty_box_is_union_identity() {
        let b = Box3::from_corners([0.0, 1.0, 2.0], [3.0, 4.0, 5.0]);
        assert!(Box3::empty().is_empty());
        assert_eq!(Box3::empty().union(&b), b);
        assert_eq!(b.union(&Box3::empty()), b);
    }

    #[test]
    fn test_extend_tracks_points() {
        let mut b = Box3::empty();
        b.extend(&Vector3::new(1.0, -2.0, 3.0));
        b.extend(&Vector3::new(-1.0, 2.0, 0.5));

        assert_eq!(b.lower, Vector3::new(-1.0, -2.0, 0.5));
        assert_eq!(b.upper, Vector3::new(1.0, 2.0, 3.0));
        assert!(!b.is_empty());
    }

    #[test]
    fn test_containment_is_closed() {
        let b = Box3::from_corners([-1.0, -1.0, -1.0], [1.0, 1.0, 1.0]);
        assert!(b.contains(&Vector3::new(1.0, -1.0, 0.0)));
        assert!(b.contains_xyz(-1.0, 1.0, 1.0));
        assert!(!b.contains(&Vector3::new(1.0001, 0.0, 0.0)));
        assert!(!b.contains_xyz(0.0, 0.0, -1.5));
    }

    #[test]
    fn test_lerp_hits_corners_exactly() {
        let b = Box3::from_corners([0.1, -7.3, 2.0], [0.7, 11.9, 2.3]);
        assert_eq!(b.lerp(&Vector3::zeros()), b.lower);
        assert_eq!(b.lerp(&Vector3::repeat(1.0)), b.upper);

        let mid = b.lerp(&Vector3::repeat(0.5));
        assert_relative_eq!(mid, b.center(), epsilon = 1e-5);
    }

    #[test]
    fn test_grow_and_array_order() {
        let b = Box3::from_corners([0.0, 0.0, 0.0], [1.0, 2.0, 3.0]).grow(0.5);
        assert_eq!(b.to_array(), [-0.5, -0.5, -0.5, 1.5, 2.5, 3.5]);
        assert_eq!(Box3::from_array(b.to_array()), b);
    }

    #[test]
    fn test_or_zero() {
        assert_eq!(Box3::empty().or_zero(), Box3::zero());
        let b = Box3::from_corners([1.0, 1.0, 1.0], [1.0, 1.0, 1.0]);
        assert_eq!(b.or_zero(), b);
    }
}
