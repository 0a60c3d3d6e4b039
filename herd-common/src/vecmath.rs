use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

/// A simple 3D vector struct. The simulation plane is x/z, y is height.
#[derive(Debug, Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };
    pub const UP: Vec3 = Vec3 { x: 0.0, y: 1.0, z: 0.0 };
    pub const RIGHT: Vec3 = Vec3 { x: 1.0, y: 0.0, z: 0.0 };
    pub const FORWARD: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 1.0 };

    /// Creates a new Vec3.
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Vec3 { x, y, z }
    }

    /// Creates a vector lying in the ground plane (y = 0).
    pub fn planar(x: f32, z: f32) -> Self {
        Vec3 { x, y: 0.0, z }
    }

    /// Creates a zero vector.
    pub fn zero() -> Self {
        Self::ZERO
    }

    /// Calculates the squared length (magnitude) of the vector.
    pub fn length_squared(&self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Calculates the length (magnitude) of the vector.
    pub fn length(&self) -> f32 {
        self.length_squared().sqrt()
    }

    /// Returns a normalized version of the vector (unit vector).
    /// Returns a zero vector if the original vector's length is zero.
    pub fn normalize_or_zero(&self) -> Self {
        let len_sq = self.length_squared();
        if len_sq > 1e-12 {
            let inv_len = 1.0 / len_sq.sqrt();
            self.scale(inv_len)
        } else {
            Vec3::zero()
        }
    }

    /// Calculates the dot product with another vector.
    pub fn dot(&self, other: Vec3) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    /// Cross product.
    pub fn cross(&self, other: Vec3) -> Vec3 {
        Vec3 {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    /// Calculates the squared distance to another vector (point).
    pub fn distance_squared(&self, other: Vec3) -> f32 {
        (*self - other).length_squared()
    }

    /// Calculates the distance to another vector (point).
    pub fn distance(&self, other: Vec3) -> f32 {
        self.distance_squared(other).sqrt()
    }

    /// Scales the vector by a scalar value.
    pub fn scale(&self, scalar: f32) -> Self {
        Vec3 { x: self.x * scalar, y: self.y * scalar, z: self.z * scalar }
    }

    /// Drops the height component.
    pub fn flatten(&self) -> Self {
        Vec3 { x: self.x, y: 0.0, z: self.z }
    }

    /// Returns the vector scaled down to `max_len` if it is longer.
    pub fn clamp_length(&self, max_len: f32) -> Self {
        let len_sq = self.length_squared();
        if len_sq > max_len * max_len && len_sq > 1e-12 {
            self.scale(max_len / len_sq.sqrt())
        } else {
            *self
        }
    }

    /// Unsigned angle in degrees between two vectors, 0 if either is degenerate.
    pub fn angle_deg(&self, other: Vec3) -> f32 {
        let denom = (self.length_squared() * other.length_squared()).sqrt();
        if denom < 1e-15 {
            return 0.0;
        }
        clamp(self.dot(other) / denom, -1.0, 1.0).acos().to_degrees()
    }

    /// Lateral axis of a planar forward direction (clockwise when seen from above).
    pub fn right_of(forward: Vec3) -> Vec3 {
        Vec3::planar(forward.z, -forward.x).normalize_or_zero()
    }

    /// Rotates a planar vector around the up axis by `angle_deg` (clockwise from above).
    pub fn rotate_about_up(&self, angle_deg: f32) -> Vec3 {
        let (s, c) = angle_deg.to_radians().sin_cos();
        Vec3 {
            x: self.x * c + self.z * s,
            y: self.y,
            z: -self.x * s + self.z * c,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

impl Add for Vec3 {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self { x: self.x + other.x, y: self.y + other.y, z: self.z + other.z }
    }
}

impl AddAssign for Vec3 {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl Sub for Vec3 {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self { x: self.x - other.x, y: self.y - other.y, z: self.z - other.z }
    }
}

impl SubAssign for Vec3 {
    fn sub_assign(&mut self, other: Self) {
        *self = *self - other;
    }
}

impl Mul<f32> for Vec3 {
    type Output = Self;
    fn mul(self, scalar: f32) -> Self {
        self.scale(scalar)
    }
}

impl Div<f32> for Vec3 {
    type Output = Self;
    fn div(self, scalar: f32) -> Self {
        // Callers guard against zero divisors.
        Self { x: self.x / scalar, y: self.y / scalar, z: self.z / scalar }
    }
}

impl Neg for Vec3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self { x: -self.x, y: -self.y, z: -self.z }
    }
}

impl std::iter::Sum for Vec3 {
    fn sum<I: Iterator<Item = Vec3>>(iter: I) -> Self {
        iter.fold(Vec3::zero(), |acc, v| acc + v)
    }
}

/// Clamps a value between a minimum and maximum.
pub fn clamp(value: f32, min: f32, max: f32) -> f32 {
    value.max(min).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn right_of_forward_is_positive_x() {
        let r = Vec3::right_of(Vec3::FORWARD);
        assert!((r.x - 1.0).abs() < 1e-6);
        assert!(r.z.abs() < 1e-6);
    }

    #[test]
    fn angle_between_orthogonal_vectors() {
        let a = Vec3::planar(1.0, 0.0);
        let b = Vec3::planar(0.0, 2.0);
        assert!((a.angle_deg(b) - 90.0).abs() < 1e-4);
        assert_eq!(a.angle_deg(Vec3::zero()), 0.0);
    }

    #[test]
    fn rotate_matches_right_axis() {
        let rotated = Vec3::FORWARD.rotate_about_up(90.0);
        let right = Vec3::right_of(Vec3::FORWARD);
        assert!((rotated - right).length() < 1e-5);
    }

    #[test]
    fn clamp_length_only_shrinks() {
        let v = Vec3::planar(3.0, 4.0);
        assert!((v.clamp_length(1.0).length() - 1.0).abs() < 1e-5);
        assert_eq!(v.clamp_length(10.0), v);
    }
}
