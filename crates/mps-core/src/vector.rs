//! Dimension-generic vector abstraction.
//!
//! The solver is written once and instantiated for 2D (`glam::DVec2`) and 3D
//! (`glam::DVec3`) rather than shipping two parallel module trees. Every
//! operator, the neighbour index, and the PPE assembly are generic over
//! `V: Vector`; `V::DIM` supplies the dimension constant the original MPS
//! formulas use directly (`2d/(n0*lambda)`, etc).

use glam::{DVec2, DVec3};
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

/// A fixed-size floating point vector usable as an MPS particle's
/// position/velocity/acceleration.
pub trait Vector:
    Copy
    + Clone
    + std::fmt::Debug
    + PartialEq
    + Add<Output = Self>
    + Sub<Output = Self>
    + AddAssign
    + SubAssign
    + Mul<f64, Output = Self>
    + Send
    + Sync
    + 'static
{
    /// Spatial dimension (2 or 3).
    const DIM: usize;

    fn zero() -> Self;
    fn splat(v: f64) -> Self;
    fn dot(self, rhs: Self) -> f64;
    fn length_squared(self) -> f64;
    fn length(self) -> f64 {
        self.length_squared().sqrt()
    }
    fn is_finite(self) -> bool;
    /// Component `i` (0=x, 1=y, 2=z). Panics if `i >= Self::DIM`.
    fn get(self, i: usize) -> f64;
    /// Component `i` set to `v`, all others unchanged. Panics if `i >= Self::DIM`.
    fn with(self, i: usize, v: f64) -> Self;
}

impl Vector for DVec2 {
    const DIM: usize = 2;

    fn zero() -> Self {
        DVec2::ZERO
    }
    fn splat(v: f64) -> Self {
        DVec2::splat(v)
    }
    fn dot(self, rhs: Self) -> f64 {
        DVec2::dot(self, rhs)
    }
    fn length_squared(self) -> f64 {
        DVec2::length_squared(self)
    }
    fn is_finite(self) -> bool {
        self.is_finite()
    }
    fn get(self, i: usize) -> f64 {
        match i {
            0 => self.x,
            1 => self.y,
            _ => panic!("DVec2 component index out of range: {i}"),
        }
    }
    fn with(mut self, i: usize, v: f64) -> Self {
        match i {
            0 => self.x = v,
            1 => self.y = v,
            _ => panic!("DVec2 component index out of range: {i}"),
        }
        self
    }
}

impl Vector for DVec3 {
    const DIM: usize = 3;

    fn zero() -> Self {
        DVec3::ZERO
    }
    fn splat(v: f64) -> Self {
        DVec3::splat(v)
    }
    fn dot(self, rhs: Self) -> f64 {
        DVec3::dot(self, rhs)
    }
    fn length_squared(self) -> f64 {
        DVec3::length_squared(self)
    }
    fn is_finite(self) -> bool {
        self.is_finite()
    }
    fn get(self, i: usize) -> f64 {
        match i {
            0 => self.x,
            1 => self.y,
            2 => self.z,
            _ => panic!("DVec3 component index out of range: {i}"),
        }
    }
    fn with(mut self, i: usize, v: f64) -> Self {
        match i {
            0 => self.x = v,
            1 => self.y = v,
            2 => self.z = v,
            _ => panic!("DVec3 component index out of range: {i}"),
        }
        self
    }
}
