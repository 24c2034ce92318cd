//! MPS weight function and its derivative.
//!
//! ```text
//! w(r, re) = re/r - 1        r_min < r < re
//! w(r, re) = re/r_min - 1    r <= r_min   (singularity clamp)
//! w(r, re) = 0               r >= re
//! ```
//!
//! `r_min = 0.01 * l0` clamps the kernel away from the 1/r singularity when
//! two particles nearly coincide (Koshizuka & Oka's standard MPS weight).
//! Non-negative, monotonically non-increasing on `(r_min, re)`, compact
//! support `re`.

/// `r_min` below which the kernel is clamped, as a fraction of the nominal
/// particle spacing `l0`.
pub const R_MIN_RATIO: f64 = 0.01;

#[inline]
pub fn r_min(l0: f64) -> f64 {
    R_MIN_RATIO * l0
}

/// Evaluate `w(r, re)` with the singularity clamp at `r_min`.
#[inline]
pub fn kernel_weight(r: f64, re: f64, l0: f64) -> f64 {
    if r >= re {
        return 0.0;
    }
    let r = r.max(r_min(l0));
    re / r - 1.0
}

/// Analytic derivative of `kernel_weight` with respect to `r`, using the same
/// clamp at `r_min`.
#[inline]
pub fn kernel_weight_derivative(r: f64, re: f64, l0: f64) -> f64 {
    if r >= re {
        return 0.0;
    }
    let r = r.max(r_min(l0));
    -re / (r * r)
}
