//! One-dimensional linear interpolation.
//!
//! Used to look up a sampled contrast curve at arbitrary separations. Two
//! flavours are provided: [`interp`] reports why a lookup failed, while
//! [`interp_or_nan`] folds every failure into `NaN` for callers that filter
//! undefined values out afterwards.

use thiserror::Error;

/// Errors that can occur during interpolation operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpError {
    #[error("Value {0} is out of bounds for interpolation range [{1}, {2}]")]
    OutOfBounds(f64, f64, f64),
    #[error("Input vectors must have at least 2 points")]
    InsufficientData,
    #[error("Input vectors must have the same length")]
    MismatchedLengths,
    #[error("X values must be sorted in ascending order")]
    UnsortedData,
}

/// Performs linear interpolation on 1D data using binary search.
///
/// # Arguments
///
/// * `x` - The x-coordinate at which to interpolate
/// * `xs` - Array of x-coordinates (must be sorted in ascending order)
/// * `ys` - Array of corresponding y-values (must match length of xs)
///
/// # Returns
///
/// * `Ok(f64)` - The interpolated y-value at position x. NaN neighbours
///   propagate into the result.
/// * `Err(InterpError)` - `x` outside `[xs[0], xs[n-1]]` (or NaN), fewer than
///   two points, mismatched lengths, or unsorted `xs`.
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> Result<f64, InterpError> {
    if xs.len() != ys.len() {
        return Err(InterpError::MismatchedLengths);
    }

    if xs.len() < 2 {
        return Err(InterpError::InsufficientData);
    }

    if xs.windows(2).any(|w| w[1] < w[0]) {
        return Err(InterpError::UnsortedData);
    }

    let first = xs[0];
    let last = xs[xs.len() - 1];
    if x.is_nan() || x < first || x > last {
        return Err(InterpError::OutOfBounds(x, first, last));
    }

    // partition_point returns the index of the first element > x
    let idx = xs.partition_point(|&val| val <= x);

    if idx == 0 {
        return Ok(ys[0]);
    }
    if idx == xs.len() {
        return Ok(ys[xs.len() - 1]);
    }

    let (x1, x2) = (xs[idx - 1], xs[idx]);
    let (y1, y2) = (ys[idx - 1], ys[idx]);

    if x == x1 {
        return Ok(y1);
    }

    let t = (x - x1) / (x2 - x1);
    Ok(y1 + t * (y2 - y1))
}

/// Linear interpolation that returns `NaN` wherever [`interp`] would fail.
pub fn interp_or_nan(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    interp(x, xs, ys).unwrap_or(f64::NAN)
}
