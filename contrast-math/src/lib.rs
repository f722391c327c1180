//! contrast-math - Numeric primitives for high-contrast imaging analysis
//!
//! This crate provides the mathematical building blocks used by the
//! contrast-curve pipeline:
//!
//! - **Statistics** - NaN-aware median and sample standard deviation,
//!   small-sample (Student-t) detection thresholds
//! - **Interpolation** - 1-D linear interpolation and bilinear image sampling
//! - **Rotation** - image rotation about an arbitrary center
//! - **Least squares** - Levenberg-Marquardt nonlinear least squares
//!
//! # Example
//!
//! ```text
//! use contrast_math::{interp, median};
//!
//! let xs = [0.0, 1.0, 2.0];
//! let ys = [0.0, 10.0, 20.0];
//! assert_eq!(interp(1.5, &xs, &ys).unwrap(), 15.0);
//! assert_eq!(median(&[3.0, f64::NAN, 1.0, 2.0]).unwrap(), 2.0);
//! ```

pub mod bilinear;
pub mod interp;
pub mod lsq;
pub mod stats;

pub use bilinear::{rotate_image, sample_bilinear};
pub use interp::{interp, interp_or_nan, InterpError};
pub use lsq::{
    levenberg_marquardt, LeastSquaresProblem, LsqError, LsqOptions, LsqReport, Termination,
};
pub use stats::{detection_threshold, median, sample_std, StatsError};
