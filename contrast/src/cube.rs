//! Residual cubes and the sky geometry that travels with them.
//!
//! Image coordinates are `(x, y)` = `(column, row)` with y pointing up on the
//! sky image, north along +y and east along -x. Position angles are measured
//! from north through east, so an offset at position angle `pa` and
//! separation `sep` sits at `(-sep * sin(pa), sep * cos(pa))`.

use ndarray::{Array3, ArrayD, ArrayView2, Axis, Ix3};
use serde::{Deserialize, Serialize};

use crate::error::ContrastError;

/// Sky offset, in pixels, of a point at `separation_px` and `position_angle_deg`.
pub fn sky_offset(separation_px: f64, position_angle_deg: f64) -> (f64, f64) {
    let (sin, cos) = position_angle_deg.to_radians().sin_cos();
    (-separation_px * sin, separation_px * cos)
}

/// Position angle (degrees in `[0, 360)`) of the pixel offset `(dx, dy)`.
pub fn position_angle_deg(dx: f64, dy: f64) -> f64 {
    (-dx).atan2(dy).to_degrees().rem_euclid(360.0)
}

/// A known off-axis source, given as a sky offset from the host star.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KnownSource {
    /// Offset towards east, in milliarcseconds
    pub ra_offset_mas: f64,
    /// Offset towards north, in milliarcseconds
    pub dec_offset_mas: f64,
}

impl KnownSource {
    pub fn new(ra_offset_mas: f64, dec_offset_mas: f64) -> Self {
        Self {
            ra_offset_mas,
            dec_offset_mas,
        }
    }

    /// Pixel offset from the star center at the given plate scale.
    ///
    /// East maps to -x, north to +y.
    pub fn pixel_offset(&self, pixel_scale_mas: f64) -> (f64, f64) {
        (
            -self.ra_offset_mas / pixel_scale_mas,
            self.dec_offset_mas / pixel_scale_mas,
        )
    }

    /// Both offsets must be finite.
    pub fn validate(&self) -> Result<(), ContrastError> {
        if self.ra_offset_mas.is_finite() && self.dec_offset_mas.is_finite() {
            Ok(())
        } else {
            Err(ContrastError::InvalidInput(format!(
                "known source offset must be finite, got {self:?}"
            )))
        }
    }

    /// Absolute pixel position for a cube centered on `center`.
    pub fn pixel_position(&self, pixel_scale_mas: f64, center: (f64, f64)) -> (f64, f64) {
        let (dx, dy) = self.pixel_offset(pixel_scale_mas);
        (center.0 + dx, center.1 + dy)
    }
}

/// Position-angle ranges left unobstructed by a bar occulter.
///
/// Each range is `(low_deg, high_deg)` with both bounds inclusive. A pixel
/// whose position angle lies in no range is considered obstructed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OcculterGeometry {
    slices: Vec<(f64, f64)>,
}

impl OcculterGeometry {
    /// Build from inclusive `(low, high)` ranges in degrees.
    pub fn new(slices: Vec<(f64, f64)>) -> Result<Self, ContrastError> {
        let geometry = Self { slices };
        geometry.validate()?;
        Ok(geometry)
    }

    /// The whole circle, which leaves every pixel valid.
    pub fn full_circle() -> Self {
        Self {
            slices: vec![(0.0, 360.0)],
        }
    }

    pub fn slices(&self) -> &[(f64, f64)] {
        &self.slices
    }

    /// Reject ranges that are non-finite or have `low > high`.
    pub fn validate(&self) -> Result<(), ContrastError> {
        for &(low, high) in &self.slices {
            if !low.is_finite() || !high.is_finite() || low > high {
                return Err(ContrastError::InvalidInput(format!(
                    "occulter range ({low}, {high}) must be finite with low <= high"
                )));
            }
        }
        Ok(())
    }

    /// True when `angle_deg` falls in any unobstructed range.
    pub fn contains(&self, angle_deg: f64) -> bool {
        self.slices
            .iter()
            .any(|&(low, high)| angle_deg >= low && angle_deg <= high)
    }
}

/// Timing and orientation of one roll of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RollInfo {
    /// Telescope roll angle in degrees
    pub roll_angle_deg: f64,
    /// Total integration time of the roll in seconds
    pub integration_time_s: f64,
}

/// Post-processed residual images, one frame per KL truncation.
#[derive(Debug, Clone)]
pub struct ResidualCube {
    data: Array3<f64>,
    kl_modes: Vec<usize>,
    center: (f64, f64),
    pixel_scale_mas: f64,
}

impl ResidualCube {
    /// Wrap the output of a combination engine.
    ///
    /// Fails with [`ContrastError::Shape`] unless `data` is 3-D with one
    /// frame per entry of `kl_modes`.
    pub fn new(
        data: ArrayD<f64>,
        kl_modes: Vec<usize>,
        center: (f64, f64),
        pixel_scale_mas: f64,
    ) -> Result<Self, ContrastError> {
        let data = into_cube(data)?;
        if data.len_of(Axis(0)) != kl_modes.len() {
            return Err(ContrastError::Shape {
                expected: format!("{} KL frames", kl_modes.len()),
                found: data.shape().to_vec(),
            });
        }
        if !(pixel_scale_mas.is_finite() && pixel_scale_mas > 0.0) {
            return Err(ContrastError::InvalidInput(format!(
                "pixel scale must be positive, got {pixel_scale_mas}"
            )));
        }

        Ok(Self {
            data,
            kl_modes,
            center,
            pixel_scale_mas,
        })
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn kl_modes(&self) -> &[usize] {
        &self.kl_modes
    }

    pub fn center(&self) -> (f64, f64) {
        self.center
    }

    pub fn pixel_scale_mas(&self) -> f64 {
        self.pixel_scale_mas
    }

    /// Residual frame for the KL truncation at `kl_index`.
    pub fn frame(&self, kl_index: usize) -> Result<ArrayView2<'_, f64>, ContrastError> {
        if kl_index >= self.kl_modes.len() {
            return Err(ContrastError::InvalidInput(format!(
                "KL index {kl_index} out of range for {} truncations",
                self.kl_modes.len()
            )));
        }
        Ok(self.data.index_axis(Axis(0), kl_index))
    }

    /// Same cube with new pixel values, keeping the metadata.
    pub fn with_data(&self, data: Array3<f64>) -> Result<Self, ContrastError> {
        if data.dim() != self.data.dim() {
            return Err(ContrastError::Shape {
                expected: format!("{:?}", self.data.shape()),
                found: data.shape().to_vec(),
            });
        }
        Ok(Self {
            data,
            kl_modes: self.kl_modes.clone(),
            center: self.center,
            pixel_scale_mas: self.pixel_scale_mas,
        })
    }
}

/// Convert a dynamically shaped array into a `(frames, rows, cols)` cube.
pub fn into_cube(data: ArrayD<f64>) -> Result<Array3<f64>, ContrastError> {
    let shape = data.shape().to_vec();
    data.into_dimensionality::<Ix3>()
        .map_err(|_| ContrastError::Shape {
            expected: "3-D (frames, rows, cols)".to_string(),
            found: shape,
        })
}
