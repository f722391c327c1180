//! Raw contrast from azimuthal noise statistics.
//!
//! For each radius between the inner and outer working angle, the valid
//! pixels of an annulus one resolution element wide are collected, their
//! sample standard deviation is scaled by a detection threshold and divided
//! by the stellar normalization. The threshold is `detection_sigma` when the
//! annulus holds enough independent resolution elements, and the Student-t
//! corrected value from [`contrast_math::detection_threshold`] otherwise.

use contrast_math::{detection_threshold, interp_or_nan, sample_std};
use log::{debug, warn};
use ndarray::{ArrayView2, ArrayView3, Axis};
use serde::{Deserialize, Serialize};

use crate::error::ContrastError;
use crate::units::pixels_to_arcsec;

/// Contrast versus separation for one KL truncation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawContrastCurve {
    /// Position of this truncation in the residual cube
    pub kl_index: usize,
    /// Number of KL modes used for this truncation
    pub kl_mode: usize,
    /// Plate scale used to express separations on the sky
    pub pixel_scale_mas: f64,
    /// Annulus radii, increasing
    pub separations_px: Vec<f64>,
    /// Contrast at each radius; NaN where undefined
    #[serde(with = "crate::serde_float::vec")]
    pub contrasts: Vec<f64>,
}

impl RawContrastCurve {
    pub fn len(&self) -> usize {
        self.separations_px.len()
    }

    pub fn is_empty(&self) -> bool {
        self.separations_px.is_empty()
    }

    /// Separations in arcseconds.
    pub fn separations_arcsec(&self) -> Vec<f64> {
        self.separations_px
            .iter()
            .map(|&sep| pixels_to_arcsec(sep, self.pixel_scale_mas))
            .collect()
    }

    /// Linearly interpolated contrast at `separation_px`, NaN outside the curve.
    pub fn contrast_at(&self, separation_px: f64) -> f64 {
        interp_or_nan(separation_px, &self.separations_px, &self.contrasts)
    }
}

/// Sampling settings for [`estimate_raw_contrast`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawContrastParams {
    /// First annulus radius in pixels
    pub inner_working_angle_px: f64,
    /// Largest annulus radius in pixels
    pub outer_working_angle_px: f64,
    /// Annulus width and spacing in pixels (one resolution element)
    pub resolution_px: f64,
    /// Star peak surface brightness the noise is divided by
    pub normalization: f64,
    /// Gaussian-equivalent detection significance
    pub detection_sigma: f64,
    /// Resolution-element count below which the small-sample correction applies
    pub small_sample_elements: usize,
}

impl RawContrastParams {
    fn validate(&self) -> Result<(), ContrastError> {
        let positive = |value: f64| value.is_finite() && value > 0.0;

        if !(self.inner_working_angle_px.is_finite() && self.inner_working_angle_px >= 0.0) {
            return Err(ContrastError::InvalidInput(format!(
                "inner working angle must be non-negative, got {}",
                self.inner_working_angle_px
            )));
        }
        if !self.outer_working_angle_px.is_finite()
            || self.outer_working_angle_px < self.inner_working_angle_px
        {
            return Err(ContrastError::InvalidInput(format!(
                "outer working angle {} must not be below inner working angle {}",
                self.outer_working_angle_px, self.inner_working_angle_px
            )));
        }
        if !positive(self.resolution_px) {
            return Err(ContrastError::InvalidInput(format!(
                "resolution must be positive, got {}",
                self.resolution_px
            )));
        }
        if !positive(self.normalization) {
            return Err(ContrastError::InvalidInput(format!(
                "normalization must be positive, got {}",
                self.normalization
            )));
        }
        if !positive(self.detection_sigma) {
            return Err(ContrastError::InvalidInput(format!(
                "detection sigma must be positive, got {}",
                self.detection_sigma
            )));
        }
        Ok(())
    }

    /// Annulus radii from the inner to the outer working angle.
    pub fn radii(&self) -> Vec<f64> {
        let count =
            ((self.outer_working_angle_px - self.inner_working_angle_px) / self.resolution_px)
                .floor() as usize
                + 1;
        (0..count)
            .map(|i| self.inner_working_angle_px + i as f64 * self.resolution_px)
            .collect()
    }
}

/// Pixels of an annulus
#[derive(Debug, Clone, PartialEq)]
pub struct AnnulusSample {
    /// Non-NaN pixel values
    pub values: Vec<f64>,
    /// Pixels in the annulus footprint, masked or not
    pub footprint: usize,
}

impl AnnulusSample {
    /// Fraction of the footprint that carries valid data.
    pub fn valid_fraction(&self) -> f64 {
        if self.footprint == 0 {
            0.0
        } else {
            self.values.len() as f64 / self.footprint as f64
        }
    }
}

/// Collect pixels whose distance from `center` lies in `[radius - width/2, radius + width/2)`.
pub fn annulus_pixels(
    frame: &ArrayView2<f64>,
    center: (f64, f64),
    radius: f64,
    width: f64,
) -> AnnulusSample {
    let inner = (radius - width / 2.0).max(0.0);
    let outer = radius + width / 2.0;
    let (height, frame_width) = frame.dim();

    // Only visit the bounding box of the annulus
    let x_min = (center.0 - outer).floor().max(0.0) as usize;
    let x_max = ((center.0 + outer).ceil().max(0.0) as usize).min(frame_width.saturating_sub(1));
    let y_min = (center.1 - outer).floor().max(0.0) as usize;
    let y_max = ((center.1 + outer).ceil().max(0.0) as usize).min(height.saturating_sub(1));

    let mut values = Vec::new();
    let mut footprint = 0;
    if height == 0 || frame_width == 0 {
        return AnnulusSample { values, footprint };
    }

    for y in y_min..=y_max {
        for x in x_min..=x_max {
            let dx = x as f64 - center.0;
            let dy = y as f64 - center.1;
            let distance = (dx * dx + dy * dy).sqrt();
            if distance >= inner && distance < outer {
                footprint += 1;
                let value = frame[[y, x]];
                if !value.is_nan() {
                    values.push(value);
                }
            }
        }
    }

    AnnulusSample { values, footprint }
}

/// Contrast at one radius of one frame; NaN when the annulus cannot support an estimate.
fn contrast_at_radius(
    frame: &ArrayView2<f64>,
    center: (f64, f64),
    radius: f64,
    params: &RawContrastParams,
) -> f64 {
    let annulus = annulus_pixels(frame, center, radius, params.resolution_px);
    if annulus.values.is_empty() {
        return f64::NAN;
    }

    // Independent resolution elements around the full circle, scaled by the
    // fraction of the annulus that survived masking
    let circle_elements =
        ((2.0 * std::f64::consts::PI * radius / params.resolution_px).floor()).max(1.0);
    let n_elements = (circle_elements * annulus.valid_fraction()).floor() as usize;

    let threshold = match detection_threshold(
        n_elements,
        params.detection_sigma,
        params.small_sample_elements,
    ) {
        Ok(threshold) => threshold,
        Err(e) => {
            debug!("No detection threshold at r = {radius:.2} px: {e}");
            return f64::NAN;
        }
    };

    match sample_std(&annulus.values) {
        Ok(std) => threshold * std / params.normalization,
        Err(e) => {
            debug!("No noise estimate at r = {radius:.2} px: {e}");
            f64::NAN
        }
    }
}

/// Raw contrast curve of a single residual frame.
pub fn estimate_frame_contrast(
    frame: &ArrayView2<f64>,
    center: (f64, f64),
    params: &RawContrastParams,
    kl_index: usize,
    kl_mode: usize,
    pixel_scale_mas: f64,
) -> Result<RawContrastCurve, ContrastError> {
    params.validate()?;

    let separations_px = params.radii();
    let contrasts: Vec<f64> = separations_px
        .iter()
        .map(|&radius| contrast_at_radius(frame, center, radius, params))
        .collect();

    let undefined = contrasts.iter().filter(|c| c.is_nan()).count();
    if undefined == contrasts.len() {
        warn!("Raw contrast for KL index {kl_index} is undefined at every separation");
    } else if undefined > 0 {
        debug!(
            "Raw contrast for KL index {kl_index}: {undefined} of {} separations undefined",
            contrasts.len()
        );
    }

    Ok(RawContrastCurve {
        kl_index,
        kl_mode,
        pixel_scale_mas,
        separations_px,
        contrasts,
    })
}

/// Raw contrast curves for every frame of a masked residual cube.
///
/// `kl_modes` labels the frames and must have one entry per frame. Radii
/// whose annulus has no valid pixels, or too few resolution elements for a
/// noise estimate, get NaN contrast.
pub fn estimate_raw_contrast(
    masked_cube: &ArrayView3<f64>,
    kl_modes: &[usize],
    pixel_scale_mas: f64,
    center: (f64, f64),
    params: &RawContrastParams,
) -> Result<Vec<RawContrastCurve>, ContrastError> {
    if masked_cube.len_of(Axis(0)) != kl_modes.len() {
        return Err(ContrastError::LengthMismatch {
            what: "residual frames and KL modes",
            left: masked_cube.len_of(Axis(0)),
            right: kl_modes.len(),
        });
    }

    masked_cube
        .axis_iter(Axis(0))
        .zip(kl_modes)
        .enumerate()
        .map(|(kl_index, (frame, &kl_mode))| {
            estimate_frame_contrast(&frame, center, params, kl_index, kl_mode, pixel_scale_mas)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{s, Array2, Array3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn params(normalization: f64) -> RawContrastParams {
        RawContrastParams {
            inner_working_angle_px: 4.0,
            outer_working_angle_px: 28.0,
            resolution_px: 2.0,
            normalization,
            detection_sigma: 5.0,
            small_sample_elements: 20,
        }
    }

    fn noise_cube(frames: usize, size: usize, sigma: f64, seed: u64) -> Array3<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, sigma).unwrap();
        Array3::from_shape_simple_fn((frames, size, size), || normal.sample(&mut rng))
    }

    #[test]
    fn test_radii_span_working_angles() {
        let radii = params(1.0).radii();
        assert_eq!(radii.first(), Some(&4.0));
        assert_eq!(radii.last(), Some(&28.0));
        assert_eq!(radii.len(), 13);
    }

    #[test]
    fn test_gaussian_noise_gives_expected_contrast() {
        let cube = noise_cube(3, 65, 1.0, 7);
        let curves = estimate_raw_contrast(
            &cube.view(),
            &[1, 5, 10],
            60.0,
            (32.0, 32.0),
            &params(100.0),
        )
        .unwrap();

        assert_eq!(curves.len(), 3);
        for curve in &curves {
            // Outer radii have plenty of pixels and resolution elements
            for (&sep, &contrast) in curve.separations_px.iter().zip(&curve.contrasts) {
                if sep >= 12.0 {
                    assert_relative_eq!(contrast, 0.05, epsilon = 0.0125);
                }
            }
        }
    }

    #[test]
    fn test_large_annulus_uses_plain_sigma_threshold() {
        let cube = noise_cube(1, 65, 2.0, 11);
        let frame = cube.index_axis(Axis(0), 0);
        let p = params(10.0);
        let curve = estimate_frame_contrast(&frame, (32.0, 32.0), &p, 0, 1, 60.0).unwrap();

        // r = 20 px holds floor(2*pi*20/2) = 62 elements
        let idx = curve.separations_px.iter().position(|&r| r == 20.0).unwrap();
        let annulus = annulus_pixels(&frame, (32.0, 32.0), 20.0, 2.0);
        let expected = 5.0 * sample_std(&annulus.values).unwrap() / 10.0;
        assert_eq!(curve.contrasts[idx], expected);
    }

    #[test]
    fn test_fully_masked_annulus_is_nan() {
        let mut frame = noise_cube(1, 65, 1.0, 3)
            .index_axis(Axis(0), 0)
            .to_owned();
        for y in 0..65 {
            for x in 0..65 {
                let r = ((x as f64 - 32.0).powi(2) + (y as f64 - 32.0).powi(2)).sqrt();
                if (9.0..11.0).contains(&r) {
                    frame[[y, x]] = f64::NAN;
                }
            }
        }

        let curve =
            estimate_frame_contrast(&frame.view(), (32.0, 32.0), &params(1.0), 0, 1, 60.0)
                .unwrap();
        let idx = curve.separations_px.iter().position(|&r| r == 10.0).unwrap();
        assert!(curve.contrasts[idx].is_nan());
        assert!(curve.contrasts[idx + 1].is_finite());
    }

    #[test]
    fn test_partial_masking_inflates_threshold() {
        let cube = noise_cube(1, 65, 1.0, 5);
        let full = cube.index_axis(Axis(0), 0).to_owned();
        let mut half = full.clone();
        half.slice_mut(s![.., ..32]).fill(f64::NAN);

        let p = params(1.0);
        let radius_idx = 0; // r = 4 px: 12 elements on the full circle
        let full_curve = estimate_frame_contrast(&full.view(), (32.0, 32.0), &p, 0, 1, 60.0).unwrap();
        let half_curve = estimate_frame_contrast(&half.view(), (32.0, 32.0), &p, 0, 1, 60.0).unwrap();

        let full_annulus = annulus_pixels(&full.view(), (32.0, 32.0), 4.0, 2.0);
        let half_annulus = annulus_pixels(&half.view(), (32.0, 32.0), 4.0, 2.0);
        let full_tau = full_curve.contrasts[radius_idx] / sample_std(&full_annulus.values).unwrap();
        let half_tau = half_curve.contrasts[radius_idx] / sample_std(&half_annulus.values).unwrap();

        assert!(full_tau > 5.0);
        assert!(half_tau > full_tau);
    }

    #[test]
    fn test_frame_count_must_match_kl_modes() {
        let cube = Array3::<f64>::zeros((2, 9, 9));
        let err = estimate_raw_contrast(&cube.view(), &[1], 60.0, (4.0, 4.0), &params(1.0))
            .unwrap_err();
        assert!(matches!(err, ContrastError::LengthMismatch { .. }));
    }

    #[test]
    fn test_invalid_normalization_is_rejected() {
        let frame = Array2::<f64>::zeros((9, 9));
        assert!(
            estimate_frame_contrast(&frame.view(), (4.0, 4.0), &params(0.0), 0, 1, 60.0).is_err()
        );
    }

    #[test]
    fn test_curve_lookup_and_sky_units() {
        let curve = RawContrastCurve {
            kl_index: 0,
            kl_mode: 5,
            pixel_scale_mas: 100.0,
            separations_px: vec![10.0, 20.0],
            contrasts: vec![1e-4, 2e-4],
        };
        assert_relative_eq!(curve.contrast_at(15.0), 1.5e-4, epsilon = 1e-16);
        assert!(curve.contrast_at(25.0).is_nan());
        assert_eq!(curve.separations_arcsec(), vec![1.0, 2.0]);
    }
}
