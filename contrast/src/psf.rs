//! Reference PSF as it appears in a roll-combined image.
//!
//! An off-axis source observed at several roll angles is derotated by the
//! combination engine, so its image in the residual cube is the average of
//! the detector PSF rotated by each roll, weighted by integration time.

use contrast_math::rotate_image;
use log::debug;
use ndarray::{Array2, ArrayView2};

use crate::collaborators::PsfProvider;
use crate::cube::RollInfo;
use crate::error::ContrastError;

/// Unocculted PSF of the combined image
#[derive(Debug, Clone)]
pub struct ReferencePsf {
    /// PSF scaled to a peak of exactly 1
    pub template: Array2<f64>,
    /// Peak pixel of the unit-flux PSF before scaling
    pub peak: f64,
}

impl ReferencePsf {
    /// Build from the provider's unocculted PSF and the observation's rolls.
    pub fn from_provider<P: PsfProvider + ?Sized>(
        provider: &P,
        filter: &str,
        mask: &str,
        rolls: &[RollInfo],
    ) -> Result<Self, ContrastError> {
        let psf = provider.offset_psf(filter, mask, None)?;
        let combined = roll_weighted_psf(&recenter_peak(&psf.view()).view(), rolls)?;

        let peak = combined
            .iter()
            .copied()
            .filter(|v| v.is_finite())
            .fold(f64::NEG_INFINITY, f64::max);
        if !(peak.is_finite() && peak > 0.0) {
            return Err(ContrastError::InvalidInput(format!(
                "reference PSF for {filter}/{mask} has no positive peak"
            )));
        }
        debug!("Reference PSF for {filter}/{mask}: peak {peak:.4e} over {} rolls", rolls.len());

        Ok(Self {
            template: combined / peak,
            peak,
        })
    }
}

/// Shift a stamp by whole pixels so its brightest pixel sits at the middle.
///
/// Pixels shifted in from outside are zero. NaN pixels are ignored when
/// looking for the peak.
pub fn recenter_peak(psf: &ArrayView2<f64>) -> Array2<f64> {
    let (height, width) = psf.dim();
    let Some(((peak_y, peak_x), _)) = psf
        .indexed_iter()
        .filter(|(_, v)| !v.is_nan())
        .max_by(|a, b| a.1.total_cmp(b.1))
    else {
        return psf.to_owned();
    };

    let shift_y = (height / 2) as isize - peak_y as isize;
    let shift_x = (width / 2) as isize - peak_x as isize;
    if shift_x == 0 && shift_y == 0 {
        return psf.to_owned();
    }

    Array2::from_shape_fn((height, width), |(y, x)| {
        let src_y = y as isize - shift_y;
        let src_x = x as isize - shift_x;
        if src_y < 0 || src_x < 0 || src_y >= height as isize || src_x >= width as isize {
            0.0
        } else {
            psf[[src_y as usize, src_x as usize]]
        }
    })
}

/// Integration-time weighted average of `psf` rotated by each roll angle.
pub fn roll_weighted_psf(
    psf: &ArrayView2<f64>,
    rolls: &[RollInfo],
) -> Result<Array2<f64>, ContrastError> {
    let total_time: f64 = rolls.iter().map(|r| r.integration_time_s).sum();
    if rolls.iter().any(|r| r.integration_time_s < 0.0) || !(total_time > 0.0) {
        return Err(ContrastError::InvalidInput(format!(
            "roll integration times must be non-negative with a positive total, got {total_time}"
        )));
    }

    let (height, width) = psf.dim();
    let center = ((width as f64 - 1.0) / 2.0, (height as f64 - 1.0) / 2.0);

    let mut combined = Array2::<f64>::zeros((height, width));
    for roll in rolls {
        let weight = roll.integration_time_s / total_time;
        combined.scaled_add(weight, &rotate_image(psf, roll.roll_angle_deg, center, 0.0));
    }
    Ok(combined)
}
