//! Interfaces to the external systems the pipeline depends on.
//!
//! The PSF model, the KLIP image-combination engine and the observation
//! catalog are owned by other components. The pipeline only sees them
//! through these traits, which can be backed by the real implementations or
//! by the synthetic ones in [`mock`] for testing.

pub mod mock;

use ndarray::{Array2, Array3, ArrayD};
use thiserror::Error;

use crate::config::ScenarioConfig;
use crate::cube::RollInfo;
use crate::error::ContrastError;
use crate::units::fwhm_pixels;

/// Failure reported by an external collaborator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    /// PSF model could not produce a PSF
    #[error("PSF model error: {0}")]
    Psf(String),
    /// Image combination failed
    #[error("combination engine error: {0}")]
    Combination(String),
    /// Observation lookup failed
    #[error("observation catalog error: {0}")]
    Catalog(String),
}

/// Result type for collaborator calls
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Images taken at one telescope roll angle.
#[derive(Debug, Clone)]
pub struct RollExposure {
    /// Roll angle and exposure time
    pub info: RollInfo,
    /// Integrations, shape `(integrations, rows, cols)`, in MJy/sr
    pub frames: Array3<f64>,
    /// Star position on the detector, `(x, y)`
    pub center: (f64, f64),
}

/// Everything the pipeline needs to know about one observation.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Catalog key
    pub dataset_key: String,
    /// Instrument filter name
    pub filter: String,
    /// Coronagraph mask name
    pub mask: String,
    /// Plate scale in milliarcseconds per pixel
    pub pixel_scale_mas: f64,
    /// Star position on the combined (derotated) image, `(x, y)`
    pub center: (f64, f64),
    /// Central wavelength of the filter in meters
    pub wavelength_m: f64,
    /// Telescope aperture diameter in meters
    pub aperture_diameter_m: f64,
    /// Host star Vega magnitude in this filter
    pub star_magnitude: f64,
    /// Filter zero point in Jy
    pub zero_point_jy: f64,
    /// Science exposures, one entry per roll
    pub rolls: Vec<RollExposure>,
}

impl Observation {
    /// Diffraction FWHM in pixels.
    pub fn fwhm_px(&self) -> f64 {
        fwhm_pixels(self.wavelength_m, self.aperture_diameter_m, self.pixel_scale_mas)
    }

    pub fn roll_info(&self) -> Vec<RollInfo> {
        self.rolls.iter().map(|roll| roll.info).collect()
    }

    /// Reject observations whose metadata cannot support a contrast estimate.
    pub fn validate(&self) -> Result<(), ContrastError> {
        let checks = [
            ("pixel scale", self.pixel_scale_mas),
            ("wavelength", self.wavelength_m),
            ("aperture diameter", self.aperture_diameter_m),
            ("zero point", self.zero_point_jy),
        ];
        for (name, value) in checks {
            if !(value.is_finite() && value > 0.0) {
                return Err(ContrastError::InvalidInput(format!(
                    "{}: {name} must be positive, got {value}",
                    self.dataset_key
                )));
            }
        }
        if !self.star_magnitude.is_finite() {
            return Err(ContrastError::InvalidInput(format!(
                "{}: star magnitude must be finite",
                self.dataset_key
            )));
        }
        if self.rolls.is_empty() {
            return Err(ContrastError::InvalidInput(format!(
                "{}: observation has no rolls",
                self.dataset_key
            )));
        }
        Ok(())
    }
}

/// Source of model PSFs
pub trait PsfProvider: Send + Sync {
    /// PSF for `filter` and coronagraph `mask`, normalized to unit total flux.
    ///
    /// # Arguments
    /// * `position` - Detector offset `(dx, dy)` from the coronagraph center in
    ///   pixels, or `None` for the unocculted PSF
    ///
    /// # Returns
    /// * `Ok(psf)` - Odd-sized stamp with the PSF centered on the middle pixel
    /// * `Err(CollaboratorError)` if the model cannot be evaluated
    fn offset_psf(
        &self,
        filter: &str,
        mask: &str,
        position: Option<(f64, f64)>,
    ) -> CollaboratorResult<Array2<f64>>;
}

/// KLIP image-combination engine
pub trait CombinationEngine: Send + Sync {
    /// Reduce roll exposures into a derotated residual cube.
    ///
    /// # Returns
    /// * `Ok(cube)` - One residual frame per entry of `kl_modes`, on the sky
    ///   frame (north up, east left), centered on [`Observation::center`]
    /// * `Err(CollaboratorError)` if the reduction fails
    fn combine(
        &self,
        scenario: &ScenarioConfig,
        rolls: &[RollExposure],
        kl_modes: &[usize],
    ) -> CollaboratorResult<ArrayD<f64>>;
}

/// Lookup of observations by dataset key
pub trait ObservationCatalog: Send + Sync {
    fn observation(&self, dataset_key: &str) -> CollaboratorResult<Observation>;
}
