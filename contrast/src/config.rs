//! Pipeline configuration.
//!
//! A [`ContrastConfig`] holds every tunable of a contrast run and is stored
//! as JSON. Fields missing from a file take their defaults, so a config file
//! only needs to list what differs.

use std::fmt;
use std::path::Path;

use contrast_math::LsqOptions;
use serde::{Deserialize, Serialize};

use crate::cube::{KnownSource, OcculterGeometry};
use crate::error::ContrastError;

/// One processing configuration applied to one dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Reduction mode label passed to the combination engine (e.g. "ADI+RDI")
    pub mode: String,
    /// Number of annuli the engine splits the image into
    pub annuli: usize,
    /// Number of azimuthal subsections per annulus
    pub subsections: usize,
    /// Catalog key of the observation
    pub dataset_key: String,
}

impl ScenarioConfig {
    pub fn new(mode: &str, annuli: usize, subsections: usize, dataset_key: &str) -> Self {
        Self {
            mode: mode.to_string(),
            annuli,
            subsections,
            dataset_key: dataset_key.to_string(),
        }
    }

    /// Label of the processing configuration, shared by all datasets.
    pub fn label(&self) -> String {
        format!("{}_annu{}_subs{}", self.mode, self.annuli, self.subsections)
    }
}

impl fmt::Display for ScenarioConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.label(), self.dataset_key)
    }
}

/// Candidate injection sites: every separation paired with every position angle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteGrid {
    /// Separations in pixels
    pub separations_px: Vec<f64>,
    /// Position angles in degrees, north through east
    pub position_angles_deg: Vec<f64>,
}

impl SiteGrid {
    pub fn len(&self) -> usize {
        self.separations_px.len() * self.position_angles_deg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SiteGrid {
    fn default() -> Self {
        Self {
            separations_px: vec![6.0, 9.0, 12.0, 15.0, 18.0, 21.0, 24.0],
            position_angles_deg: vec![0.0, 45.0, 90.0, 135.0, 180.0, 225.0, 270.0, 315.0],
        }
    }
}

/// Throughput model fit settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThroughputFitConfig {
    /// Starting `[amplitude, offset, exponent, rate, midpoint]`
    pub initial_guess: [f64; 5],
    /// Solver iteration cap
    pub max_iterations: usize,
    /// Relative cost tolerance
    pub ftol: f64,
    /// Relative step tolerance
    pub xtol: f64,
    /// RMS throughput misfit at which the fit is accepted
    pub rms_tolerance: f64,
    /// Accepted solver steps per stall check
    pub stall_window: usize,
    /// Relative cost reduction per stall window below which the fit is final
    pub stall_tol: f64,
}

impl Default for ThroughputFitConfig {
    fn default() -> Self {
        let lsq = LsqOptions::default();
        Self {
            initial_guess: [1.0, 0.0, 1.0, 0.2, 15.0],
            max_iterations: lsq.max_iterations,
            ftol: lsq.ftol,
            xtol: lsq.xtol,
            rms_tolerance: 3e-4,
            stall_window: lsq.stall_window,
            stall_tol: lsq.stall_tol,
        }
    }
}

impl ThroughputFitConfig {
    /// Solver options for a fit to `samples` points.
    pub fn lsq_options(&self, samples: usize) -> LsqOptions {
        LsqOptions {
            max_iterations: self.max_iterations,
            ftol: self.ftol,
            xtol: self.xtol,
            cost_tol: 0.5 * samples as f64 * self.rms_tolerance * self.rms_tolerance,
            stall_window: self.stall_window,
            stall_tol: self.stall_tol,
            ..LsqOptions::default()
        }
    }
}

/// Configuration of a contrast run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContrastConfig {
    /// Reduction modes to evaluate
    pub modes: Vec<String>,
    /// Annulus counts to evaluate
    pub annuli: Vec<usize>,
    /// Subsection counts to evaluate
    pub subsections: Vec<usize>,
    /// KL truncations requested from the combination engine
    pub kl_modes: Vec<usize>,
    /// KL truncation used for injection and calibration; `None` picks the last
    pub kl_index: Option<usize>,
    /// Smallest separation of the raw curve, in pixels
    pub inner_working_angle_px: f64,
    /// Largest separation of the raw curve, in pixels
    pub outer_working_angle_px: f64,
    /// Annulus width and spacing, in units of the FWHM
    pub resolution_fwhm: f64,
    /// Gaussian-equivalent detection significance (e.g. 5.0 for 5-sigma)
    pub detection_sigma: f64,
    /// Below this many resolution elements the Student-t correction applies
    pub small_sample_elements: usize,
    /// Known-companion mask radius, in units of the FWHM
    pub companion_mask_fwhm: f64,
    /// Minimum distance between injected companions and from known sources, in FWHM
    pub injection_exclusion_fwhm: f64,
    /// Injected flux as a multiple of the raw contrast at the site separation
    pub injection_contrast_multiplier: f64,
    /// Radius of the matched-filter recovery aperture, in FWHM
    pub recovery_radius_fwhm: f64,
    /// Known off-axis sources to mask and avoid
    pub known_sources: Vec<KnownSource>,
    /// Coronagraph mask names that are bar occulters
    pub bar_masks: Vec<String>,
    /// Unobstructed position-angle ranges of the bar occulters
    pub bar_slices: OcculterGeometry,
    /// Injection grid for round occulters
    pub round_grid: SiteGrid,
    /// Injection grid for bar occulters
    pub bar_grid: SiteGrid,
    /// Throughput fit settings
    pub fit: ThroughputFitConfig,
    /// Injection worker threads; 0 uses the rayon default
    pub workers: usize,
    /// Fraction of failed injection sites above which a scenario fails
    pub max_trial_failure_rate: f64,
    /// Recompute artifacts even when they are already stored
    pub overwrite: bool,
}

impl Default for ContrastConfig {
    fn default() -> Self {
        Self {
            modes: vec!["ADI+RDI".to_string()],
            annuli: vec![1],
            subsections: vec![1],
            kl_modes: vec![1, 2, 5, 10, 20, 50],
            kl_index: None,
            inner_working_angle_px: 4.0,
            outer_working_angle_px: 30.0,
            resolution_fwhm: 2.0,
            detection_sigma: 5.0,
            small_sample_elements: 20,
            companion_mask_fwhm: 12.0,
            injection_exclusion_fwhm: 10.0,
            injection_contrast_multiplier: 5.0,
            recovery_radius_fwhm: 1.0,
            known_sources: Vec::new(),
            bar_masks: vec!["MASKASWB".to_string(), "MASKALWB".to_string()],
            bar_slices: OcculterGeometry::full_circle(),
            round_grid: SiteGrid::default(),
            bar_grid: SiteGrid::default(),
            fit: ThroughputFitConfig::default(),
            workers: 0,
            max_trial_failure_rate: 0.5,
            overwrite: false,
        }
    }
}

impl ContrastConfig {
    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }

    /// Load from JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Check ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ContrastError> {
        let positive = |name: &str, value: f64| {
            if value.is_finite() && value > 0.0 {
                Ok(())
            } else {
                Err(ContrastError::InvalidInput(format!(
                    "{name} must be positive, got {value}"
                )))
            }
        };

        positive("resolution_fwhm", self.resolution_fwhm)?;
        positive("detection_sigma", self.detection_sigma)?;
        positive("companion_mask_fwhm", self.companion_mask_fwhm)?;
        positive("injection_contrast_multiplier", self.injection_contrast_multiplier)?;
        positive("recovery_radius_fwhm", self.recovery_radius_fwhm)?;

        if !(self.injection_exclusion_fwhm.is_finite() && self.injection_exclusion_fwhm >= 0.0) {
            return Err(ContrastError::InvalidInput(format!(
                "injection_exclusion_fwhm must be non-negative, got {}",
                self.injection_exclusion_fwhm
            )));
        }
        if !(0.0..=1.0).contains(&self.max_trial_failure_rate) {
            return Err(ContrastError::InvalidInput(format!(
                "max_trial_failure_rate must be within [0, 1], got {}",
                self.max_trial_failure_rate
            )));
        }
        if self.kl_modes.is_empty() {
            return Err(ContrastError::InvalidInput(
                "at least one KL truncation is required".to_string(),
            ));
        }
        if let Some(index) = self.kl_index {
            if index >= self.kl_modes.len() {
                return Err(ContrastError::InvalidInput(format!(
                    "kl_index {index} out of range for {} KL truncations",
                    self.kl_modes.len()
                )));
            }
        }
        for source in &self.known_sources {
            source.validate()?;
        }
        self.bar_slices.validate()
    }

    /// KL truncation used for injection and calibration.
    pub fn selected_kl_index(&self) -> usize {
        self.kl_index
            .unwrap_or_else(|| self.kl_modes.len().saturating_sub(1))
    }

    pub fn is_bar_mask(&self, mask: &str) -> bool {
        self.bar_masks.iter().any(|m| m == mask)
    }

    /// Injection grid for the given coronagraph mask.
    pub fn grid_for(&self, mask: &str) -> &SiteGrid {
        if self.is_bar_mask(mask) {
            &self.bar_grid
        } else {
            &self.round_grid
        }
    }

    /// Cartesian product of processing configurations and datasets.
    pub fn scenarios(&self, dataset_keys: &[String]) -> Vec<ScenarioConfig> {
        let mut scenarios = Vec::new();
        for mode in &self.modes {
            for &annuli in &self.annuli {
                for &subsections in &self.subsections {
                    for key in dataset_keys {
                        scenarios.push(ScenarioConfig::new(mode, annuli, subsections, key));
                    }
                }
            }
        }
        scenarios
    }
}
