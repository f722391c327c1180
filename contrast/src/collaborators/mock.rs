//! Synthetic collaborators for tests and demonstrations.
//!
//! [`GaussianPsfProvider`] models the PSF as a circular Gaussian with an
//! optional coronagraphic transmission profile, [`MockCombinationEngine`]
//! derotates and averages rolls and applies a fixed throughput, and
//! [`InMemoryCatalog`] serves observations built by
//! [`SyntheticObservation`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use contrast_math::rotate_image;
use ndarray::{Array2, Array3, ArrayD, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use super::{
    CollaboratorError, CollaboratorResult, CombinationEngine, Observation, ObservationCatalog,
    PsfProvider, RollExposure,
};
use crate::config::ScenarioConfig;
use crate::cube::RollInfo;
use crate::error::ContrastError;

const FWHM_TO_SIGMA: f64 = 2.354_820_045_030_949;

/// Circular Gaussian PSF normalized to unit total flux.
#[derive(Debug)]
pub struct GaussianPsfProvider {
    fwhm_px: f64,
    size: usize,
    /// 50% transmission radius of the coronagraph, in pixels
    occulter_radius_px: Option<f64>,
    calls: AtomicUsize,
}

impl GaussianPsfProvider {
    /// `size` is rounded up to the next odd number.
    pub fn new(fwhm_px: f64, size: usize) -> Self {
        Self {
            fwhm_px,
            size: size | 1,
            occulter_radius_px: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Attenuate occulted PSFs by `1 - 2^-(r / radius)^2`, a smooth inner working angle.
    pub fn with_occulter_radius(mut self, radius_px: f64) -> Self {
        self.occulter_radius_px = Some(radius_px);
        self
    }

    /// Number of PSFs served so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Transmission of the coronagraph at detector offset `(dx, dy)`.
    pub fn transmission(&self, position: Option<(f64, f64)>) -> f64 {
        match (self.occulter_radius_px, position) {
            (Some(radius), Some((dx, dy))) if radius > 0.0 => {
                let r2 = (dx * dx + dy * dy) / (radius * radius);
                1.0 - 0.5f64.powf(r2)
            }
            _ => 1.0,
        }
    }

    fn stamp(&self) -> Array2<f64> {
        let sigma = self.fwhm_px / FWHM_TO_SIGMA;
        let half = (self.size / 2) as f64;
        let stamp = Array2::from_shape_fn((self.size, self.size), |(y, x)| {
            let dx = x as f64 - half;
            let dy = y as f64 - half;
            (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
        });
        let total = stamp.sum();
        stamp / total
    }
}

impl PsfProvider for GaussianPsfProvider {
    fn offset_psf(
        &self,
        _filter: &str,
        _mask: &str,
        position: Option<(f64, f64)>,
    ) -> CollaboratorResult<Array2<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !(self.fwhm_px.is_finite() && self.fwhm_px > 0.0) {
            return Err(CollaboratorError::Psf(format!(
                "invalid FWHM {}",
                self.fwhm_px
            )));
        }
        Ok(self.stamp() * self.transmission(position))
    }
}

/// Combination engine that derotates, averages and scales.
///
/// Every KL truncation gets the same frame: the integration-time weighted
/// mean of the derotated rolls multiplied by `throughput`. Rolls are
/// assumed to share one star position.
pub struct MockCombinationEngine {
    throughput: f64,
    fail_with: Option<String>,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    scenarios: Mutex<Vec<String>>,
}

impl MockCombinationEngine {
    pub fn new(throughput: f64) -> Self {
        Self {
            throughput,
            fail_with: None,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            scenarios: Mutex::new(Vec::new()),
        }
    }

    /// Hold every `combine` call for `latency` so concurrent calls overlap.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Engine whose every call fails with `message`.
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new(1.0)
        }
    }

    /// Number of `combine` calls so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Largest number of `combine` calls that ran at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Scenario labels seen so far, in call order
    pub fn scenarios_seen(&self) -> Vec<String> {
        self.scenarios
            .lock()
            .map(|seen| seen.clone())
            .unwrap_or_default()
    }

    fn combine_rolls(
        &self,
        rolls: &[RollExposure],
        kl_modes: &[usize],
    ) -> CollaboratorResult<ArrayD<f64>> {
        if let Some(message) = &self.fail_with {
            return Err(CollaboratorError::Combination(message.clone()));
        }

        let combined = derotate_and_combine(rolls)? * self.throughput;
        let (height, width) = combined.dim();
        let mut cube = Array3::<f64>::zeros((kl_modes.len(), height, width));
        for mut frame in cube.axis_iter_mut(Axis(0)) {
            frame.assign(&combined);
        }
        Ok(cube.into_dyn())
    }
}

/// Integration-time weighted mean of derotated rolls.
pub fn derotate_and_combine(rolls: &[RollExposure]) -> CollaboratorResult<Array2<f64>> {
    let first = rolls
        .first()
        .ok_or_else(|| CollaboratorError::Combination("no rolls to combine".to_string()))?;
    let (_, height, width) = first.frames.dim();
    let total_time: f64 = rolls.iter().map(|r| r.info.integration_time_s).sum();
    if !(total_time > 0.0) {
        return Err(CollaboratorError::Combination(
            "total integration time must be positive".to_string(),
        ));
    }

    let mut combined = Array2::<f64>::zeros((height, width));
    for roll in rolls {
        if roll.frames.dim().1 != height || roll.frames.dim().2 != width {
            return Err(CollaboratorError::Combination(format!(
                "roll frames {:?} do not match {:?}",
                roll.frames.dim(),
                (height, width)
            )));
        }
        let mean = roll.frames.mean_axis(Axis(0)).ok_or_else(|| {
            CollaboratorError::Combination("roll has no integrations".to_string())
        })?;
        let derotated = rotate_image(&mean.view(), roll.info.roll_angle_deg, roll.center, f64::NAN);
        combined.scaled_add(roll.info.integration_time_s / total_time, &derotated);
    }
    Ok(combined)
}

impl CombinationEngine for MockCombinationEngine {
    fn combine(
        &self,
        scenario: &ScenarioConfig,
        rolls: &[RollExposure],
        kl_modes: &[usize],
    ) -> CollaboratorResult<ArrayD<f64>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.scenarios.lock() {
            seen.push(scenario.label());
        }

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        let result = self.combine_rolls(rolls, kl_modes);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Catalog backed by a map of prepared observations.
#[derive(Default)]
pub struct InMemoryCatalog {
    observations: HashMap<String, Observation>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, observation: Observation) {
        self.observations
            .insert(observation.dataset_key.clone(), observation);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.observations.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl ObservationCatalog for InMemoryCatalog {
    fn observation(&self, dataset_key: &str) -> CollaboratorResult<Observation> {
        self.observations
            .get(dataset_key)
            .cloned()
            .ok_or_else(|| CollaboratorError::Catalog(format!("unknown dataset {dataset_key}")))
    }
}

/// Parameters of a synthetic observation
#[derive(Debug, Clone)]
pub struct SyntheticObservation {
    pub dataset_key: String,
    pub filter: String,
    pub mask: String,
    /// Image side length in pixels
    pub size: usize,
    pub pixel_scale_mas: f64,
    pub wavelength_m: f64,
    pub aperture_diameter_m: f64,
    pub star_magnitude: f64,
    pub zero_point_jy: f64,
    /// Standard deviation of the white noise in each integration, MJy/sr
    pub noise_sigma: f64,
    /// `(roll angle, integration time)` per roll
    pub rolls: Vec<(f64, f64)>,
    pub integrations_per_roll: usize,
    pub seed: u64,
}

impl Default for SyntheticObservation {
    fn default() -> Self {
        Self {
            dataset_key: "synthetic".to_string(),
            filter: "F444W".to_string(),
            mask: "MASK335R".to_string(),
            size: 101,
            pixel_scale_mas: 63.0,
            wavelength_m: 4.4e-6,
            aperture_diameter_m: 6.5,
            star_magnitude: 6.0,
            zero_point_jy: 280.0,
            noise_sigma: 1.0,
            rolls: vec![(0.0, 500.0), (10.0, 500.0)],
            integrations_per_roll: 2,
            seed: 42,
        }
    }
}

impl SyntheticObservation {
    /// Draw seeded white-noise integrations for every roll.
    pub fn build(&self) -> Result<Observation, ContrastError> {
        let normal = Normal::new(0.0, self.noise_sigma).map_err(|e| {
            ContrastError::InvalidInput(format!("noise sigma {}: {e}", self.noise_sigma))
        })?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let half = (self.size as f64 - 1.0) / 2.0;

        let rolls = self
            .rolls
            .iter()
            .map(|&(roll_angle_deg, integration_time_s)| RollExposure {
                info: RollInfo {
                    roll_angle_deg,
                    integration_time_s,
                },
                frames: Array3::from_shape_simple_fn(
                    (self.integrations_per_roll, self.size, self.size),
                    || normal.sample(&mut rng),
                ),
                center: (half, half),
            })
            .collect();

        Ok(Observation {
            dataset_key: self.dataset_key.clone(),
            filter: self.filter.clone(),
            mask: self.mask.clone(),
            pixel_scale_mas: self.pixel_scale_mas,
            center: (half, half),
            wavelength_m: self.wavelength_m,
            aperture_diameter_m: self.aperture_diameter_m,
            star_magnitude: self.star_magnitude,
            zero_point_jy: self.zero_point_jy,
            rolls,
        })
    }
}
