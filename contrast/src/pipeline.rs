//! End-to-end contrast runs over many scenarios.
//!
//! Each scenario goes through observation lookup, baseline combination,
//! masking, normalization, raw contrast (cached), injection and recovery
//! (cached), throughput fitting and calibration. Scenarios are independent
//! rayon tasks; one failing scenario is recorded and never stops the others.
//! A batch runs scenarios and injection batches on one pool of
//! `ContrastConfig::workers` threads.

use std::time::Instant;

use log::{error, info};
use ndarray::{Array3, Axis};
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::artifacts::{ArtifactKey, ArtifactKind, ArtifactStore};
use crate::calibrate::{calibrate, CalibratedContrastCurve};
use crate::collaborators::{CombinationEngine, Observation, ObservationCatalog, PsfProvider};
use crate::config::{ContrastConfig, ScenarioConfig};
use crate::cube::ResidualCube;
use crate::error::ContrastError;
use crate::injection::{
    injection_pool, CancelToken, InjectionHarness, InjectionRequest, InjectionSettings,
    InjectionTable,
};
use crate::masking::{mask_bar_occulter, mask_known_sources};
use crate::psf::ReferencePsf;
use crate::raw_contrast::{estimate_frame_contrast, RawContrastCurve, RawContrastParams};
use crate::throughput::{fit_throughput, ThroughputModel};
use crate::units::star_peak_surface_brightness;

/// Everything produced for one scenario
#[derive(Debug, Clone)]
pub struct ScenarioOutcome {
    pub scenario: ScenarioConfig,
    /// One raw curve per KL truncation
    pub raw_curves: Vec<RawContrastCurve>,
    pub injection_table: InjectionTable,
    pub throughput: ThroughputModel,
    /// Calibrated curve at the selected KL truncation
    pub calibrated: CalibratedContrastCurve,
}

/// A scenario that could not be completed
#[derive(Debug)]
pub struct ScenarioFailure {
    pub scenario: ScenarioConfig,
    pub error: ContrastError,
}

/// Results of a batch run, in scenario order
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<ScenarioOutcome>,
    pub failures: Vec<ScenarioFailure>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Contrast pipeline wired to its collaborators and artifact store.
pub struct ContrastPipeline<'a, C: ?Sized, E: ?Sized, P: ?Sized, S> {
    config: &'a ContrastConfig,
    catalog: &'a C,
    engine: &'a E,
    psf: &'a P,
    store: &'a S,
    cancel: CancelToken,
}

impl<'a, C, E, P, S> ContrastPipeline<'a, C, E, P, S>
where
    C: ObservationCatalog + ?Sized,
    E: CombinationEngine + ?Sized,
    P: PsfProvider + ?Sized,
    S: ArtifactStore,
{
    pub fn new(
        config: &'a ContrastConfig,
        catalog: &'a C,
        engine: &'a E,
        psf: &'a P,
        store: &'a S,
    ) -> Self {
        Self {
            config,
            catalog,
            engine,
            psf,
            store,
            cancel: CancelToken::default(),
        }
    }

    /// Share a cancellation token with every injection run.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run every scenario of the configuration against `dataset_keys`.
    ///
    /// Fails only when the configuration itself is invalid; scenario errors
    /// are collected in the report.
    pub fn run_batch(&self, dataset_keys: &[String]) -> Result<BatchReport, ContrastError> {
        self.config.validate()?;

        let scenarios = self.config.scenarios(dataset_keys);
        let pool = injection_pool(self.config.workers)?;
        info!(
            "Running {} scenarios over {} datasets on {} threads",
            scenarios.len(),
            dataset_keys.len(),
            pool.current_num_threads()
        );

        let results: Vec<(ScenarioConfig, Result<ScenarioOutcome, ContrastError>)> =
            pool.install(|| {
                scenarios
                    .into_par_iter()
                    .map(|scenario| {
                        let result = self.run_scenario_on(&scenario, Some(&pool));
                        (scenario, result)
                    })
                    .collect()
            });

        let mut report = BatchReport::default();
        for (scenario, result) in results {
            match result {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(error) => {
                    error!("Scenario {scenario} failed: {error}");
                    report.failures.push(ScenarioFailure { scenario, error });
                }
            }
        }

        info!(
            "Batch finished: {} scenarios succeeded, {} failed",
            report.outcomes.len(),
            report.failures.len()
        );
        Ok(report)
    }

    /// Run one scenario from observation lookup to calibrated curve.
    pub fn run_scenario(&self, scenario: &ScenarioConfig) -> Result<ScenarioOutcome, ContrastError> {
        self.run_scenario_on(scenario, None)
    }

    fn run_scenario_on(
        &self,
        scenario: &ScenarioConfig,
        pool: Option<&ThreadPool>,
    ) -> Result<ScenarioOutcome, ContrastError> {
        let start = Instant::now();
        let config = self.config;
        let overwrite = config.overwrite;

        let observation = self.catalog.observation(&scenario.dataset_key)?;
        observation.validate()?;
        let fwhm_px = observation.fwhm_px();
        let kl_modes = config.kl_modes.clone();
        info!(
            "{scenario}: {} rolls, filter {}, mask {}, FWHM {:.2} px",
            observation.rolls.len(),
            observation.filter,
            observation.mask,
            fwhm_px
        );

        let data = self.engine.combine(scenario, &observation.rolls, &kl_modes)?;
        let baseline = ResidualCube::new(
            data,
            kl_modes.clone(),
            observation.center,
            observation.pixel_scale_mas,
        )?;

        let masked = self.mask(&baseline, &observation, fwhm_px)?;
        let reference = ReferencePsf::from_provider(
            self.psf,
            &observation.filter,
            &observation.mask,
            &observation.roll_info(),
        )?;
        let normalization = star_peak_surface_brightness(
            observation.star_magnitude,
            observation.zero_point_jy,
            reference.peak,
            observation.pixel_scale_mas,
        );
        info!("{scenario}: star peak surface brightness {normalization:.4e} MJy/sr");

        let params = RawContrastParams {
            inner_working_angle_px: config.inner_working_angle_px,
            outer_working_angle_px: config.outer_working_angle_px,
            resolution_px: config.resolution_fwhm * fwhm_px,
            normalization,
            detection_sigma: config.detection_sigma,
            small_sample_elements: config.small_sample_elements,
        };
        let raw_curves = kl_modes
            .iter()
            .enumerate()
            .map(|(kl_index, &kl_mode)| {
                let key = ArtifactKey::new(scenario.clone(), ArtifactKind::RawContrast, kl_index);
                self.store.get_or_compute(&key, overwrite, || {
                    estimate_frame_contrast(
                        &masked.index_axis(Axis(0), kl_index),
                        observation.center,
                        &params,
                        kl_index,
                        kl_mode,
                        observation.pixel_scale_mas,
                    )
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let kl_index = config.selected_kl_index();
        let raw_curve = raw_curves.get(kl_index).ok_or_else(|| {
            ContrastError::InvalidInput(format!("no raw curve for KL index {kl_index}"))
        })?;

        let request = InjectionRequest {
            scenario,
            observation: &observation,
            baseline: &baseline,
            kl_index,
            raw_curve,
            normalization,
            reference: &reference,
            grid: config.grid_for(&observation.mask),
            known_sources: &config.known_sources,
            valid_slices: config
                .is_bar_mask(&observation.mask)
                .then_some(&config.bar_slices),
        };
        let mut harness = InjectionHarness::new(
            self.engine,
            self.psf,
            InjectionSettings::from_config(config, fwhm_px),
        )
        .with_cancel_token(self.cancel.clone());
        if let Some(pool) = pool {
            harness = harness.with_pool(pool);
        }
        let injection_table = harness.run_injection_recovery(self.store, &request, overwrite)?;

        let throughput = fit_throughput(&injection_table, &config.fit)?;
        self.store.put_json(
            &ArtifactKey::new(scenario.clone(), ArtifactKind::ThroughputFit, kl_index),
            &throughput,
        )?;

        let calibrated = calibrate(raw_curve, &throughput);
        self.store.put_json(
            &ArtifactKey::new(scenario.clone(), ArtifactKind::CalibratedContrast, kl_index),
            &calibrated,
        )?;

        info!(
            "{scenario}: finished in {:.2}s",
            start.elapsed().as_secs_f64()
        );

        Ok(ScenarioOutcome {
            scenario: scenario.clone(),
            raw_curves,
            injection_table,
            throughput,
            calibrated,
        })
    }

    /// Mask known sources, then bar-occulter geometry when the mask is a bar.
    fn mask(
        &self,
        baseline: &ResidualCube,
        observation: &Observation,
        fwhm_px: f64,
    ) -> Result<Array3<f64>, ContrastError> {
        let masked = mask_known_sources(
            &baseline.data().view(),
            observation.pixel_scale_mas,
            observation.center,
            self.config.companion_mask_fwhm * fwhm_px,
            &self.config.known_sources,
        )?;

        if self.config.is_bar_mask(&observation.mask) {
            mask_bar_occulter(&masked.view(), observation.center, &self.config.bar_slices)
        } else {
            Ok(masked)
        }
    }
}
