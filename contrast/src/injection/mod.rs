//! Synthetic-companion injection and recovery.
//!
//! Companions are planted in the raw roll exposures at fluxes tied to the raw
//! contrast curve, the exposures are re-combined with the same engine and
//! scenario as the baseline, and the companion amplitude is measured back
//! from the difference between the injected and baseline residuals. The
//! recovered-to-injected ratio is the algorithmic throughput at that site.
//!
//! Sites are packed into batches of mutually distant companions, and each
//! batch costs one re-combination. Batches run on a rayon pool, either one
//! shared by the caller or one built for the run.

pub mod sites;
pub mod stamp;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use ndarray::Axis;
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use crate::artifacts::{ArtifactKey, ArtifactKind, ArtifactStore};
use crate::collaborators::{CombinationEngine, Observation, PsfProvider};
use crate::config::{ContrastConfig, ScenarioConfig, SiteGrid};
use crate::cube::{into_cube, KnownSource, OcculterGeometry, ResidualCube};
use crate::error::ContrastError;
use crate::psf::ReferencePsf;
use crate::raw_contrast::RawContrastCurve;

pub use sites::{
    exclude_near_sources, pack_batches, plan_sites, restrict_to_slices, InjectionSite,
};
pub use stamp::{add_scaled_stamp, matched_amplitude};

/// Outcome of injecting and recovering one synthetic companion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionTrial {
    pub separation_px: f64,
    pub position_angle_deg: f64,
    /// Injected peak surface brightness, MJy/sr
    pub injected_flux: f64,
    /// Recovered peak surface brightness, MJy/sr; NaN when unmeasurable
    #[serde(with = "crate::serde_float::scalar")]
    pub recovered_flux: f64,
}

impl InjectionTrial {
    /// Recovered over injected flux
    pub fn throughput(&self) -> f64 {
        self.recovered_flux / self.injected_flux
    }
}

/// All trials of one scenario, sorted by separation then position angle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionTable {
    /// KL truncation the companions were measured in
    pub kl_index: usize,
    pub trials: Vec<InjectionTrial>,
}

impl InjectionTable {
    fn new(kl_index: usize, mut trials: Vec<InjectionTrial>) -> Self {
        trials.sort_by(|a, b| {
            a.separation_px
                .total_cmp(&b.separation_px)
                .then(a.position_angle_deg.total_cmp(&b.position_angle_deg))
        });
        Self { kl_index, trials }
    }
}

/// Shared flag that asks a running injection to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Harness settings in pixel units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InjectionSettings {
    /// Minimum distance between companions of a batch and from known sources
    pub exclusion_radius_px: f64,
    /// Radius of the recovery aperture
    pub recovery_radius_px: f64,
    /// Injected flux in units of the raw contrast
    pub contrast_multiplier: f64,
    /// Worker threads of a harness-owned pool; 0 uses the rayon default
    pub workers: usize,
    /// Fraction of failed sites above which the run fails
    pub max_trial_failure_rate: f64,
}

impl InjectionSettings {
    /// Resolve FWHM-relative config values for an observation with `fwhm_px`.
    pub fn from_config(config: &ContrastConfig, fwhm_px: f64) -> Self {
        Self {
            exclusion_radius_px: config.injection_exclusion_fwhm * fwhm_px,
            recovery_radius_px: config.recovery_radius_fwhm * fwhm_px,
            contrast_multiplier: config.injection_contrast_multiplier,
            workers: config.workers,
            max_trial_failure_rate: config.max_trial_failure_rate,
        }
    }
}

/// Inputs of one injection run
pub struct InjectionRequest<'a> {
    pub scenario: &'a ScenarioConfig,
    pub observation: &'a Observation,
    /// Residual cube of the uninjected exposures
    pub baseline: &'a ResidualCube,
    /// KL truncation used for recovery
    pub kl_index: usize,
    /// Raw contrast at `kl_index`, which sets the injected fluxes
    pub raw_curve: &'a RawContrastCurve,
    /// Star peak surface brightness, MJy/sr
    pub normalization: f64,
    pub reference: &'a ReferencePsf,
    pub grid: &'a SiteGrid,
    pub known_sources: &'a [KnownSource],
    /// Unobstructed position-angle ranges of a bar occulter; `None` for round masks
    pub valid_slices: Option<&'a OcculterGeometry>,
}

enum BatchOutcome {
    Completed(Vec<InjectionTrial>),
    Failed { sites: usize },
    Skipped { sites: usize },
}

/// Thread pool for injection batches, named for log output.
pub fn injection_pool(workers: usize) -> Result<ThreadPool, ContrastError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("injection-{i}"))
        .build()
        .map_err(|e| ContrastError::WorkerPool(e.to_string()))
}

/// Runs injection trials against a combination engine and PSF model.
pub struct InjectionHarness<'a, E: ?Sized, P: ?Sized> {
    engine: &'a E,
    psf: &'a P,
    settings: InjectionSettings,
    cancel: CancelToken,
    pool: Option<&'a ThreadPool>,
}

impl<'a, E, P> InjectionHarness<'a, E, P>
where
    E: CombinationEngine + ?Sized,
    P: PsfProvider + ?Sized,
{
    pub fn new(engine: &'a E, psf: &'a P, settings: InjectionSettings) -> Self {
        Self {
            engine,
            psf,
            settings,
            cancel: CancelToken::default(),
            pool: None,
        }
    }

    /// Run batches on `pool` instead of a pool built per run.
    ///
    /// Sharing one pool across concurrent harnesses bounds the number of
    /// re-combinations in flight to its thread count.
    pub fn with_pool(mut self, pool: &'a ThreadPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Injection table for the request, reused from `store` unless `overwrite` is set.
    ///
    /// A fresh table is persisted only after every batch has finished.
    pub fn run_injection_recovery<S: ArtifactStore>(
        &self,
        store: &S,
        request: &InjectionRequest<'_>,
        overwrite: bool,
    ) -> Result<InjectionTable, ContrastError> {
        let key = ArtifactKey::new(
            request.scenario.clone(),
            ArtifactKind::InjectionTable,
            request.kl_index,
        );
        store.get_or_compute(&key, overwrite, || self.run_trials(request))
    }

    /// Planned batches for the request.
    pub fn plan(&self, request: &InjectionRequest<'_>) -> Vec<Vec<InjectionSite>> {
        let sites = plan_sites(
            request.grid,
            request.raw_curve,
            request.normalization,
            self.settings.contrast_multiplier,
        );
        let source_offsets: Vec<(f64, f64)> = request
            .known_sources
            .iter()
            .map(|source| source.pixel_offset(request.observation.pixel_scale_mas))
            .collect();
        let mut sites =
            exclude_near_sources(sites, &source_offsets, self.settings.exclusion_radius_px);
        if let Some(geometry) = request.valid_slices {
            sites = restrict_to_slices(sites, geometry);
        }
        pack_batches(sites, self.settings.exclusion_radius_px)
    }

    /// Inject, re-combine and recover every planned site, without caching.
    pub fn run_trials(
        &self,
        request: &InjectionRequest<'_>,
    ) -> Result<InjectionTable, ContrastError> {
        request.baseline.frame(request.kl_index)?;
        for source in request.known_sources {
            source.validate()?;
        }

        let batches = self.plan(request);
        let planned: usize = batches.iter().map(Vec::len).sum();
        if planned == 0 {
            return Err(ContrastError::NoInjectionSites);
        }
        info!(
            "{}: injecting {} companions in {} batches",
            request.scenario,
            planned,
            batches.len()
        );

        let owned;
        let pool = match self.pool {
            Some(pool) => pool,
            None => {
                owned = injection_pool(self.settings.workers)?;
                &owned
            }
        };

        let outcomes: Vec<BatchOutcome> = pool.install(|| {
            batches
                .par_iter()
                .enumerate()
                .map(|(index, batch)| {
                    if self.cancel.is_cancelled() {
                        return BatchOutcome::Skipped { sites: batch.len() };
                    }
                    match self.run_batch(request, batch) {
                        Ok(trials) => BatchOutcome::Completed(trials),
                        Err(e) => {
                            warn!(
                                "{}: injection batch {index} ({} sites) failed: {e}",
                                request.scenario,
                                batch.len()
                            );
                            BatchOutcome::Failed { sites: batch.len() }
                        }
                    }
                })
                .collect()
        });

        let mut trials = Vec::with_capacity(planned);
        let mut failed = 0;
        let mut skipped = 0;
        for outcome in outcomes {
            match outcome {
                BatchOutcome::Completed(batch) => trials.extend(batch),
                BatchOutcome::Failed { sites } => failed += sites,
                BatchOutcome::Skipped { sites } => skipped += sites,
            }
        }

        if skipped > 0 {
            warn!(
                "{}: injection cancelled with {skipped} of {planned} sites outstanding",
                request.scenario
            );
            return Err(ContrastError::Cancelled {
                completed: planned - skipped,
                planned,
            });
        }

        let failure_rate = failed as f64 / planned as f64;
        if failure_rate > self.settings.max_trial_failure_rate {
            return Err(ContrastError::TooManyTrialFailures {
                failed,
                planned,
                max_rate: self.settings.max_trial_failure_rate,
            });
        }

        info!(
            "{}: recovered {} of {} injected companions",
            request.scenario,
            trials.len(),
            planned
        );
        Ok(InjectionTable::new(request.kl_index, trials))
    }

    /// Inject one batch into every roll, re-combine and measure each site.
    fn run_batch(
        &self,
        request: &InjectionRequest<'_>,
        batch: &[InjectionSite],
    ) -> Result<Vec<InjectionTrial>, ContrastError> {
        let observation = request.observation;
        let stamp_scale = 1.0 / request.reference.peak;

        let mut rolls = observation.rolls.clone();
        for roll in &mut rolls {
            for site in batch {
                let offset = site.detector_offset(roll.info.roll_angle_deg);
                let psf = self
                    .psf
                    .offset_psf(&observation.filter, &observation.mask, Some(offset))?;
                let position = (roll.center.0 + offset.0, roll.center.1 + offset.1);
                for mut frame in roll.frames.axis_iter_mut(Axis(0)) {
                    add_scaled_stamp(
                        &mut frame,
                        &psf.view(),
                        position,
                        site.flux * stamp_scale,
                    );
                }
            }
        }

        let injected = into_cube(self.engine.combine(
            request.scenario,
            &rolls,
            request.baseline.kl_modes(),
        )?)?;
        let injected = request.baseline.with_data(injected)?;
        let residual = &injected.frame(request.kl_index)? - &request.baseline.frame(request.kl_index)?;

        let center = request.baseline.center();
        let trials = batch
            .iter()
            .map(|site| {
                let (dx, dy) = site.sky_offset();
                let recovered_flux = matched_amplitude(
                    &residual.view(),
                    &request.reference.template.view(),
                    (center.0 + dx, center.1 + dy),
                    self.settings.recovery_radius_px,
                );
                debug!(
                    "Site sep={:.2} px pa={:.1} deg: injected {:.4e}, recovered {:.4e}",
                    site.separation_px, site.position_angle_deg, site.flux, recovered_flux
                );
                InjectionTrial {
                    separation_px: site.separation_px,
                    position_angle_deg: site.position_angle_deg,
                    injected_flux: site.flux,
                    recovered_flux,
                }
            })
            .collect();

        Ok(trials)
    }
}
