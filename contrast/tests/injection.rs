//! Injection and recovery against deterministic collaborators.

use approx::assert_relative_eq;
use contrast::collaborators::mock::{GaussianPsfProvider, MockCombinationEngine};
use contrast::collaborators::{
    CollaboratorError, CollaboratorResult, CombinationEngine, Observation, RollExposure,
};
use contrast::injection::{injection_pool, InjectionRequest, InjectionSettings};
use contrast::psf::ReferencePsf;
use contrast::{
    ArtifactKey, ArtifactKind, ArtifactStore, CancelToken, ContrastError, InjectionHarness,
    InjectionTable, KnownSource, MemoryArtifactStore, OcculterGeometry, RawContrastCurve,
    ResidualCube, RollInfo, ScenarioConfig, SiteGrid,
};
use ndarray::{Array3, ArrayD, Axis};
use std::time::Duration;
use test_helpers::{init_test_logging, noise_cube};

const SIZE: usize = 61;
const PIXEL_SCALE_MAS: f64 = 63.0;
const NORMALIZATION: f64 = 1e6;
/// 5 x 1e-5 raw contrast x 1e6 MJy/sr
const INJECTED_FLUX: f64 = 50.0;

/// Engine that fails whenever a roll frame is lit at `pixel = (x, y)`.
struct FailsWhereLit {
    inner: MockCombinationEngine,
    pixel: (usize, usize),
}

impl CombinationEngine for FailsWhereLit {
    fn combine(
        &self,
        scenario: &ScenarioConfig,
        rolls: &[RollExposure],
        kl_modes: &[usize],
    ) -> CollaboratorResult<ArrayD<f64>> {
        let (x, y) = self.pixel;
        let lit = rolls.iter().any(|roll| {
            roll.frames
                .axis_iter(Axis(0))
                .any(|frame| frame[[y, x]].abs() > 1e-9)
        });
        if lit {
            return Err(CollaboratorError::Combination(format!(
                "refusing frames lit at ({x}, {y})"
            )));
        }
        self.inner.combine(scenario, rolls, kl_modes)
    }
}

struct Fixture {
    scenario: ScenarioConfig,
    observation: Observation,
    baseline: ResidualCube,
    raw_curve: RawContrastCurve,
    reference: ReferencePsf,
    grid: SiteGrid,
    psf: GaussianPsfProvider,
}

const CENTER: (f64, f64) = ((SIZE as f64 - 1.0) / 2.0, (SIZE as f64 - 1.0) / 2.0);

fn roll(roll_angle_deg: f64, integration_time_s: f64, frames: Array3<f64>) -> RollExposure {
    RollExposure {
        info: RollInfo {
            roll_angle_deg,
            integration_time_s,
        },
        frames,
        center: CENTER,
    }
}

impl Fixture {
    /// Single roll at 0 degrees, four sites at 10 px on the cardinal angles.
    fn new(frames: Array3<f64>) -> Self {
        Self::with_rolls(vec![roll(0.0, 100.0, frames)])
    }

    fn with_rolls(rolls: Vec<RollExposure>) -> Self {
        let center = CENTER;
        let scenario = ScenarioConfig::new("ADI", 1, 1, "obs");
        let observation = Observation {
            dataset_key: "obs".to_string(),
            filter: "F444W".to_string(),
            mask: "MASK335R".to_string(),
            pixel_scale_mas: PIXEL_SCALE_MAS,
            center,
            wavelength_m: 4.4e-6,
            aperture_diameter_m: 6.5,
            star_magnitude: 6.0,
            zero_point_jy: 280.0,
            rolls,
        };

        let data = MockCombinationEngine::new(1.0)
            .combine(&scenario, &observation.rolls, &[1, 5])
            .unwrap();
        let baseline = ResidualCube::new(data, vec![1, 5], center, PIXEL_SCALE_MAS).unwrap();

        let psf = GaussianPsfProvider::new(2.0, 7);
        let reference =
            ReferencePsf::from_provider(&psf, "F444W", "MASK335R", &observation.roll_info())
                .unwrap();

        Self {
            scenario,
            observation,
            baseline,
            raw_curve: RawContrastCurve {
                kl_index: 1,
                kl_mode: 5,
                pixel_scale_mas: PIXEL_SCALE_MAS,
                separations_px: vec![5.0, 15.0],
                contrasts: vec![1e-5, 1e-5],
            },
            reference,
            grid: SiteGrid {
                separations_px: vec![10.0],
                position_angles_deg: vec![0.0, 90.0, 180.0, 270.0],
            },
            psf,
        }
    }

    fn request<'a>(&'a self, known_sources: &'a [KnownSource]) -> InjectionRequest<'a> {
        InjectionRequest {
            scenario: &self.scenario,
            observation: &self.observation,
            baseline: &self.baseline,
            kl_index: 1,
            raw_curve: &self.raw_curve,
            normalization: NORMALIZATION,
            reference: &self.reference,
            grid: &self.grid,
            known_sources,
            valid_slices: None,
        }
    }
}

/// Neighbouring cardinal sites (14.1 px apart) never share a batch.
fn settings(max_trial_failure_rate: f64) -> InjectionSettings {
    InjectionSettings {
        exclusion_radius_px: 15.0,
        recovery_radius_px: 2.0,
        contrast_multiplier: 5.0,
        workers: 2,
        max_trial_failure_rate,
    }
}

fn position_angles(table: &InjectionTable) -> Vec<f64> {
    table.trials.iter().map(|t| t.position_angle_deg).collect()
}

#[test]
fn test_recovers_injected_flux_through_noise() {
    init_test_logging();
    let fixture = Fixture::new(noise_cube(2, SIZE, 1.0, 7));
    let engine = MockCombinationEngine::new(1.0);
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.0));

    let batches = harness.plan(&fixture.request(&[]));
    assert_eq!(batches.len(), 2);

    let table = harness.run_trials(&fixture.request(&[])).unwrap();
    assert_eq!(table.kl_index, 1);
    assert_eq!(position_angles(&table), vec![0.0, 90.0, 180.0, 270.0]);
    for trial in &table.trials {
        assert_relative_eq!(trial.injected_flux, INJECTED_FLUX, max_relative = 1e-12);
        assert_relative_eq!(trial.recovered_flux, INJECTED_FLUX, max_relative = 1e-6);
    }
    assert_eq!(engine.call_count(), 2);
}

#[test]
fn test_shared_pool_bounds_concurrent_combinations() {
    let fixture = Fixture::new(Array3::zeros((2, SIZE, SIZE)));
    let engine = MockCombinationEngine::new(1.0).with_latency(Duration::from_millis(20));
    let pool = injection_pool(1).unwrap();
    let settings = InjectionSettings {
        workers: 4,
        ..settings(0.0)
    };
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings).with_pool(&pool);

    let table = harness.run_trials(&fixture.request(&[])).unwrap();
    assert_eq!(table.trials.len(), 4);
    assert_eq!(engine.call_count(), 2);
    assert_eq!(engine.peak_concurrency(), 1);
}

#[test]
fn test_engine_throughput_scales_recovery() {
    let fixture = Fixture::new(Array3::zeros((2, SIZE, SIZE)));
    let engine = MockCombinationEngine::new(0.6);
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.0));

    // Baseline was reduced at unit throughput, so scale it to match
    let scaled = fixture
        .baseline
        .with_data(fixture.baseline.data() * 0.6)
        .unwrap();
    let request = InjectionRequest {
        baseline: &scaled,
        ..fixture.request(&[])
    };

    let table = harness.run_trials(&request).unwrap();
    for trial in &table.trials {
        assert_relative_eq!(trial.throughput(), 0.6, max_relative = 1e-9);
    }
}

#[test]
fn test_sites_follow_the_roll_angle() {
    let mut fixture =
        Fixture::with_rolls(vec![roll(90.0, 100.0, Array3::zeros((2, SIZE, SIZE)))]);
    // One site per batch, so a companion placed at the wrong angle cannot land on another site
    fixture.grid.position_angles_deg = vec![0.0, 90.0];
    let engine = MockCombinationEngine::new(1.0);
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.0));

    let table = harness.run_trials(&fixture.request(&[])).unwrap();
    assert_eq!(engine.call_count(), 2);
    assert_eq!(position_angles(&table), vec![0.0, 90.0]);
    for trial in &table.trials {
        assert_relative_eq!(trial.throughput(), 1.0, max_relative = 1e-4);
    }
}

#[test]
fn test_two_rolls_recover_through_derotation() {
    let fixture = Fixture::with_rolls(vec![
        roll(0.0, 100.0, Array3::zeros((2, SIZE, SIZE))),
        roll(30.0, 100.0, Array3::zeros((2, SIZE, SIZE))),
    ]);
    let engine = MockCombinationEngine::new(1.0);
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.0));

    // A companion misplaced in either roll halves the recovered flux
    let table = harness.run_trials(&fixture.request(&[])).unwrap();
    assert_eq!(table.trials.len(), 4);
    for trial in &table.trials {
        let throughput = trial.throughput();
        assert!(
            (0.9..1.1).contains(&throughput),
            "pa {} recovered {throughput}",
            trial.position_angle_deg
        );
    }
    assert_eq!(engine.call_count(), 2);
}

#[test]
fn test_sites_near_known_sources_are_skipped() {
    let fixture = Fixture::new(Array3::zeros((2, SIZE, SIZE)));
    let engine = MockCombinationEngine::new(1.0);
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.0));

    // 10 px north of the star, right on the position angle 0 site
    let known = [KnownSource::new(0.0, 10.0 * PIXEL_SCALE_MAS)];
    let table = harness.run_trials(&fixture.request(&known)).unwrap();

    assert_eq!(position_angles(&table), vec![180.0]);
    assert_eq!(engine.call_count(), 1);
}

#[test]
fn test_bar_slices_limit_injection_angles() {
    let fixture = Fixture::new(Array3::zeros((2, SIZE, SIZE)));
    let engine = MockCombinationEngine::new(1.0);
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.0));

    let slices = OcculterGeometry::new(vec![(45.0, 135.0), (250.0, 290.0)]).unwrap();
    let request = InjectionRequest {
        valid_slices: Some(&slices),
        ..fixture.request(&[])
    };
    let table = harness.run_trials(&request).unwrap();
    assert_eq!(position_angles(&table), vec![90.0, 270.0]);
}

#[test]
fn test_no_sites_left_is_an_error() {
    let fixture = Fixture::new(Array3::zeros((2, SIZE, SIZE)));
    let engine = MockCombinationEngine::new(1.0);
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.0));

    let known = [
        KnownSource::new(0.0, 10.0 * PIXEL_SCALE_MAS),
        KnownSource::new(0.0, -10.0 * PIXEL_SCALE_MAS),
    ];
    let err = harness.run_trials(&fixture.request(&known)).unwrap_err();
    assert!(matches!(err, ContrastError::NoInjectionSites));
    assert_eq!(engine.call_count(), 0);
}

#[test]
fn test_non_finite_known_source_fails_before_combining() {
    let fixture = Fixture::new(Array3::zeros((2, SIZE, SIZE)));
    let engine = MockCombinationEngine::new(1.0);
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.0));

    let known = [KnownSource::new(f64::NAN, 10.0 * PIXEL_SCALE_MAS)];
    let err = harness.run_trials(&fixture.request(&known)).unwrap_err();
    assert!(matches!(err, ContrastError::InvalidInput(_)));
    assert_eq!(engine.call_count(), 0);
}

#[test]
fn test_partial_failures_within_tolerance_are_dropped() {
    init_test_logging();
    let fixture = Fixture::new(Array3::zeros((2, SIZE, SIZE)));
    // Position angle 90 at 10 px lands on (20, 30)
    let engine = FailsWhereLit {
        inner: MockCombinationEngine::new(1.0),
        pixel: (20, 30),
    };
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.5));

    let table = harness.run_trials(&fixture.request(&[])).unwrap();
    assert_eq!(position_angles(&table), vec![0.0, 180.0]);
    for trial in &table.trials {
        assert_relative_eq!(trial.recovered_flux, INJECTED_FLUX, max_relative = 1e-9);
    }
}

#[test]
fn test_partial_failures_beyond_tolerance_fail_the_run() {
    let fixture = Fixture::new(Array3::zeros((2, SIZE, SIZE)));
    let engine = FailsWhereLit {
        inner: MockCombinationEngine::new(1.0),
        pixel: (20, 30),
    };
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.25));

    match harness.run_trials(&fixture.request(&[])) {
        Err(ContrastError::TooManyTrialFailures {
            failed, planned, ..
        }) => {
            assert_eq!(failed, 2);
            assert_eq!(planned, 4);
        }
        other => panic!("expected TooManyTrialFailures, got {other:?}"),
    }
}

#[test]
fn test_failing_engine_stores_nothing() {
    let fixture = Fixture::new(Array3::zeros((2, SIZE, SIZE)));
    let engine = MockCombinationEngine::failing("node lost");
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.5));
    let store = MemoryArtifactStore::new();

    let err = harness
        .run_injection_recovery(&store, &fixture.request(&[]), false)
        .unwrap_err();
    assert!(matches!(
        err,
        ContrastError::TooManyTrialFailures {
            failed: 4,
            planned: 4,
            ..
        }
    ));
    assert_eq!(store.write_count(), 0);
}

#[test]
fn test_cancelled_run_discards_partial_table() {
    let fixture = Fixture::new(Array3::zeros((2, SIZE, SIZE)));
    let engine = MockCombinationEngine::new(1.0);
    let cancel = CancelToken::new();
    cancel.cancel();
    let harness =
        InjectionHarness::new(&engine, &fixture.psf, settings(0.5)).with_cancel_token(cancel);
    let store = MemoryArtifactStore::new();

    let err = harness
        .run_injection_recovery(&store, &fixture.request(&[]), false)
        .unwrap_err();
    assert!(matches!(
        err,
        ContrastError::Cancelled {
            completed: 0,
            planned: 4
        }
    ));
    assert_eq!(engine.call_count(), 0);
    let key = ArtifactKey::new(fixture.scenario.clone(), ArtifactKind::InjectionTable, 1);
    assert!(!store.contains(&key));
}

#[test]
fn test_stored_table_is_reused_unless_overwritten() {
    let fixture = Fixture::new(Array3::zeros((2, SIZE, SIZE)));
    let engine = MockCombinationEngine::new(1.0);
    let harness = InjectionHarness::new(&engine, &fixture.psf, settings(0.0));
    let store = MemoryArtifactStore::new();
    let key = ArtifactKey::new(fixture.scenario.clone(), ArtifactKind::InjectionTable, 1);

    let first = harness
        .run_injection_recovery(&store, &fixture.request(&[]), false)
        .unwrap();
    assert_eq!(engine.call_count(), 2);
    let stored = store.get(&key).unwrap().unwrap();

    let second = harness
        .run_injection_recovery(&store, &fixture.request(&[]), false)
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(engine.call_count(), 2);
    assert_eq!(store.get(&key).unwrap().unwrap(), stored);

    harness
        .run_injection_recovery(&store, &fixture.request(&[]), true)
        .unwrap();
    assert_eq!(engine.call_count(), 4);
}
