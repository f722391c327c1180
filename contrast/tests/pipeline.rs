//! Full pipeline runs over synthetic observations.

use approx::assert_relative_eq;
use contrast::collaborators::mock::{
    GaussianPsfProvider, InMemoryCatalog, MockCombinationEngine, SyntheticObservation,
};
use contrast::collaborators::CollaboratorError;
use contrast::{
    ArtifactKey, ArtifactKind, ContrastConfig, ContrastError, ContrastPipeline, FsArtifactStore,
    MemoryArtifactStore, OcculterGeometry, ScenarioConfig, SiteGrid,
};
use std::time::Duration;
use test_helpers::{init_test_logging, remove_scratch_dir, scratch_dir};

const ENGINE_THROUGHPUT: f64 = 0.8;
const OCCULTER_RADIUS_PX: f64 = 5.0;

fn grid(position_angles_deg: Vec<f64>) -> SiteGrid {
    SiteGrid {
        separations_px: vec![6.0, 9.0, 12.0, 15.0, 18.0, 21.0],
        position_angles_deg,
    }
}

fn config() -> ContrastConfig {
    ContrastConfig {
        kl_modes: vec![1, 5],
        round_grid: grid((0..8).map(|i| i as f64 * 45.0).collect()),
        workers: 2,
        ..ContrastConfig::default()
    }
}

/// One roll at 0 degrees, so derotation never resamples the noise.
fn catalog(masks: &[(&str, &str)]) -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    for &(dataset_key, mask) in masks {
        let observation = SyntheticObservation {
            dataset_key: dataset_key.to_string(),
            mask: mask.to_string(),
            rolls: vec![(0.0, 500.0)],
            ..SyntheticObservation::default()
        }
        .build()
        .unwrap();
        catalog.insert(observation);
    }
    catalog
}

fn psf_for(catalog: &InMemoryCatalog) -> GaussianPsfProvider {
    use contrast::collaborators::ObservationCatalog;
    let key = &catalog.keys()[0];
    let fwhm_px = catalog.observation(key).unwrap().fwhm_px();
    GaussianPsfProvider::new(fwhm_px, 8 * fwhm_px.ceil() as usize + 1)
        .with_occulter_radius(OCCULTER_RADIUS_PX)
}

#[test]
fn test_calibrated_curve_divides_out_measured_throughput() {
    init_test_logging();
    let config = config();
    let catalog = catalog(&[("obs01", "MASK335R")]);
    let engine = MockCombinationEngine::new(ENGINE_THROUGHPUT);
    let psf = psf_for(&catalog);
    let store = MemoryArtifactStore::new();

    let pipeline = ContrastPipeline::new(&config, &catalog, &engine, &psf, &store);
    let report = pipeline.run_batch(&catalog.keys()).unwrap();
    assert!(report.is_complete());
    assert_eq!(report.outcomes.len(), 1);

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.raw_curves.len(), 2);
    assert_eq!(outcome.injection_table.kl_index, 1);
    assert_eq!(outcome.injection_table.trials.len(), 48);

    // Recovery sees the engine throughput times the coronagraph transmission
    assert_eq!(outcome.throughput.samples.len(), 6);
    for sample in &outcome.throughput.samples {
        let expected =
            ENGINE_THROUGHPUT * psf.transmission(Some((sample.separation_px, 0.0)));
        assert_relative_eq!(sample.throughput, expected, max_relative = 1e-6);
        assert!((outcome.throughput.evaluate(sample.separation_px) - expected).abs() < 2e-3);
    }

    let raw = &outcome.raw_curves[1];
    let calibrated = &outcome.calibrated;
    assert_eq!(calibrated.kl_index, 1);
    assert_eq!(calibrated.kl_mode, 5);
    assert_eq!(calibrated.separations_px, raw.separations_px);
    for (i, &sep) in raw.separations_px.iter().enumerate() {
        let throughput = outcome.throughput.evaluate(sep);
        assert_relative_eq!(calibrated.throughputs[i], throughput, max_relative = 1e-12);
        assert_relative_eq!(
            calibrated.contrasts[i],
            raw.contrasts[i] / throughput,
            max_relative = 1e-12
        );
        assert!(calibrated.contrasts[i] > raw.contrasts[i]);
    }

    let scenario = ScenarioConfig::new("ADI+RDI", 1, 1, "obs01");
    for (kind, kl_index) in [
        (ArtifactKind::RawContrast, 0),
        (ArtifactKind::RawContrast, 1),
        (ArtifactKind::InjectionTable, 1),
        (ArtifactKind::ThroughputFit, 1),
        (ArtifactKind::CalibratedContrast, 1),
    ] {
        assert!(store.contains(&ArtifactKey::new(scenario.clone(), kind, kl_index)));
    }
    assert_eq!(store.write_count(), 5);
}

#[test]
fn test_rerun_reuses_stored_artifacts() {
    init_test_logging();
    let dir = scratch_dir("pipeline_rerun");
    let config = config();
    let catalog = catalog(&[("obs01", "MASK335R")]);
    let engine = MockCombinationEngine::new(ENGINE_THROUGHPUT);
    let psf = psf_for(&catalog);
    let store = FsArtifactStore::new(&dir);
    let injection_key = ArtifactKey::new(
        ScenarioConfig::new("ADI+RDI", 1, 1, "obs01"),
        ArtifactKind::InjectionTable,
        1,
    );

    let first = ContrastPipeline::new(&config, &catalog, &engine, &psf, &store)
        .run_batch(&catalog.keys())
        .unwrap();
    let first_calls = engine.call_count();
    assert!(first_calls > 1);
    let stored = std::fs::read(store.path_for(&injection_key)).unwrap();

    // Only the baseline combination runs again
    let second = ContrastPipeline::new(&config, &catalog, &engine, &psf, &store)
        .run_batch(&catalog.keys())
        .unwrap();
    assert_eq!(engine.call_count(), first_calls + 1);
    assert_eq!(std::fs::read(store.path_for(&injection_key)).unwrap(), stored);
    assert_eq!(
        second.outcomes[0].injection_table,
        first.outcomes[0].injection_table
    );
    assert_eq!(second.outcomes[0].calibrated, first.outcomes[0].calibrated);

    let overwrite = ContrastConfig {
        overwrite: true,
        ..config.clone()
    };
    ContrastPipeline::new(&overwrite, &catalog, &engine, &psf, &store)
        .run_batch(&catalog.keys())
        .unwrap();
    assert_eq!(engine.call_count(), 2 * first_calls + 1);

    remove_scratch_dir(&dir);
}

#[test]
fn test_failed_scenario_does_not_stop_the_batch() {
    init_test_logging();
    let config = ContrastConfig {
        modes: vec!["ADI".to_string(), "ADI+RDI".to_string()],
        ..config()
    };
    let catalog = catalog(&[("obs01", "MASK335R")]);
    let engine = MockCombinationEngine::new(ENGINE_THROUGHPUT);
    let psf = psf_for(&catalog);
    let store = MemoryArtifactStore::new();

    let keys = vec!["missing".to_string(), "obs01".to_string()];
    let report = ContrastPipeline::new(&config, &catalog, &engine, &psf, &store)
        .run_batch(&keys)
        .unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.failures.len(), 2);
    for failure in &report.failures {
        assert_eq!(failure.scenario.dataset_key, "missing");
        assert!(matches!(
            failure.error,
            ContrastError::Collaborator(CollaboratorError::Catalog(_))
        ));
    }
    let mut modes: Vec<&str> = report
        .outcomes
        .iter()
        .map(|o| o.scenario.mode.as_str())
        .collect();
    modes.sort();
    assert_eq!(modes, vec!["ADI", "ADI+RDI"]);
}

#[test]
fn test_batch_shares_one_worker_pool() {
    let config = ContrastConfig {
        modes: vec!["ADI".to_string(), "ADI+RDI".to_string()],
        annuli: vec![1, 2],
        workers: 2,
        ..config()
    };
    let catalog = catalog(&[("obs01", "MASK335R")]);
    let engine =
        MockCombinationEngine::new(ENGINE_THROUGHPUT).with_latency(Duration::from_millis(5));
    let psf = psf_for(&catalog);
    let store = MemoryArtifactStore::new();

    let report = ContrastPipeline::new(&config, &catalog, &engine, &psf, &store)
        .run_batch(&catalog.keys())
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.outcomes.len(), 4);
    // Four scenarios and their injection batches, never more than two at once
    assert!(engine.call_count() > 4);
    assert!(engine.peak_concurrency() <= 2);
}

#[test]
fn test_invalid_config_fails_the_batch() {
    let config = ContrastConfig {
        kl_modes: Vec::new(),
        ..config()
    };
    let catalog = catalog(&[("obs01", "MASK335R")]);
    let engine = MockCombinationEngine::new(ENGINE_THROUGHPUT);
    let psf = psf_for(&catalog);
    let store = MemoryArtifactStore::new();

    let err = ContrastPipeline::new(&config, &catalog, &engine, &psf, &store)
        .run_batch(&catalog.keys())
        .unwrap_err();
    assert!(matches!(err, ContrastError::InvalidInput(_)));
    assert_eq!(engine.call_count(), 0);
    assert_eq!(store.write_count(), 0);
}

#[test]
fn test_bar_occulter_uses_its_own_grid_and_slices() {
    init_test_logging();
    let bar_angles = vec![30.0, 90.0, 150.0];
    let config = ContrastConfig {
        bar_slices: OcculterGeometry::new(vec![(0.0, 180.0)]).unwrap(),
        // 270 lies behind the bar
        bar_grid: grid(vec![30.0, 90.0, 150.0, 270.0]),
        ..config()
    };
    let catalog = catalog(&[("bar01", "MASKASWB")]);
    let engine = MockCombinationEngine::new(ENGINE_THROUGHPUT);
    let psf = psf_for(&catalog);
    let store = MemoryArtifactStore::new();

    let report = ContrastPipeline::new(&config, &catalog, &engine, &psf, &store)
        .run_batch(&catalog.keys())
        .unwrap();
    assert!(report.is_complete());

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.injection_table.trials.len(), 18);
    for trial in &outcome.injection_table.trials {
        assert!(bar_angles.contains(&trial.position_angle_deg));
    }
    let raw = &outcome.raw_curves[1];
    for (&sep, &contrast) in raw.separations_px.iter().zip(&raw.contrasts) {
        if sep >= 8.0 {
            assert!(contrast.is_finite() && contrast > 0.0);
        }
    }
}
