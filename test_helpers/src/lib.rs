//! Shared fixtures for the contrast workspace tests.
//!
//! Provides seeded noise cubes, per-test scratch directories under the
//! workspace `test_output/` folder, and logging setup for tests.

use ndarray::Array3;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Workspace root, one level above this crate.
pub fn workspace_root() -> &'static Path {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir.parent().unwrap_or(manifest_dir)
}

static OUTPUT_DIR: Lazy<PathBuf> = Lazy::new(|| {
    let dir = workspace_root().join("test_output");
    std::fs::create_dir_all(&dir).expect("Failed to create test_output directory");
    dir
});

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Fresh, empty directory for one test's artifacts.
///
/// Names combine `prefix`, the process id and a counter so parallel tests
/// never share a directory.
pub fn scratch_dir(prefix: &str) -> PathBuf {
    let n = SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst);
    let dir = OUTPUT_DIR.join(format!("{prefix}_{}_{n}", std::process::id()));
    if dir.exists() {
        std::fs::remove_dir_all(&dir).expect("Failed to clear scratch directory");
    }
    std::fs::create_dir_all(&dir).expect("Failed to create scratch directory");
    dir
}

/// Remove a scratch directory, ignoring errors.
pub fn remove_scratch_dir<P: AsRef<Path>>(dir: P) {
    let _ = std::fs::remove_dir_all(dir);
}

/// Route `log` output through the test harness.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Seeded zero-mean Gaussian noise of shape `(frames, size, size)`.
pub fn noise_cube(frames: usize, size: usize, sigma: f64, seed: u64) -> Array3<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, sigma).expect("noise sigma must be finite and non-negative");
    Array3::from_shape_simple_fn((frames, size, size), || normal.sample(&mut rng))
}
