//! Contrast-curve estimation for high-contrast direct imaging.
//!
//! For each processed observation this crate answers "what is the faintest
//! companion that could be detected at a given separation?". Two curves are
//! produced per scenario:
//!
//! - a **raw** curve from the azimuthal noise statistics of the residual cube
//!   after known companions and bar-occulter geometry are masked, and
//! - a **calibrated** curve that divides the raw curve by a throughput model
//!   fitted to synthetic-companion injection and recovery trials.
//!
//! The PSF model, the image-combination (KLIP) engine and the observation
//! catalog are external collaborators, described by the traits in
//! [`collaborators`]. Every stage persists its output through an
//! [`artifacts::ArtifactStore`], which doubles as the cross-run cache.

pub mod artifacts;
pub mod calibrate;
pub mod collaborators;
pub mod config;
pub mod cube;
pub mod error;
pub mod injection;
pub mod masking;
pub mod pipeline;
pub mod psf;
pub mod raw_contrast;
pub mod serde_float;
pub mod throughput;
pub mod units;

pub use artifacts::{ArtifactKey, ArtifactKind, ArtifactStore, FsArtifactStore, MemoryArtifactStore};
pub use calibrate::{calibrate, CalibratedContrastCurve};
pub use config::{ContrastConfig, ScenarioConfig, SiteGrid, ThroughputFitConfig};
pub use cube::{KnownSource, OcculterGeometry, ResidualCube, RollInfo};
pub use error::ContrastError;
pub use injection::{CancelToken, InjectionHarness, InjectionTable, InjectionTrial};
pub use masking::{mask_bar_occulter, mask_known_sources};
pub use pipeline::{BatchReport, ContrastPipeline, ScenarioOutcome};
pub use raw_contrast::{estimate_raw_contrast, RawContrastCurve, RawContrastParams};
pub use throughput::{fit_throughput, ThroughputModel};
