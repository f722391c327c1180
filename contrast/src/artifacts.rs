//! Persistence of pipeline outputs, which doubles as the cross-run cache.
//!
//! Every artifact is addressed by scenario, quantity and KL truncation and
//! stored as pretty-printed JSON. Stages that are expensive to recompute go
//! through [`ArtifactStore::get_or_compute`], so a second run with
//! `overwrite = false` reuses stored results instead of recomputing them.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ScenarioConfig;
use crate::error::ContrastError;

/// Kind of stored quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArtifactKind {
    RawContrast,
    InjectionTable,
    ThroughputFit,
    CalibratedContrast,
}

impl ArtifactKind {
    pub fn file_stem(&self) -> &'static str {
        match self {
            ArtifactKind::RawContrast => "raw_contrast",
            ArtifactKind::InjectionTable => "injection",
            ArtifactKind::ThroughputFit => "throughput_fit",
            ArtifactKind::CalibratedContrast => "calibrated_contrast",
        }
    }
}

/// Address of one artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactKey {
    pub scenario: ScenarioConfig,
    pub kind: ArtifactKind,
    pub kl_index: usize,
}

impl ArtifactKey {
    pub fn new(scenario: ScenarioConfig, kind: ArtifactKind, kl_index: usize) -> Self {
        Self {
            scenario,
            kind,
            kl_index,
        }
    }

    /// Path of the artifact relative to a store root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.scenario.label()).join(format!(
            "{}-{}-kl{}.json",
            self.scenario.dataset_key,
            self.kind.file_stem(),
            self.kl_index
        ))
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}-{}-kl{}",
            self.scenario.label(),
            self.scenario.dataset_key,
            self.kind.file_stem(),
            self.kl_index
        )
    }
}

/// Byte storage for artifacts, with JSON helpers on top.
pub trait ArtifactStore: Send + Sync {
    /// Stored bytes for `key`, or `None` if absent.
    fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>, ContrastError>;

    /// Store `bytes` under `key`, replacing any previous value.
    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), ContrastError>;

    /// Decode the stored value for `key`.
    ///
    /// Bytes that do not decode as `T` are treated as absent, so a stale or
    /// truncated artifact gets recomputed rather than failing the run.
    fn load<T: DeserializeOwned>(&self, key: &ArtifactKey) -> Result<Option<T>, ContrastError>
    where
        Self: Sized,
    {
        let Some(bytes) = self.get(key)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Ignoring undecodable artifact {key}: {e}");
                Ok(None)
            }
        }
    }

    /// Encode `value` as JSON and store it under `key`.
    fn put_json<T: Serialize>(&self, key: &ArtifactKey, value: &T) -> Result<(), ContrastError>
    where
        Self: Sized,
    {
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| {
            ContrastError::ArtifactEncode {
                key: key.to_string(),
                source,
            }
        })?;
        self.put(key, &bytes)
    }

    /// Stored value for `key`, or the result of `compute` (which is then stored).
    ///
    /// With `overwrite` set the stored value is ignored. A failing `compute`
    /// stores nothing.
    fn get_or_compute<T, F>(
        &self,
        key: &ArtifactKey,
        overwrite: bool,
        compute: F,
    ) -> Result<T, ContrastError>
    where
        Self: Sized,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, ContrastError>,
    {
        if !overwrite {
            if let Some(value) = self.load(key)? {
                info!("Reusing stored artifact {key}");
                return Ok(value);
            }
        }

        let value = compute()?;
        self.put_json(key, &value)?;
        debug!("Stored artifact {key}");
        Ok(value)
    }
}

/// Artifacts as files under a root directory.
///
/// Layout: `<root>/<mode>_annu<N>_subs<M>/<dataset>-<quantity>-kl<K>.json`.
/// Writes go to a temporary file that is renamed into place, so a reader
/// never sees a partially written artifact.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        self.root.join(key.relative_path())
    }
}

impl ArtifactStore for FsArtifactStore {
    fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>, ContrastError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(ContrastError::ArtifactIo {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), ContrastError> {
        let io_error = |source: std::io::Error| ContrastError::ArtifactIo {
            key: key.to_string(),
            source,
        };

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }

        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, bytes).map_err(io_error)?;
        std::fs::rename(&temp_path, &path).map_err(io_error)
    }
}

/// In-memory store, mainly for tests.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `put` calls so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &ArtifactKey) -> bool {
        self.entries
            .lock()
            .map(|entries| entries.contains_key(&key.to_string()))
            .unwrap_or(false)
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn get(&self, key: &ArtifactKey) -> Result<Option<Vec<u8>>, ContrastError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| ContrastError::InvalidInput("artifact store lock poisoned".to_string()))?;
        Ok(entries.get(&key.to_string()).cloned())
    }

    fn put(&self, key: &ArtifactKey, bytes: &[u8]) -> Result<(), ContrastError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ContrastError::InvalidInput("artifact store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
