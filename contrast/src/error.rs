use thiserror::Error;

use crate::collaborators::CollaboratorError;

/// Errors produced by the contrast pipeline.
#[derive(Error, Debug)]
pub enum ContrastError {
    /// Array rank or extent does not match what the operation requires.
    #[error("invalid array shape: expected {expected}, got {found:?}")]
    Shape {
        /// Description of the required shape.
        expected: String,
        /// Shape that was supplied.
        found: Vec<usize>,
    },

    /// Two inputs that must line up have different lengths.
    #[error("length mismatch for {what}: {left} vs {right}")]
    LengthMismatch {
        /// Which inputs disagree.
        what: &'static str,
        /// Length of the first input.
        left: usize,
        /// Length of the second input.
        right: usize,
    },

    /// A required scalar input is missing, non-finite or out of range.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The throughput model fit did not converge.
    #[error(
        "throughput fit diverged after {iterations} iterations \
         (cost {cost:e}, last parameters {params:?}): {reason}"
    )]
    FitDivergence {
        /// Last parameter estimate.
        params: Vec<f64>,
        /// Cost at the last estimate.
        cost: f64,
        /// Iterations performed.
        iterations: usize,
        /// Solver diagnostic.
        reason: String,
    },

    /// Aggregation left no separation group with a defined throughput.
    #[error("injection table has no separation group with a defined throughput")]
    EmptyThroughputTable,

    /// Every candidate injection site was filtered out.
    #[error("no injection sites left after planning")]
    NoInjectionSites,

    /// Too many injection trials failed for the scenario to be trusted.
    #[error("{failed} of {planned} injection sites failed (maximum failure rate {max_rate})")]
    TooManyTrialFailures {
        /// Sites lost to failed trials.
        failed: usize,
        /// Sites planned.
        planned: usize,
        /// Configured maximum failure fraction.
        max_rate: f64,
    },

    /// The injection run was interrupted; the partial table was discarded.
    #[error("injection run cancelled after {completed} of {planned} trials")]
    Cancelled {
        /// Trials that finished.
        completed: usize,
        /// Trials planned.
        planned: usize,
    },

    /// Reading or writing a persisted artifact failed.
    #[error("artifact {key}: {source}")]
    ArtifactIo {
        /// Artifact key.
        key: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// An artifact could not be serialized.
    #[error("artifact {key} could not be encoded: {source}")]
    ArtifactEncode {
        /// Artifact key.
        key: String,
        /// Underlying serialization error.
        #[source]
        source: serde_json::Error,
    },

    /// The injection worker pool could not be created.
    #[error("worker pool setup failed: {0}")]
    WorkerPool(String),

    /// An external collaborator failed.
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}
