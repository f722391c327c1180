//! Algorithmic throughput as a smooth function of separation.
//!
//! Injection trials are reduced to one throughput value per separation (the
//! median of recovered over injected flux) and a generalized logistic curve
//!
//! ```text
//! f(sep) = offset + amplitude / (1 + exp(-rate * (sep - midpoint)))^exponent
//! ```
//!
//! is fitted to those medians by Levenberg-Marquardt. The family rises
//! from `offset` at small separations to `offset + amplitude` far out, which
//! is the shape self-subtraction gives near the inner working angle.

use contrast_math::{levenberg_marquardt, median, LeastSquaresProblem, LsqError};
use log::{debug, info};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::config::ThroughputFitConfig;
use crate::error::ContrastError;
use crate::injection::InjectionTable;

/// Median throughput at one separation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSample {
    pub separation_px: f64,
    pub throughput: f64,
    /// Trials with a defined ratio at this separation
    pub trials: usize,
}

/// Fitted throughput curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputModel {
    /// `[amplitude, offset, exponent, rate, midpoint]`
    pub params: [f64; 5],
    /// Final least squares cost, `0.5 * sum(residual^2)`
    pub cost: f64,
    /// Solver iterations
    pub iterations: usize,
    /// Per-separation medians the model was fitted to
    pub samples: Vec<ThroughputSample>,
}

impl ThroughputModel {
    /// Model with fixed parameters and no fit history.
    pub fn from_params(params: [f64; 5]) -> Self {
        Self {
            params,
            cost: 0.0,
            iterations: 0,
            samples: Vec::new(),
        }
    }

    /// Throughput at `separation_px`.
    pub fn evaluate(&self, separation_px: f64) -> f64 {
        logistic(&self.params, separation_px)
    }

    pub fn amplitude(&self) -> f64 {
        self.params[0]
    }

    pub fn offset(&self) -> f64 {
        self.params[1]
    }
}

fn logistic(p: &[f64; 5], x: f64) -> f64 {
    let [amplitude, offset, exponent, rate, midpoint] = *p;
    let base = 1.0 + (-rate * (x - midpoint)).exp();
    offset + amplitude * base.powf(-exponent)
}

struct LogisticFit<'a> {
    samples: &'a [ThroughputSample],
}

fn to_array(params: &DVector<f64>) -> [f64; 5] {
    [params[0], params[1], params[2], params[3], params[4]]
}

impl LeastSquaresProblem for LogisticFit<'_> {
    fn residuals(&self, params: &DVector<f64>) -> DVector<f64> {
        let p = to_array(params);
        DVector::from_iterator(
            self.samples.len(),
            self.samples
                .iter()
                .map(|s| logistic(&p, s.separation_px) - s.throughput),
        )
    }

    fn jacobian(&self, params: &DVector<f64>) -> DMatrix<f64> {
        let [amplitude, _offset, exponent, rate, midpoint] = to_array(params);
        let mut jacobian = DMatrix::zeros(self.samples.len(), 5);

        for (row, sample) in self.samples.iter().enumerate() {
            let dx = sample.separation_px - midpoint;
            let w = (-rate * dx).exp();
            let base = 1.0 + w;
            let powered = base.powf(-exponent);
            // w / (1 + w), stable when w overflows
            let share = if w.is_infinite() { 1.0 } else { w / base };
            let log_term = if powered == 0.0 { 0.0 } else { powered * base.ln() };

            jacobian[(row, 0)] = powered;
            jacobian[(row, 1)] = 1.0;
            jacobian[(row, 2)] = -amplitude * log_term;
            jacobian[(row, 3)] = amplitude * exponent * powered * share * dx;
            jacobian[(row, 4)] = -amplitude * exponent * powered * share * rate;
        }

        jacobian
    }
}

/// Median recovered-over-injected flux per distinct separation.
///
/// Trials with NaN or infinite ratios are ignored. A separation whose
/// trials are all undefined is dropped. Output is sorted by separation.
pub fn aggregate_by_separation(table: &InjectionTable) -> Vec<ThroughputSample> {
    let mut ratios: Vec<(f64, f64)> = table
        .trials
        .iter()
        .map(|t| (t.separation_px, t.recovered_flux / t.injected_flux))
        .collect();
    ratios.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut samples = Vec::new();
    let mut start = 0;
    while start < ratios.len() {
        let separation_px = ratios[start].0;
        let end = start
            + ratios[start..]
                .iter()
                .take_while(|(sep, _)| *sep == separation_px)
                .count();
        let finite: Vec<f64> = ratios[start..end]
            .iter()
            .map(|&(_, ratio)| ratio)
            .filter(|ratio| ratio.is_finite())
            .collect();
        start = end;

        match median(&finite) {
            Ok(throughput) => samples.push(ThroughputSample {
                separation_px,
                throughput,
                trials: finite.len(),
            }),
            Err(e) => debug!("Dropping separation {separation_px:.2} px from throughput fit: {e}"),
        }
    }

    samples
}

/// Fit the throughput model to an injection table.
///
/// Fails with [`ContrastError::EmptyThroughputTable`] when aggregation leaves
/// nothing to fit and with [`ContrastError::FitDivergence`] when the solver
/// does not converge; the model is never silently replaced.
pub fn fit_throughput(
    table: &InjectionTable,
    config: &ThroughputFitConfig,
) -> Result<ThroughputModel, ContrastError> {
    let samples = aggregate_by_separation(table);
    if samples.is_empty() {
        return Err(ContrastError::EmptyThroughputTable);
    }

    debug!(
        "Fitting throughput to {} separations from {} trials",
        samples.len(),
        table.trials.len()
    );

    let problem = LogisticFit { samples: &samples };
    let initial = DVector::from_row_slice(&config.initial_guess);
    let options = config.lsq_options(samples.len());
    let report = levenberg_marquardt(&problem, initial, &options).map_err(|e| match e {
        LsqError::NoResiduals => ContrastError::EmptyThroughputTable,
        LsqError::NotConverged {
            ref params,
            cost,
            iterations,
        }
        | LsqError::NonFinite {
            ref params,
            cost,
            iterations,
        } => ContrastError::FitDivergence {
            params: params.clone(),
            cost,
            iterations,
            reason: e.to_string(),
        },
    })?;

    let params = to_array(&report.params);
    if params.iter().any(|p| !p.is_finite()) {
        return Err(ContrastError::FitDivergence {
            params: params.to_vec(),
            cost: report.cost,
            iterations: report.iterations,
            reason: "non-finite parameters".to_string(),
        });
    }

    info!(
        "Throughput fit: amplitude={:.4} offset={:.4} exponent={:.4} rate={:.4} midpoint={:.3} \
         (cost {:.3e}, {} iterations, {:?})",
        params[0],
        params[1],
        params[2],
        params[3],
        params[4],
        report.cost,
        report.iterations,
        report.termination
    );

    Ok(ThroughputModel {
        params,
        cost: report.cost,
        iterations: report.iterations,
        samples,
    })
}
