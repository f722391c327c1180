//! Statistical functions for noise and throughput analysis

use statrs::distribution::{ContinuousCDF, Normal, StudentsT};
use thiserror::Error;

/// Errors from statistical reductions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatsError {
    #[error("no valid values: {total} total values, 0 valid (all NaN)")]
    NoValidValues { total: usize },

    #[error("at least 2 samples are required, got {0}")]
    TooFewSamples(usize),

    #[error("distribution setup failed: {0}")]
    Distribution(String),
}

/// Calculate median of a slice of f64 values
///
/// NaN values are ignored, infinite values take part in the ordering. For
/// even-length data the two middle values are averaged.
///
/// # Returns
///
/// * `Ok(median)` - The median value
/// * `Err(StatsError::NoValidValues)` - If no valid values remain after filtering NaN
pub fn median(values: &[f64]) -> Result<f64, StatsError> {
    let mut valid_values: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();

    if valid_values.is_empty() {
        return Err(StatsError::NoValidValues {
            total: values.len(),
        });
    }

    valid_values.sort_by(|a, b| a.total_cmp(b));

    let mid = valid_values.len() / 2;
    let median_value = if valid_values.len() % 2 == 0 {
        (valid_values[mid - 1] + valid_values[mid]) / 2.0
    } else {
        valid_values[mid]
    };

    Ok(median_value)
}

/// Sample standard deviation (Bessel-corrected, `ddof = 1`) ignoring NaN values.
pub fn sample_std(values: &[f64]) -> Result<f64, StatsError> {
    let valid: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();
    let n = valid.len();
    if n < 2 {
        return Err(StatsError::TooFewSamples(n));
    }

    let mean = valid.iter().sum::<f64>() / n as f64;
    let variance = valid.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;

    Ok(variance.sqrt())
}

/// Detection threshold, in units of the measured noise standard deviation.
///
/// With `n_elements` independent resolution elements at or above
/// `small_sample_elements` this is simply `sigma`. Below that the threshold is
/// inflated so that the false positive fraction matches the Gaussian
/// `sigma`-level one under Student-t statistics with `n - 1` degrees of
/// freedom (Mawet et al. 2014):
///
/// ```text
/// tau = t_{n-1}^{-1}(1 - FPF) * sqrt(1 + 1/n),   FPF = 1 - Phi(sigma)
/// ```
///
/// Fails with [`StatsError::TooFewSamples`] below 2 elements, where no
/// noise estimate exists.
pub fn detection_threshold(
    n_elements: usize,
    sigma: f64,
    small_sample_elements: usize,
) -> Result<f64, StatsError> {
    if n_elements >= small_sample_elements {
        return Ok(sigma);
    }
    if n_elements < 2 {
        return Err(StatsError::TooFewSamples(n_elements));
    }

    let gaussian =
        Normal::new(0.0, 1.0).map_err(|e| StatsError::Distribution(e.to_string()))?;
    let false_positive_fraction = 1.0 - gaussian.cdf(sigma);

    let n = n_elements as f64;
    let student = StudentsT::new(0.0, 1.0, n - 1.0)
        .map_err(|e| StatsError::Distribution(e.to_string()))?;

    Ok(student.inverse_cdf(1.0 - false_positive_fraction) * (1.0 + 1.0 / n).sqrt())
}
