use serde::{Deserialize, Serialize};

use crate::raw_contrast::RawContrastCurve;
use crate::throughput::ThroughputModel;
use crate::units::pixels_to_arcsec;

/// Throughput-corrected contrast curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibratedContrastCurve {
    pub kl_index: usize,
    pub kl_mode: usize,
    pub pixel_scale_mas: f64,
    /// Same separations as the raw curve
    pub separations_px: Vec<f64>,
    /// Model throughput at each separation
    #[serde(with = "crate::serde_float::vec")]
    pub throughputs: Vec<f64>,
    /// Raw contrast divided by throughput; may be infinite where throughput is zero
    #[serde(with = "crate::serde_float::vec")]
    pub contrasts: Vec<f64>,
}

impl CalibratedContrastCurve {
    pub fn separations_arcsec(&self) -> Vec<f64> {
        self.separations_px
            .iter()
            .map(|&sep| pixels_to_arcsec(sep, self.pixel_scale_mas))
            .collect()
    }
}

/// Divide a raw contrast curve by the throughput model at each of its separations.
///
/// Undefined raw values stay NaN and separations are preserved. Zero or
/// negative model throughput is passed through unchanged, so the caller
/// decides whether to clip.
pub fn calibrate(raw: &RawContrastCurve, model: &ThroughputModel) -> CalibratedContrastCurve {
    let throughputs: Vec<f64> = raw
        .separations_px
        .iter()
        .map(|&sep| model.evaluate(sep))
        .collect();
    let contrasts = raw
        .contrasts
        .iter()
        .zip(&throughputs)
        .map(|(contrast, throughput)| contrast / throughput)
        .collect();

    CalibratedContrastCurve {
        kl_index: raw.kl_index,
        kl_mode: raw.kl_mode,
        pixel_scale_mas: raw.pixel_scale_mas,
        separations_px: raw.separations_px.clone(),
        throughputs,
        contrasts,
    }
}
