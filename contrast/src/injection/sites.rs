//! Planning of synthetic-companion injection sites.

use log::{debug, warn};

use crate::config::SiteGrid;
use crate::cube::{sky_offset, OcculterGeometry};
use crate::raw_contrast::RawContrastCurve;
use crate::units::contrast_to_surface_brightness;

/// One synthetic companion to inject.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InjectionSite {
    pub separation_px: f64,
    /// Sky position angle, degrees north through east
    pub position_angle_deg: f64,
    /// Peak surface brightness of the injected companion, MJy/sr
    pub flux: f64,
}

impl InjectionSite {
    /// Pixel offset from the star on the sky-oriented combined image.
    pub fn sky_offset(&self) -> (f64, f64) {
        sky_offset(self.separation_px, self.position_angle_deg)
    }

    /// Pixel offset from the star on a detector frame taken at `roll_angle_deg`.
    pub fn detector_offset(&self, roll_angle_deg: f64) -> (f64, f64) {
        sky_offset(
            self.separation_px,
            self.position_angle_deg - roll_angle_deg,
        )
    }

    fn distance_to(&self, other: (f64, f64)) -> f64 {
        let (x, y) = self.sky_offset();
        ((x - other.0).powi(2) + (y - other.1).powi(2)).sqrt()
    }
}

/// Sites for every grid point, with flux `multiplier x raw contrast` at the site separation.
///
/// Separations where the raw contrast is undefined are skipped with a
/// warning, since no meaningful flux exists there.
pub fn plan_sites(
    grid: &SiteGrid,
    raw_curve: &RawContrastCurve,
    normalization: f64,
    multiplier: f64,
) -> Vec<InjectionSite> {
    let mut sites = Vec::with_capacity(grid.len());

    for &separation_px in &grid.separations_px {
        let contrast = raw_curve.contrast_at(separation_px);
        let flux = contrast_to_surface_brightness(multiplier * contrast, normalization);
        if !(flux.is_finite() && flux > 0.0) {
            warn!(
                "Skipping injection separation {separation_px:.2} px: raw contrast {contrast:e} \
                 gives no usable flux"
            );
            continue;
        }

        sites.extend(
            grid.position_angles_deg
                .iter()
                .map(|&position_angle_deg| InjectionSite {
                    separation_px,
                    position_angle_deg,
                    flux,
                }),
        );
    }

    sites
}

/// Drop sites closer than `min_distance_px` to any known source offset.
pub fn exclude_near_sources(
    sites: Vec<InjectionSite>,
    source_offsets: &[(f64, f64)],
    min_distance_px: f64,
) -> Vec<InjectionSite> {
    let before = sites.len();
    let kept: Vec<InjectionSite> = sites
        .into_iter()
        .filter(|site| {
            source_offsets
                .iter()
                .all(|&offset| site.distance_to(offset) >= min_distance_px)
        })
        .collect();

    if kept.len() < before {
        debug!(
            "Dropped {} injection sites within {min_distance_px:.2} px of known sources",
            before - kept.len()
        );
    }
    kept
}

/// Keep sites whose position angle lies in an unobstructed range of `geometry`.
pub fn restrict_to_slices(
    sites: Vec<InjectionSite>,
    geometry: &OcculterGeometry,
) -> Vec<InjectionSite> {
    let before = sites.len();
    let kept: Vec<InjectionSite> = sites
        .into_iter()
        .filter(|site| geometry.contains(site.position_angle_deg.rem_euclid(360.0)))
        .collect();

    if kept.len() < before {
        debug!(
            "Dropped {} injection sites behind the occulter bar",
            before - kept.len()
        );
    }
    kept
}

/// Pack sites into batches whose members are pairwise at least `min_distance_px` apart.
///
/// Sites are taken in (separation, position angle) order and each goes into
/// the first batch it fits, so the packing is deterministic.
pub fn pack_batches(mut sites: Vec<InjectionSite>, min_distance_px: f64) -> Vec<Vec<InjectionSite>> {
    sites.sort_by(|a, b| {
        a.separation_px
            .total_cmp(&b.separation_px)
            .then(a.position_angle_deg.total_cmp(&b.position_angle_deg))
    });

    let mut batches: Vec<Vec<InjectionSite>> = Vec::new();
    for site in sites {
        let slot = batches.iter_mut().find(|batch| {
            batch
                .iter()
                .all(|member| site.distance_to(member.sky_offset()) >= min_distance_px)
        });
        match slot {
            Some(batch) => batch.push(site),
            None => batches.push(vec![site]),
        }
    }
    batches
}
