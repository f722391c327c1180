//! Invalidation of pixels that must not enter noise statistics.
//!
//! Masked pixels are set to NaN and every downstream reduction ignores NaN.
//! Both maskers are pure: they return a new cube and leave the input alone.

use log::debug;
use ndarray::{Array2, Array3, ArrayView3, Axis, Zip};

use crate::cube::{position_angle_deg, KnownSource, OcculterGeometry};
use crate::error::ContrastError;

fn check_center(center: (f64, f64)) -> Result<(), ContrastError> {
    if center.0.is_finite() && center.1.is_finite() {
        Ok(())
    } else {
        Err(ContrastError::InvalidInput(format!(
            "image center must be finite, got {center:?}"
        )))
    }
}

/// Set to NaN every pixel on `keep == false`, on all frames.
fn apply_footprint(cube: &ArrayView3<f64>, keep: &Array2<bool>) -> Array3<f64> {
    let mut masked = cube.to_owned();
    for mut frame in masked.axis_iter_mut(Axis(0)) {
        Zip::from(&mut frame).and(keep).for_each(|value, &keep| {
            if !keep {
                *value = f64::NAN;
            }
        });
    }
    masked
}

/// Mask a disk of `radius_px` around every known source.
///
/// A pixel is invalidated on all frames when its distance to any source
/// position is `<= radius_px`. Sources are given as sky offsets and placed
/// with [`KnownSource::pixel_position`].
pub fn mask_known_sources(
    cube: &ArrayView3<f64>,
    pixel_scale_mas: f64,
    center: (f64, f64),
    radius_px: f64,
    sources: &[KnownSource],
) -> Result<Array3<f64>, ContrastError> {
    if !(pixel_scale_mas.is_finite() && pixel_scale_mas > 0.0) {
        return Err(ContrastError::InvalidInput(format!(
            "pixel scale must be positive, got {pixel_scale_mas}"
        )));
    }
    if !(radius_px.is_finite() && radius_px >= 0.0) {
        return Err(ContrastError::InvalidInput(format!(
            "mask radius must be non-negative, got {radius_px}"
        )));
    }
    check_center(center)?;
    for source in sources {
        source.validate()?;
    }

    if sources.is_empty() {
        return Ok(cube.to_owned());
    }

    let positions: Vec<(f64, f64)> = sources
        .iter()
        .map(|source| source.pixel_position(pixel_scale_mas, center))
        .collect();
    debug!(
        "Masking {} known sources with radius {:.2} px at {:?}",
        positions.len(),
        radius_px,
        positions
    );

    let (_, height, width) = cube.dim();
    let radius_sq = radius_px * radius_px;
    let keep = Array2::from_shape_fn((height, width), |(row, col)| {
        positions.iter().all(|&(sx, sy)| {
            let dx = col as f64 - sx;
            let dy = row as f64 - sy;
            dx * dx + dy * dy > radius_sq
        })
    });

    Ok(apply_footprint(cube, &keep))
}

/// Mask everything outside the unobstructed position-angle ranges of a bar occulter.
///
/// The position angle of each pixel is measured about `center` (see
/// [`position_angle_deg`]). Pixels inside any inclusive range keep their
/// values; all others become NaN. An empty geometry invalidates the whole
/// cube.
pub fn mask_bar_occulter(
    cube: &ArrayView3<f64>,
    center: (f64, f64),
    geometry: &OcculterGeometry,
) -> Result<Array3<f64>, ContrastError> {
    geometry.validate()?;
    check_center(center)?;

    let (_, height, width) = cube.dim();
    let keep = Array2::from_shape_fn((height, width), |(row, col)| {
        let angle = position_angle_deg(col as f64 - center.0, row as f64 - center.1);
        geometry.contains(angle)
    });

    Ok(apply_footprint(cube, &keep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn ramp_cube(frames: usize, size: usize) -> Array3<f64> {
        Array3::from_shape_fn((frames, size, size), |(k, y, x)| {
            (k * 1000 + y * size + x) as f64
        })
    }

    #[test]
    fn test_known_source_disk_is_masked_on_all_frames() {
        let cube = ramp_cube(3, 21);
        let center = (10.0, 10.0);
        let pixel_scale = 50.0;
        // 5 px east, 2 px north -> (5, 12)
        let source = KnownSource::new(250.0, 100.0);

        let masked =
            mask_known_sources(&cube.view(), pixel_scale, center, 2.0, &[source]).unwrap();

        for k in 0..3 {
            for y in 0..21 {
                for x in 0..21 {
                    let dx = x as f64 - 5.0;
                    let dy = y as f64 - 12.0;
                    let inside = (dx * dx + dy * dy).sqrt() <= 2.0;
                    if inside {
                        assert!(masked[[k, y, x]].is_nan(), "({k}, {y}, {x}) not masked");
                    } else {
                        assert_eq!(masked[[k, y, x]], cube[[k, y, x]]);
                    }
                }
            }
        }
        // Boundary pixel at exactly the radius is masked
        assert!(masked[[0, 14, 5]].is_nan());
    }

    #[test]
    fn test_no_sources_returns_copy() {
        let cube = ramp_cube(2, 9);
        let masked = mask_known_sources(&cube.view(), 60.0, (4.0, 4.0), 3.0, &[]).unwrap();
        assert_eq!(masked, cube);
    }

    #[test]
    fn test_invalid_pixel_scale_is_rejected() {
        let cube = ramp_cube(1, 5);
        let source = KnownSource::new(0.0, 0.0);
        assert!(mask_known_sources(&cube.view(), 0.0, (2.0, 2.0), 1.0, &[source]).is_err());
        assert!(mask_known_sources(&cube.view(), 60.0, (2.0, 2.0), f64::NAN, &[source]).is_err());
    }

    #[test]
    fn test_non_finite_source_offset_is_rejected() {
        let cube = Array3::<f64>::ones((1, 21, 21));
        let sources = [
            KnownSource::new(250.0, 100.0),
            KnownSource::new(f64::NAN, 0.0),
        ];
        let err = mask_known_sources(&cube.view(), 50.0, (10.0, 10.0), 2.0, &sources).unwrap_err();
        assert!(matches!(err, ContrastError::InvalidInput(_)));
    }

    #[test]
    fn test_full_circle_leaves_cube_unchanged() {
        let cube = ramp_cube(2, 15);
        let masked =
            mask_bar_occulter(&cube.view(), (7.0, 7.0), &OcculterGeometry::full_circle()).unwrap();
        assert_eq!(masked, cube);
    }

    #[test]
    fn test_empty_geometry_masks_everything() {
        let cube = ramp_cube(2, 7);
        let masked =
            mask_bar_occulter(&cube.view(), (3.0, 3.0), &OcculterGeometry::default()).unwrap();
        assert!(masked.iter().all(|v| v.is_nan()));
    }

    #[test]
    fn test_bar_keeps_only_requested_sector() {
        let cube = Array3::<f64>::ones((1, 11, 11));
        // North-through-east quadrant: +y and -x
        let geometry = OcculterGeometry::new(vec![(0.0, 90.0)]).unwrap();
        let masked = mask_bar_occulter(&cube.view(), (5.0, 5.0), &geometry).unwrap();

        // North (0 deg) and east (90 deg) edges are kept
        assert_eq!(masked[[0, 9, 5]], 1.0);
        assert_eq!(masked[[0, 5, 1]], 1.0);
        assert_eq!(masked[[0, 8, 2]], 1.0);
        // West (270 deg) and south (180 deg) are masked
        assert!(masked[[0, 5, 9]].is_nan());
        assert!(masked[[0, 1, 5]].is_nan());
    }
}
