//! Adding PSF stamps to images and measuring them back.
//!
//! Stamps are odd-sized with the source on the middle pixel. Placing a stamp
//! at a sub-pixel position resamples it bilinearly; measuring uses the same
//! resampling, so a stamp added with [`add_scaled_stamp`] is recovered
//! exactly by [`matched_amplitude`] on an otherwise empty image.

use contrast_math::sample_bilinear;
use ndarray::{ArrayView2, ArrayViewMut2};

fn stamp_center(stamp: &ArrayView2<f64>) -> (f64, f64) {
    let (height, width) = stamp.dim();
    ((width as f64 - 1.0) / 2.0, (height as f64 - 1.0) / 2.0)
}

/// Pixel bounds `[min, max)` of a box of half-size `half` around `center`, clipped to `len`.
fn clipped_range(center: f64, half: f64, len: usize) -> (usize, usize) {
    let min = (center - half).floor().max(0.0);
    let max = ((center + half).ceil() + 1.0).clamp(0.0, len as f64);
    if !(min.is_finite() && max.is_finite()) || min >= max {
        return (0, 0);
    }
    (min as usize, max as usize)
}

/// Add `scale * stamp` to `frame`, centered at `position = (x, y)`.
pub fn add_scaled_stamp(
    frame: &mut ArrayViewMut2<f64>,
    stamp: &ArrayView2<f64>,
    position: (f64, f64),
    scale: f64,
) {
    let (center_x, center_y) = stamp_center(stamp);
    let (height, width) = frame.dim();
    let (x_min, x_max) = clipped_range(position.0, center_x + 1.0, width);
    let (y_min, y_max) = clipped_range(position.1, center_y + 1.0, height);

    for y in y_min..y_max {
        for x in x_min..x_max {
            let value = sample_bilinear(
                stamp,
                x as f64 - position.0 + center_x,
                y as f64 - position.1 + center_y,
                0.0,
            );
            if value != 0.0 {
                frame[[y, x]] += scale * value;
            }
        }
    }
}

/// Least squares amplitude of `template` centered at `position` in `image`.
///
/// Uses the pixels within `radius` of `position`, skipping NaN pixels.
/// Returns NaN when no usable pixel overlaps the template.
pub fn matched_amplitude(
    image: &ArrayView2<f64>,
    template: &ArrayView2<f64>,
    position: (f64, f64),
    radius: f64,
) -> f64 {
    let (center_x, center_y) = stamp_center(template);
    let (height, width) = image.dim();
    let (x_min, x_max) = clipped_range(position.0, radius, width);
    let (y_min, y_max) = clipped_range(position.1, radius, height);

    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for y in y_min..y_max {
        for x in x_min..x_max {
            let dx = x as f64 - position.0;
            let dy = y as f64 - position.1;
            if dx * dx + dy * dy > radius * radius {
                continue;
            }

            let data = image[[y, x]];
            let model = sample_bilinear(template, dx + center_x, dy + center_y, 0.0);
            if data.is_nan() || model.is_nan() {
                continue;
            }
            numerator += data * model;
            denominator += model * model;
        }
    }

    if denominator > 0.0 {
        numerator / denominator
    } else {
        f64::NAN
    }
}
