//! Bilinear sampling and rotation of 2D images.
//!
//! Coordinates are `(x, y)` = `(column, row)` in pixel units, with pixel
//! centers on integer coordinates. Samples that fall outside the image return
//! a caller-supplied fill value; neighbours that carry zero interpolation
//! weight never contribute, so sampling exactly on a pixel returns that pixel
//! even when its neighbours are NaN.

use ndarray::{Array2, ArrayView2};

/// Sample `image` at the sub-pixel position `(x, y)`.
///
/// Returns `fill` when the position lies outside `[0, width-1] x [0, height-1]`.
/// NaN pixels with non-zero weight propagate into the result.
pub fn sample_bilinear(image: &ArrayView2<f64>, x: f64, y: f64, fill: f64) -> f64 {
    let (height, width) = image.dim();
    if height == 0 || width == 0 || !x.is_finite() || !y.is_finite() {
        return fill;
    }

    let max_x = (width - 1) as f64;
    let max_y = (height - 1) as f64;
    if x < 0.0 || y < 0.0 || x > max_x || y > max_y {
        return fill;
    }

    let x0 = (x.floor() as usize).min(width.saturating_sub(2));
    let y0 = (y.floor() as usize).min(height.saturating_sub(2));
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let tx = x - x0 as f64;
    let ty = y - y0 as f64;

    let corners = [
        ((1.0 - tx) * (1.0 - ty), image[[y0, x0]]),
        (tx * (1.0 - ty), image[[y0, x1]]),
        ((1.0 - tx) * ty, image[[y1, x0]]),
        (tx * ty, image[[y1, x1]]),
    ];

    corners
        .iter()
        .filter(|(weight, _)| *weight != 0.0)
        .map(|(weight, value)| weight * value)
        .sum()
}

/// Rotate an image counterclockwise (x right, y up) by `angle_deg` about `center`.
///
/// Each output pixel is pulled from the input with [`sample_bilinear`], so
/// the output has the same shape as the input and uncovered pixels take
/// `fill`. A zero angle returns an exact copy.
pub fn rotate_image(
    image: &ArrayView2<f64>,
    angle_deg: f64,
    center: (f64, f64),
    fill: f64,
) -> Array2<f64> {
    if angle_deg == 0.0 {
        return image.to_owned();
    }

    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let (cx, cy) = center;

    Array2::from_shape_fn(image.dim(), |(row, col)| {
        let dx = col as f64 - cx;
        let dy = row as f64 - cy;
        // Inverse rotation maps the output pixel back onto the input grid
        let src_x = cx + cos * dx + sin * dy;
        let src_y = cy - sin * dx + cos * dy;
        sample_bilinear(image, src_x, src_y, fill)
    })
}
