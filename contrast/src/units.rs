//! Angular and photometric unit handling.
//!
//! Angles go through `uom` so milliarcseconds, arcseconds and radians cannot
//! be mixed up. All photometric conversions used by the pipeline live here:
//! detector images are in MJy/sr, stellar photometry comes as a Vega
//! magnitude plus a zero point in Jy, and contrast is the ratio of a
//! companion's surface brightness to the star's peak surface brightness.

use uom::si::angle::{radian, second};
use uom::si::f64::{Angle, SolidAngle};
use uom::si::solid_angle::steradian;

/// Extension trait for angle conversions common in high-contrast imaging
pub trait AngleExt {
    /// Create angle from milliarcseconds
    fn from_milliarcseconds(mas: f64) -> Self;

    /// Get angle in milliarcseconds
    fn as_milliarcseconds(&self) -> f64;

    /// Create angle from arcseconds
    fn from_arcseconds(arcsec: f64) -> Self;

    /// Get angle in arcseconds
    fn as_arcseconds(&self) -> f64;
}

impl AngleExt for Angle {
    fn from_milliarcseconds(mas: f64) -> Self {
        Angle::new::<second>(mas / 1000.0)
    }

    fn as_milliarcseconds(&self) -> f64 {
        self.get::<second>() * 1000.0
    }

    fn from_arcseconds(arcsec: f64) -> Self {
        Angle::new::<second>(arcsec)
    }

    fn as_arcseconds(&self) -> f64 {
        self.get::<second>()
    }
}

/// Solid angle subtended by one square pixel.
pub fn pixel_solid_angle(pixel_scale_mas: f64) -> SolidAngle {
    let side = Angle::from_milliarcseconds(pixel_scale_mas).get::<radian>();
    SolidAngle::new::<steradian>(side * side)
}

/// Solid angle of one square pixel, in steradians.
pub fn pixel_solid_angle_sr(pixel_scale_mas: f64) -> f64 {
    pixel_solid_angle(pixel_scale_mas).get::<steradian>()
}

/// Convert a separation in pixels to arcseconds.
pub fn pixels_to_arcsec(pixels: f64, pixel_scale_mas: f64) -> f64 {
    Angle::from_milliarcseconds(pixels * pixel_scale_mas).as_arcseconds()
}

/// Diffraction FWHM `lambda / D` expressed in pixels.
pub fn fwhm_pixels(wavelength_m: f64, aperture_diameter_m: f64, pixel_scale_mas: f64) -> f64 {
    Angle::new::<radian>(wavelength_m / aperture_diameter_m).as_milliarcseconds()
        / pixel_scale_mas
}

/// Flux density in Jy of a source of Vega magnitude `magnitude`.
pub fn vegamag_to_jansky(magnitude: f64, zero_point_jy: f64) -> f64 {
    zero_point_jy * 10f64.powf(-magnitude / 2.5)
}

/// Peak surface brightness of the host star, in MJy/sr.
///
/// `psf_peak` is the peak pixel of the unocculted reference PSF normalized
/// to unit total flux, so `flux * psf_peak` is the flux landing in the
/// brightest pixel. Dividing by the pixel solid angle gives the surface
/// brightness the detector images are calibrated in. This is the
/// normalization that turns image noise into contrast.
pub fn star_peak_surface_brightness(
    magnitude: f64,
    zero_point_jy: f64,
    psf_peak: f64,
    pixel_scale_mas: f64,
) -> f64 {
    let peak_mjy = vegamag_to_jansky(magnitude, zero_point_jy) / 1e6 * psf_peak;
    peak_mjy / pixel_solid_angle_sr(pixel_scale_mas)
}

/// Surface brightness (MJy/sr) of a point source at `contrast`.
pub fn contrast_to_surface_brightness(contrast: f64, normalization: f64) -> f64 {
    contrast * normalization
}

/// Contrast of a point source whose peak surface brightness is `surface_brightness`.
pub fn surface_brightness_to_contrast(surface_brightness: f64, normalization: f64) -> f64 {
    surface_brightness / normalization
}
