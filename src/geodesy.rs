//! Geodetic <-> local planar frame conversion.
//!
//! The local frame is the UTM grid of the origin's zone shifted so that the origin sits at
//! `(0, 0)`. Points far outside the origin's zone are still projected in that zone, which is
//! the same behaviour lanelet2 maps are authored against.

use crate::error::{FleetError, Result};
use nalgebra as na;
use serde::{Deserialize, Serialize};

const SEMI_MAJOR_AXIS: f64 = 6_378_137.0;
const FLATTENING: f64 = 1.0 / 298.257_223_563;
const SCALE_FACTOR: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// WGS84 position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Krüger series in `n` to sixth order, rows are the `alpha`/`beta` terms `j = 1..6` and
/// columns the coefficients of `n^1..n^6`
const ALPHA: [[f64; 6]; 6] = [
    [1. / 2., -2. / 3., 5. / 16., 41. / 180., -127. / 288., 7891. / 37800.],
    [0., 13. / 48., -3. / 5., 557. / 1440., 281. / 630., -1983433. / 1935360.],
    [0., 0., 61. / 240., -103. / 140., 15061. / 26880., 167603. / 181440.],
    [0., 0., 0., 49561. / 161280., -179. / 168., 6601661. / 7257600.],
    [0., 0., 0., 0., 34729. / 80640., -3418889. / 1995840.],
    [0., 0., 0., 0., 0., 212378941. / 319334400.],
];
const BETA: [[f64; 6]; 6] = [
    [1. / 2., -2. / 3., 37. / 96., -1. / 360., -81. / 512., 96199. / 604800.],
    [0., 1. / 48., 1. / 15., -437. / 1440., 46. / 105., -1118711. / 3870720.],
    [0., 0., 17. / 480., -37. / 840., -209. / 4480., 5569. / 90720.],
    [0., 0., 0., 4397. / 161280., -11. / 504., -830251. / 7257600.],
    [0., 0., 0., 0., 4583. / 161280., -108847. / 3991680.],
    [0., 0., 0., 0., 0., 20648693. / 638668800.],
];

fn series_terms(table: [[f64; 6]; 6], n: f64) -> [f64; 6] {
    table.map(|row| row.iter().rev().fold(0.0, |acc, c| (acc + c) * n))
}

/// Transverse mercator series for one ellipsoid
#[derive(Debug, Clone, Copy)]
struct Series {
    rectifying_radius: f64,
    alpha: [f64; 6],
    beta: [f64; 6],
    /// first eccentricity, `2 * sqrt(n) / (1 + n)`
    eccentricity: f64,
}

impl Series {
    fn wgs84() -> Self {
        let n = FLATTENING / (2.0 - FLATTENING);
        let n2 = n * n;
        Self {
            rectifying_radius: SEMI_MAJOR_AXIS / (1.0 + n)
                * (1.0 + n2 / 4.0 + n2 * n2 / 64.0 + n2 * n2 * n2 / 256.0),
            alpha: series_terms(ALPHA, n),
            beta: series_terms(BETA, n),
            eccentricity: 2.0 * n.sqrt() / (1.0 + n),
        }
    }

    /// tan of the conformal latitude for `tau = tan(phi)`
    fn conformal_tan(&self, tau: f64) -> f64 {
        let e = self.eccentricity;
        let tau1 = tau.hypot(1.0);
        let sig = (e * (e * tau / tau1).atanh()).sinh();
        sig.hypot(1.0) * tau - sig * tau1
    }

    /// Inverse of `conformal_tan` by Newton iteration, exact to machine precision
    fn geodetic_tan(&self, conformal: f64) -> f64 {
        let e2m = 1.0 - self.eccentricity * self.eccentricity;
        let mut tau = conformal / e2m;
        for _ in 0..5 {
            let estimate = self.conformal_tan(tau);
            let step = (conformal - estimate) * (1.0 + e2m * tau * tau)
                / (e2m * tau.hypot(1.0) * estimate.hypot(1.0));
            tau += step;
            if step.abs() < f64::EPSILON.sqrt() * 0.1 * tau.abs().max(1.0) {
                break;
            }
        }
        tau
    }
}

/// Projects between WGS84 and a local UTM frame anchored at a fixed origin.
#[derive(Debug, Clone, Copy)]
pub struct UtmProjector {
    origin: GeoPoint,
    zone: u8,
    northern: bool,
    central_meridian: f64,
    origin_easting: f64,
    origin_northing: f64,
    series: Series,
}

impl UtmProjector {
    pub fn new(origin: GeoPoint) -> Result<Self> {
        let valid = origin.lat.is_finite()
            && origin.lon.is_finite()
            && (-80.0..=84.0).contains(&origin.lat)
            && (-180.0..=180.0).contains(&origin.lon);
        if !valid {
            return Err(FleetError::InvalidOrigin {
                lat: origin.lat,
                lon: origin.lon,
            });
        }
        let zone = standard_zone(origin.lat, origin.lon);
        let mut projector = Self {
            origin,
            zone,
            northern: origin.lat >= 0.0,
            central_meridian: (f64::from(zone) - 1.0) * 6.0 - 180.0 + 3.0,
            origin_easting: 0.0,
            origin_northing: 0.0,
            series: Series::wgs84(),
        };
        let (easting, northing) = projector.to_grid(origin);
        projector.origin_easting = easting;
        projector.origin_northing = northing;
        Ok(projector)
    }

    pub fn origin(&self) -> GeoPoint {
        self.origin
    }

    pub fn zone(&self) -> u8 {
        self.zone
    }

    /// Geodetic to local frame
    pub fn forward(&self, point: GeoPoint) -> na::Point2<f64> {
        let (easting, northing) = self.to_grid(point);
        na::Point2::new(
            easting - self.origin_easting,
            northing - self.origin_northing,
        )
    }

    /// Local frame to geodetic
    pub fn reverse(&self, point: na::Point2<f64>) -> GeoPoint {
        self.from_grid(
            point.x + self.origin_easting,
            point.y + self.origin_northing,
        )
    }

    fn false_northing(&self) -> f64 {
        if self.northern {
            0.0
        } else {
            FALSE_NORTHING_SOUTH
        }
    }

    fn to_grid(&self, point: GeoPoint) -> (f64, f64) {
        let s = &self.series;
        let phi = point.lat.to_radians();
        let lambda = (point.lon - self.central_meridian).to_radians();

        let t = s.conformal_tan(phi.tan());
        let xi_prime = t.atan2(lambda.cos());
        let eta_prime = (lambda.sin() / (1.0 + t * t).sqrt()).atanh();

        let mut xi = xi_prime;
        let mut eta = eta_prime;
        for (j, alpha) in s.alpha.iter().enumerate() {
            let k = 2.0 * (j as f64 + 1.0);
            xi += alpha * (k * xi_prime).sin() * (k * eta_prime).cosh();
            eta += alpha * (k * xi_prime).cos() * (k * eta_prime).sinh();
        }

        let scale = SCALE_FACTOR * s.rectifying_radius;
        (FALSE_EASTING + scale * eta, self.false_northing() + scale * xi)
    }

    fn from_grid(&self, easting: f64, northing: f64) -> GeoPoint {
        let s = &self.series;
        let scale = SCALE_FACTOR * s.rectifying_radius;
        let xi = (northing - self.false_northing()) / scale;
        let eta = (easting - FALSE_EASTING) / scale;

        let mut xi_prime = xi;
        let mut eta_prime = eta;
        for (j, beta) in s.beta.iter().enumerate() {
            let k = 2.0 * (j as f64 + 1.0);
            xi_prime -= beta * (k * xi).sin() * (k * eta).cosh();
            eta_prime -= beta * (k * xi).cos() * (k * eta).sinh();
        }

        let conformal = xi_prime.sin() / eta_prime.sinh().hypot(xi_prime.cos());
        let phi = s.geodetic_tan(conformal).atan();
        let lambda = eta_prime.sinh().atan2(xi_prime.cos());

        GeoPoint::new(phi.to_degrees(), self.central_meridian + lambda.to_degrees())
    }
}

/// UTM zone including the Norway and Svalbard exceptions
fn standard_zone(lat: f64, lon: f64) -> u8 {
    let lon = if lon >= 180.0 { lon - 360.0 } else { lon };
    let mut zone = ((lon + 180.0) / 6.0).floor() as i32 + 1;
    if (56.0..64.0).contains(&lat) && (3.0..12.0).contains(&lon) {
        zone = 32;
    }
    if (72.0..=84.0).contains(&lat) && lon >= 0.0 {
        zone = match lon {
            l if l < 9.0 => 31,
            l if l < 21.0 => 33,
            l if l < 33.0 => 35,
            l if l < 42.0 => 37,
            _ => zone,
        };
    }
    zone.clamp(1, 60) as u8
}
