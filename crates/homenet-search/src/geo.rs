//! Great-circle geometry and bounding-predicate derivation.
//!
//! All math works on a spherical Earth of radius 6 371 000 m, which is
//! accurate to well under 1% — more than enough for a coarse storage
//! predicate that stage 2 refines with the exact same metric.

use homenet_types::GpsLocation;

use crate::MAX_FILTERED_RADIUS_M;

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Coarse geographic predicate pushed into storage.
#[derive(Clone, Debug, PartialEq)]
pub enum GeoBounds {
    /// No geographic restriction.
    None,
    /// The circle covers the north pole: only a southern latitude limit.
    MinLat(f64),
    /// The circle covers the south pole: only a northern latitude limit.
    MaxLat(f64),
    /// A bounding rectangle that does not cross the antimeridian.
    Rect {
        min_lat: f64,
        max_lat: f64,
        min_lon: f64,
        max_lon: f64,
    },
    /// A bounding rectangle crossing the antimeridian:
    /// `lon >= west_from OR lon <= east_to`.
    SplitRect {
        min_lat: f64,
        max_lat: f64,
        west_from: f64,
        east_to: f64,
    },
}

/// Exact great-circle distance between two points in metres (haversine).
pub fn distance_m(a: GpsLocation, b: GpsLocation) -> f64 {
    let lat_a = a.latitude().to_radians();
    let lat_b = b.latitude().to_radians();
    let d_lat = (b.latitude() - a.latitude()).to_radians();
    let d_lon = (b.longitude() - a.longitude()).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Walk `distance_m` metres from `origin` along the given bearing
/// (degrees clockwise from north) and return the destination latitude and
/// longitude in degrees. The longitude is normalized to `(-180, 180]`.
fn destination(origin: GpsLocation, bearing_deg: f64, distance_m: f64) -> (f64, f64) {
    let lat1 = origin.latitude().to_radians();
    let lon1 = origin.longitude().to_radians();
    let bearing = bearing_deg.to_radians();
    let delta = distance_m / EARTH_RADIUS_M;

    let lat2 = (lat1.sin() * delta.cos() + lat1.cos() * delta.sin() * bearing.cos()).asin();
    let lon2 = lon1
        + (bearing.sin() * delta.sin() * lat1.cos()).atan2(delta.cos() - lat1.sin() * lat2.sin());

    (
        lat2.to_degrees().clamp(-90.0, 90.0),
        normalize_lon(lon2.to_degrees()),
    )
}

/// Fold a longitude into `(-180, 180]`.
fn normalize_lon(lon: f64) -> f64 {
    let mut lon = (lon + 180.0).rem_euclid(360.0) - 180.0;
    if lon == -180.0 {
        lon = 180.0;
    }
    lon
}

/// Derive the storage predicate for a (center, radius) circle.
///
/// - Radius above 5 000 000 m: no predicate, every candidate passes to
///   stage 2.
/// - Circle reaching a pole: a single latitude bound, no longitude bound.
/// - Otherwise a spherical bounding rectangle, split in two longitude
///   ranges when it crosses the antimeridian.
pub fn bounds_for(center: GpsLocation, radius_m: f64) -> GeoBounds {
    if radius_m > MAX_FILTERED_RADIUS_M {
        return GeoBounds::None;
    }

    let north_pole = pole(90.0, center);
    let south_pole = pole(-90.0, center);
    if radius_m >= distance_m(center, north_pole) {
        let (min_lat, _) = destination(center, 180.0, radius_m);
        return GeoBounds::MinLat(min_lat);
    }
    if radius_m >= distance_m(center, south_pole) {
        let (max_lat, _) = destination(center, 0.0, radius_m);
        return GeoBounds::MaxLat(max_lat);
    }

    let (min_lat, _) = destination(center, 180.0, radius_m);
    let (max_lat, _) = destination(center, 0.0, radius_m);

    // The longitude expansion is widest at the rectangle latitude closest
    // to a pole; expanding every corner by that much keeps the whole
    // circle inside the rectangle.
    let delta = radius_m / EARTH_RADIUS_M;
    let widest_lat = if min_lat.abs() > max_lat.abs() {
        min_lat
    } else {
        max_lat
    }
    .to_radians();
    let sin_ratio = delta.sin() / widest_lat.cos();
    if !sin_ratio.is_finite() || sin_ratio.abs() >= 1.0 {
        // Degenerate expansion next to a pole: keep the latitude band only.
        return GeoBounds::Rect {
            min_lat,
            max_lat,
            min_lon: -180.0,
            max_lon: 180.0,
        };
    }
    let d_lon = sin_ratio.asin().to_degrees();

    let west = normalize_lon(center.longitude() - d_lon);
    let east = normalize_lon(center.longitude() + d_lon);
    if west <= east {
        GeoBounds::Rect {
            min_lat,
            max_lat,
            min_lon: west,
            max_lon: east,
        }
    } else {
        GeoBounds::SplitRect {
            min_lat,
            max_lat,
            west_from: west,
            east_to: east,
        }
    }
}

/// A point at the given latitude on the center's meridian.
fn pole(latitude: f64, center: GpsLocation) -> GpsLocation {
    // The constructor cannot fail for a +/-90 latitude and a longitude
    // taken from an already-valid location.
    GpsLocation::new(latitude, center.longitude()).unwrap_or(center)
}
