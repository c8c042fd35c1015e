//! GPS locations and their packed index form.
//!
//! Coordinates are carried on the wire as integers scaled by 1e7 and stored
//! as signed decimal degrees. For index use each coordinate is additionally
//! quantized to 16 bits and packed into a single `u32` cell (latitude in the
//! high half), giving ~0.005 degree granularity.

use serde::{Deserialize, Serialize};

use crate::{Result, TypesError};

/// Scale factor between wire integers and decimal degrees.
pub const E7: f64 = 10_000_000.0;

/// A validated GPS location in signed decimal degrees.
///
/// Latitude is in `[-90, 90]`; longitude is normalized to `(-180, 180]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsLocation {
    latitude: f64,
    longitude: f64,
}

impl Default for GpsLocation {
    /// The null island origin, used for profiles whose owner has not set
    /// a location yet.
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
        }
    }
}

impl GpsLocation {
    /// Create a location from decimal degrees, validating ranges.
    ///
    /// A longitude of exactly -180 is folded to 180.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(TypesError::invalid("latitude", format!("{latitude}")));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(TypesError::invalid("longitude", format!("{longitude}")));
        }
        let longitude = if longitude == -180.0 { 180.0 } else { longitude };
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Create a location from 1e7-scaled wire integers.
    pub fn from_e7(latitude_e7: i32, longitude_e7: i32) -> Result<Self> {
        Self::new(f64::from(latitude_e7) / E7, f64::from(longitude_e7) / E7)
    }

    /// Latitude in decimal degrees.
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in decimal degrees.
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Latitude as a 1e7-scaled wire integer.
    pub fn latitude_e7(&self) -> i32 {
        (self.latitude * E7).round() as i32
    }

    /// Longitude as a 1e7-scaled wire integer.
    pub fn longitude_e7(&self) -> i32 {
        (self.longitude * E7).round() as i32
    }

    /// Pack both coordinates into the 32-bit index cell.
    pub fn cell(&self) -> u32 {
        let lat = quantize(self.latitude, 90.0);
        let lon = quantize(self.longitude, 180.0);
        (u32::from(lat) << 16) | u32::from(lon)
    }
}

/// Quantize a coordinate in `[-range, range]` to 16 bits.
fn quantize(value: f64, range: f64) -> u16 {
    let unit = (value + range) / (2.0 * range);
    (unit * f64::from(u16::MAX)).round() as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_location() {
        let loc = GpsLocation::new(50.08, 14.43).expect("valid");
        assert!((loc.latitude() - 50.08).abs() < 1e-9);
        assert!((loc.longitude() - 14.43).abs() < 1e-9);
    }

    #[test]
    fn test_latitude_out_of_range() {
        assert!(GpsLocation::new(90.1, 0.0).is_err());
        assert!(GpsLocation::new(-90.1, 0.0).is_err());
        assert!(GpsLocation::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_longitude_out_of_range() {
        assert!(GpsLocation::new(0.0, 180.1).is_err());
        assert!(GpsLocation::new(0.0, -180.1).is_err());
    }

    #[test]
    fn test_antimeridian_folds() {
        let loc = GpsLocation::new(0.0, -180.0).expect("valid");
        assert_eq!(loc.longitude(), 180.0);
    }

    #[test]
    fn test_e7_roundtrip() {
        let loc = GpsLocation::from_e7(500_800_000, 144_300_000).expect("valid");
        assert_eq!(loc.latitude_e7(), 500_800_000);
        assert_eq!(loc.longitude_e7(), 144_300_000);
    }

    #[test]
    fn test_cell_distinguishes_hemispheres() {
        let a = GpsLocation::new(45.0, 90.0).expect("valid");
        let b = GpsLocation::new(-45.0, -90.0).expect("valid");
        assert_ne!(a.cell(), b.cell());
    }

    #[test]
    fn test_cell_is_stable() {
        let a = GpsLocation::new(50.08, 14.43).expect("valid");
        let b = GpsLocation::new(50.08, 14.43).expect("valid");
        assert_eq!(a.cell(), b.cell());
    }
}
