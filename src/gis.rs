//! Types and functions relating to geography computation.

use serde::{Deserialize, Serialize};

/// Mean radius of the Earth used for great-circle distances.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// A WGS84 position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coordinate {
    /// Latitude of the position (in degrees).
    pub latitude: f64,
    /// Longitude of the position (in degrees).
    pub longitude: f64,
}

/// Error returned by [`Coordinate::try_new()`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid coordinate ({latitude}, {longitude})")]
pub struct InvalidCoordinate {
    /// Rejected latitude.
    pub latitude: f64,
    /// Rejected longitude.
    pub longitude: f64,
}

impl Coordinate {
    /// The `(0, 0)` coordinate, which the dispatch store uses to mean "no location set".
    pub const SENTINEL: Coordinate = Coordinate::new(0.0, 0.0);

    /// Construct a new [`Coordinate`] without validation.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Construct a new [`Coordinate`], rejecting non-finite or out of range components.
    pub fn try_new(latitude: f64, longitude: f64) -> Result<Self, InvalidCoordinate> {
        if latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude)
        {
            Ok(Self::new(latitude, longitude))
        } else {
            Err(InvalidCoordinate {
                latitude,
                longitude,
            })
        }
    }

    /// Whether this is the `(0, 0)` "no location" sentinel.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.latitude == 0.0 && self.longitude == 0.0
    }

    /// Great-circle distance to `other` in kilometers, using the haversine formula.
    #[must_use]
    pub fn ground_distance_km(&self, other: &Coordinate) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let delta_lat = (other.latitude - self.latitude).to_radians();
        let delta_lon = (other.longitude - self.longitude).to_radians();

        let a = (delta_lat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (delta_lon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_KM * c
    }

    /// Great-circle distance to `other` in meters.
    #[must_use]
    pub fn ground_distance_m(&self, other: &Coordinate) -> f64 {
        self.ground_distance_km(other) * 1000.0
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}, {:.6}", self.latitude, self.longitude)
    }
}
