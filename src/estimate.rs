//! Distance and arrival time estimates between the driver and the patient.

use std::fmt::Display;

use crate::gis::Coordinate;

/// Average speed assumed when estimating arrival time.
pub const DEFAULT_AVERAGE_SPEED_KMPH: f64 = 60.0;

/// Unit that a [`DistanceEstimate`] is reported in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceUnit {
    /// Whole meters.
    Meters,
    /// Kilometers, to one decimal place.
    Kilometers,
}

/// A rounded, human readable distance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistanceEstimate {
    /// Rounded magnitude in [`DistanceEstimate::unit`].
    pub magnitude: f64,
    /// Unit of [`DistanceEstimate::magnitude`].
    pub unit: DistanceUnit,
}

impl DistanceEstimate {
    /// The estimated distance in kilometers.
    #[must_use]
    pub fn kilometers(&self) -> f64 {
        match self.unit {
            DistanceUnit::Meters => self.magnitude / 1000.0,
            DistanceUnit::Kilometers => self.magnitude,
        }
    }
}

impl Display for DistanceEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.unit {
            DistanceUnit::Meters => write!(f, "{:.0} meters", self.magnitude),
            DistanceUnit::Kilometers => write!(f, "{:.1} km", self.magnitude),
        }
    }
}

/// Estimated travel time, formatted `"<m> min"` or `"<h> hr <m> min"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeEstimate {
    /// Formatted estimate.
    pub display: String,
}

impl Display for TimeEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.display.fmt(f)
    }
}

/// An estimate was requested with an unusable configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Invalid configuration: {0}")]
pub struct InvalidConfiguration(pub String);

/// Check that `average_speed_kmph` can be used in [`estimate_time()`].
pub fn validate_average_speed(average_speed_kmph: f64) -> Result<(), InvalidConfiguration> {
    if average_speed_kmph.is_finite() && average_speed_kmph > 0.0 {
        Ok(())
    } else {
        Err(InvalidConfiguration(format!(
            "average speed must be a positive number of km/h, got {}",
            average_speed_kmph
        )))
    }
}

/// Great-circle distance between `a` and `b`, in kilometers (one decimal place) when more
/// than 1 km, otherwise in whole meters.
#[must_use]
pub fn estimate_distance(a: &Coordinate, b: &Coordinate) -> DistanceEstimate {
    let kilometers = a.ground_distance_km(b);
    if kilometers > 1.0 {
        DistanceEstimate {
            magnitude: (kilometers * 10.0).round() / 10.0,
            unit: DistanceUnit::Kilometers,
        }
    } else {
        DistanceEstimate {
            magnitude: (kilometers * 1000.0).round(),
            unit: DistanceUnit::Meters,
        }
    }
}

/// Time to travel `distance` at `average_speed_kmph`.
pub fn estimate_time(
    distance: &DistanceEstimate,
    average_speed_kmph: f64,
) -> Result<TimeEstimate, InvalidConfiguration> {
    validate_average_speed(average_speed_kmph)?;
    let minutes = distance.kilometers() / average_speed_kmph * 60.0;

    let display = if minutes > 60.0 {
        let mut hours = (minutes / 60.0).floor();
        let mut remainder = (minutes % 60.0).round();
        // 119.6 minutes rounds to "2 hr 0 min", not "1 hr 60 min".
        if remainder >= 60.0 {
            hours += 1.0;
            remainder = 0.0;
        }
        format!("{:.0} hr {:.0} min", hours, remainder)
    } else {
        format!("{:.0} min", minutes.round())
    };

    Ok(TimeEstimate { display })
}

/// Distance and arrival time from the driver to the patient.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    /// Distance remaining.
    pub distance: DistanceEstimate,
    /// Time remaining.
    pub time: TimeEstimate,
}

/// Estimate the distance and travel time from `from` to `to`.
pub fn estimate(
    from: &Coordinate,
    to: &Coordinate,
    average_speed_kmph: f64,
) -> Result<Estimate, InvalidConfiguration> {
    let distance = estimate_distance(from, to);
    let time = estimate_time(&distance, average_speed_kmph)?;
    Ok(Estimate { distance, time })
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;

    use crate::gis::Coordinate;

    use super::{
        estimate, estimate_distance, estimate_time, DistanceEstimate, DistanceUnit,
        DEFAULT_AVERAGE_SPEED_KMPH,
    };

    fn km(magnitude: f64) -> DistanceEstimate {
        DistanceEstimate {
            magnitude,
            unit: DistanceUnit::Kilometers,
        }
    }

    #[test]
    fn test_distance_same_point_is_zero_meters() {
        let a = Coordinate::new(33.6844, 73.0479);
        let estimate = estimate_distance(&a, &a);
        assert_eq!(DistanceUnit::Meters, estimate.unit);
        assert_eq!(0.0, estimate.magnitude);
        assert_eq!("0 meters", estimate.to_string());
    }

    #[test]
    fn test_distance_equator_degree() {
        let estimate = estimate_distance(&Coordinate::new(0.0, 0.0), &Coordinate::new(0.0, 1.0));
        assert_eq!(DistanceUnit::Kilometers, estimate.unit);
        assert_relative_eq!(111.2, estimate.magnitude);
        assert_eq!("111.2 km", estimate.to_string());
    }

    #[test]
    fn test_distance_symmetric() {
        let a = Coordinate::new(33.6844, 73.0479);
        let b = Coordinate::new(33.7001, 73.0612);
        assert_eq!(estimate_distance(&a, &b), estimate_distance(&b, &a));
    }

    #[test]
    fn test_distance_below_one_km_in_meters() {
        // 0.005 degrees of latitude is roughly 556 m.
        let estimate = estimate_distance(
            &Coordinate::new(33.0, 73.0),
            &Coordinate::new(33.005, 73.0),
        );
        assert_eq!(DistanceUnit::Meters, estimate.unit);
        assert_eq!("556 meters", estimate.to_string());
    }

    #[test]
    fn test_time_estimates() {
        assert_eq!(
            "30 min",
            estimate_time(&km(30.0), DEFAULT_AVERAGE_SPEED_KMPH)
                .unwrap()
                .display
        );
        assert_eq!(
            "1 hr 30 min",
            estimate_time(&km(90.0), DEFAULT_AVERAGE_SPEED_KMPH)
                .unwrap()
                .display
        );
        assert_eq!(
            "60 min",
            estimate_time(&km(60.0), DEFAULT_AVERAGE_SPEED_KMPH)
                .unwrap()
                .display
        );
        assert_eq!(
            "2 hr 0 min",
            estimate_time(&km(119.7), DEFAULT_AVERAGE_SPEED_KMPH)
                .unwrap()
                .display
        );
    }

    #[test]
    fn test_time_estimate_from_meters() {
        let distance = DistanceEstimate {
            magnitude: 650.0,
            unit: DistanceUnit::Meters,
        };
        assert_eq!(
            "1 min",
            estimate_time(&distance, DEFAULT_AVERAGE_SPEED_KMPH)
                .unwrap()
                .display
        );
    }

    #[test]
    fn test_time_estimate_rejects_non_positive_speed() {
        assert!(estimate_time(&km(10.0), 0.0).is_err());
        assert!(estimate_time(&km(10.0), -20.0).is_err());
        assert!(estimate_time(&km(10.0), f64::NAN).is_err());
    }

    #[test]
    fn test_estimate_combines_distance_and_time() {
        let estimate = estimate(
            &Coordinate::new(0.0, 0.0),
            &Coordinate::new(0.0, 1.0),
            DEFAULT_AVERAGE_SPEED_KMPH,
        )
        .unwrap();
        assert_eq!("111.2 km", estimate.distance.to_string());
        assert_eq!("1 hr 51 min", estimate.time.to_string());
    }
}
