//! The driver document held in the dispatch store, and partial updates to it.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::gis::{Coordinate, InvalidCoordinate};

/// Identifier of a driver, also the key of their document in the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DriverId(String);

impl DriverId {
    /// Construct a new [`DriverId`].
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl AsRef<str> for DriverId {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Display for DriverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Whether the driver currently has a ride assigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    /// No ride assigned.
    #[default]
    Free,
    /// A ride has been assigned and is in progress.
    Busy,
}

impl RideStatus {
    /// The value stored in the `status` field.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RideStatus::Free => "free",
            RideStatus::Busy => "busy",
        }
    }

    /// Interpret a stored `status` value. Anything other than `"busy"` means no ride.
    #[must_use]
    pub fn from_store(value: &str) -> Self {
        match value {
            "busy" => RideStatus::Busy,
            "free" => RideStatus::Free,
            other => {
                tracing::warn!("Unexpected ride status {:?}, treating it as free", other);
                RideStatus::Free
            }
        }
    }
}

impl Display for RideStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One component of a stored location. The dispatcher writes components either as numbers
/// or as decimal strings.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationComponent {
    /// A numeric component.
    Number(f64),
    /// A textual component, `"0"` meaning "not set".
    Text(String),
}

impl LocationComponent {
    fn is_unset_text(&self) -> bool {
        matches!(self, LocationComponent::Text(text) if text.trim() == "0")
    }

    fn value(&self) -> Result<f64, InvalidLocation> {
        match self {
            LocationComponent::Number(value) => Ok(*value),
            LocationComponent::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| InvalidLocation::Component(text.clone())),
        }
    }
}

/// A location as stored, before validation. See [`RawLocation::parse()`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawLocation {
    /// Latitude component.
    pub latitude: LocationComponent,
    /// Longitude component.
    pub longitude: LocationComponent,
}

/// A stored location that is neither a valid coordinate nor the "not set" sentinel.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidLocation {
    /// A component could not be read as a number.
    #[error("Unable to parse location component {0:?} as a number")]
    Component(String),
    /// The components are out of range.
    #[error(transparent)]
    Coordinate(#[from] InvalidCoordinate),
}

impl RawLocation {
    /// The value written when a ride is completed, `[0, 0]`.
    #[must_use]
    pub fn cleared() -> Self {
        Self {
            latitude: LocationComponent::Number(0.0),
            longitude: LocationComponent::Number(0.0),
        }
    }

    /// The value written for a newly registered driver, `["0", "0"]`.
    #[must_use]
    pub fn unset() -> Self {
        Self {
            latitude: LocationComponent::Text("0".to_string()),
            longitude: LocationComponent::Text("0".to_string()),
        }
    }

    /// Validate this location. Returns `Ok(None)` for the "not set" sentinels: `(0, 0)`, or
    /// either component being the text `"0"`.
    pub fn parse(&self) -> Result<Option<Coordinate>, InvalidLocation> {
        if self.latitude.is_unset_text() || self.longitude.is_unset_text() {
            return Ok(None);
        }
        let coordinate = Coordinate::try_new(self.latitude.value()?, self.longitude.value()?)?;
        if coordinate.is_sentinel() {
            return Ok(None);
        }
        Ok(Some(coordinate))
    }
}

impl From<Coordinate> for RawLocation {
    fn from(coordinate: Coordinate) -> Self {
        Self {
            latitude: LocationComponent::Number(coordinate.latitude),
            longitude: LocationComponent::Number(coordinate.longitude),
        }
    }
}

/// Details a driver provides when registering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverProfile {
    /// Name shown to the dispatcher and the patient.
    pub driver_name: String,
    /// Make of the ambulance.
    pub make: String,
    /// Number plate of the ambulance.
    pub number_plate: String,
}

/// The document describing one driver and their ambulance.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DriverDocument {
    /// Ride status, written by the dispatcher and by [`DocumentUpdate::complete_ride()`].
    pub status: RideStatus,
    /// Last published location of the driver.
    pub driver_location: Option<Coordinate>,
    /// Location of the patient for the current ride, written by the dispatcher.
    pub patient_location: Option<RawLocation>,
    /// Name of the driver.
    pub driver_name: String,
    /// Make of the ambulance.
    pub make: String,
    /// Number plate of the ambulance.
    pub number_plate: String,
}

impl DriverDocument {
    /// The document created when a driver registers: free, with no patient location.
    #[must_use]
    pub fn from_profile(profile: &DriverProfile) -> Self {
        Self {
            status: RideStatus::Free,
            driver_location: None,
            patient_location: Some(RawLocation::unset()),
            driver_name: profile.driver_name.clone(),
            make: profile.make.clone(),
            number_plate: profile.number_plate.clone(),
        }
    }

    /// The patient location, if one is set.
    pub fn patient_target(&self) -> Result<Option<Coordinate>, InvalidLocation> {
        match &self.patient_location {
            Some(location) => location.parse(),
            None => Ok(None),
        }
    }
}

/// A partial update of a [`DriverDocument`]. Fields left as `None` are not modified.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentUpdate {
    /// New ride status.
    pub status: Option<RideStatus>,
    /// New driver location.
    pub driver_location: Option<Coordinate>,
    /// New patient location.
    pub patient_location: Option<RawLocation>,
}

impl DocumentUpdate {
    /// Publish the driver's location.
    #[must_use]
    pub fn driver_location(coordinate: Coordinate) -> Self {
        Self {
            driver_location: Some(coordinate),
            ..Self::default()
        }
    }

    /// Mark the current ride complete: status `free` and the patient location cleared.
    #[must_use]
    pub fn complete_ride() -> Self {
        Self {
            status: Some(RideStatus::Free),
            patient_location: Some(RawLocation::cleared()),
            ..Self::default()
        }
    }

    /// Apply this update to `document`.
    pub fn apply(&self, document: &mut DriverDocument) {
        if let Some(status) = self.status {
            document.status = status;
        }
        if let Some(driver_location) = self.driver_location {
            document.driver_location = Some(driver_location);
        }
        if let Some(patient_location) = &self.patient_location {
            document.patient_location = Some(patient_location.clone());
        }
    }
}

/// The state of a driver's document at some point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    /// Key of the document.
    pub key: DriverId,
    /// Contents, `None` if the document does not exist.
    pub document: Option<DriverDocument>,
}

#[cfg(test)]
mod test {
    use crate::gis::Coordinate;

    use super::{
        DocumentUpdate, DriverDocument, DriverProfile, InvalidLocation, LocationComponent,
        RawLocation, RideStatus,
    };

    fn text(latitude: &str, longitude: &str) -> RawLocation {
        RawLocation {
            latitude: LocationComponent::Text(latitude.to_string()),
            longitude: LocationComponent::Text(longitude.to_string()),
        }
    }

    #[test]
    fn test_parse_text_location() {
        assert_eq!(
            Ok(Some(Coordinate::new(33.6938, 73.0652))),
            text("33.6938", " 73.0652").parse()
        );
    }

    #[test]
    fn test_parse_sentinels() {
        assert_eq!(Ok(None), text("0", "0").parse());
        assert_eq!(Ok(None), text("0", "73.0652").parse());
        assert_eq!(Ok(None), RawLocation::cleared().parse());
        assert_eq!(Ok(None), RawLocation::unset().parse());
        assert_eq!(Ok(None), text("0.0", "0.000").parse());
    }

    #[test]
    fn test_parse_malformed() {
        assert_eq!(
            Err(InvalidLocation::Component("north".to_string())),
            text("north", "73.0").parse()
        );
        assert!(matches!(
            RawLocation::from(Coordinate::new(95.0, 10.0)).parse(),
            Err(InvalidLocation::Coordinate(_))
        ));
    }

    #[test]
    fn test_ride_status_from_store() {
        assert_eq!(RideStatus::Busy, RideStatus::from_store("busy"));
        assert_eq!(RideStatus::Free, RideStatus::from_store("free"));
        assert_eq!(RideStatus::Free, RideStatus::from_store("offline"));
    }

    #[test]
    fn test_complete_ride_update() {
        let mut document = DriverDocument::from_profile(&DriverProfile {
            driver_name: "Ahmed".to_string(),
            make: "Toyota Hiace".to_string(),
            number_plate: "ICT-4521".to_string(),
        });
        document.status = RideStatus::Busy;
        document.patient_location = Some(text("33.6938", "73.0652"));
        document.driver_location = Some(Coordinate::new(33.7, 73.05));

        DocumentUpdate::complete_ride().apply(&mut document);

        assert_eq!(RideStatus::Free, document.status);
        assert_eq!(Ok(None), document.patient_target());
        assert_eq!(Some(Coordinate::new(33.7, 73.05)), document.driver_location);
    }
}
