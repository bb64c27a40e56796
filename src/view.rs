//! Text rendering of the driver's dashboard. One view covers both the waiting for a ride and
//! the ride in progress states.

use std::fmt::Write;

use crate::{estimate::Estimate, gis::Coordinate, store::RideStatus};

/// Everything shown to the driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dashboard {
    /// Name of the driver.
    pub driver_name: String,
    /// Make of the ambulance.
    pub make: String,
    /// Number plate of the ambulance.
    pub number_plate: String,
    /// Current ride status.
    pub status: RideStatus,
    /// Latest known location of the driver.
    pub location: Option<Coordinate>,
    /// Location of the patient.
    pub target: Option<Coordinate>,
    /// Distance and time to the patient.
    pub estimate: Option<Estimate>,
    /// Whether the driver's location is being shared.
    pub tracking: bool,
    /// A problem the driver should know about.
    pub notice: Option<String>,
}

fn location_text(location: Option<Coordinate>) -> String {
    match location {
        Some(coordinate) => coordinate.to_string(),
        None => "unknown".to_string(),
    }
}

/// Render `dashboard` as text, one item per line.
#[must_use]
pub fn render(dashboard: &Dashboard) -> String {
    let mut out = String::new();
    // Writing to a String does not fail.
    let _ = render_into(&mut out, dashboard);
    out
}

fn render_into(out: &mut String, dashboard: &Dashboard) -> std::fmt::Result {
    writeln!(out, "Driver: {}", dashboard.driver_name)?;
    writeln!(
        out,
        "Ambulance: {} ({})",
        dashboard.make, dashboard.number_plate
    )?;
    writeln!(out, "Your location: {}", location_text(dashboard.location))?;

    match dashboard.status {
        RideStatus::Free => writeln!(out, "Waiting for a ride")?,
        RideStatus::Busy => {
            writeln!(out, "Ride assigned")?;
            match (&dashboard.target, &dashboard.estimate) {
                (None, _) => writeln!(out, "Patient location: not set")?,
                (Some(target), None) => {
                    writeln!(out, "Patient location: {}", target)?;
                    writeln!(out, "Waiting for your location...")?;
                }
                (Some(target), Some(estimate)) => {
                    writeln!(out, "Patient location: {}", target)?;
                    writeln!(
                        out,
                        "Driving to your destination: {} away",
                        estimate.distance
                    )?;
                    writeln!(out, "Arriving in {}", estimate.time)?;
                }
            }
            if dashboard.tracking {
                writeln!(out, "Sharing your location")?;
            }
            writeln!(out, "Type `complete` when the ride is finished")?;
        }
    }

    if let Some(notice) = &dashboard.notice {
        writeln!(out, "! {}", notice)?;
    }
    Ok(())
}
