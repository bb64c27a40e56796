//! ambulance-driver library crate

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]

pub mod estimate;
pub mod gis;
pub mod options;
pub mod permission_service;
pub mod position_service;
pub mod reporting;
pub mod retry;
pub mod ride;
pub mod secrets;
pub mod store;
pub mod time;
pub mod tracker;
pub mod view;
