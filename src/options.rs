//! Application options. See [`Options::initialize()`].

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use color_eyre::Help;
use eyre::Context;
use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};

use crate::{
    estimate::DEFAULT_AVERAGE_SPEED_KMPH,
    permission_service::PermissionPolicy,
    position_service::{Accuracy, PositionConfig},
    retry::ExponentialBackoff,
    ride::RideSettings,
    store::{DriverId, DriverProfile},
    tracker::TrackerConfig,
};

/// Global options for the application.
#[derive(Debug, Serialize, Deserialize)]
pub struct Options {
    /// Directory where application data is stored (including logs).
    ///
    /// Default is `data`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory where secrets are loaded from.
    ///
    /// Default is `secrets`.
    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,
    /// Identifier of this driver, the key of their document in the store.
    pub driver_id: DriverId,
    /// Which document store to use.
    ///
    /// Default is [`StoreOptions::Memory`].
    #[serde(default)]
    pub store: StoreOptions,
    /// Where positions come from.
    #[serde(default)]
    pub position: PositionOptions,
    /// How location permission is decided.
    ///
    /// Default is [`PermissionPolicy::Prompt`].
    #[serde(default)]
    pub permission: PermissionPolicy,
    /// Location tracking and estimation.
    #[serde(default)]
    pub tracking: TrackingOptions,
    /// If set, the driver's document is created from this profile when it does not exist yet.
    #[serde(default)]
    pub profile: Option<DriverProfile>,
}

fn default_data_dir() -> PathBuf {
    "data".into()
}

fn default_secrets_dir() -> PathBuf {
    "secrets".into()
}

fn default_firestore_base_url() -> url::Url {
    firestore_rest::DEFAULT_BASE_URL
        .parse()
        .expect("Unable to parse url")
}

fn default_subscription_poll_interval_ms() -> u64 {
    2000
}

/// Document store selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum StoreOptions {
    /// Google Cloud Firestore, over its REST API.
    Firestore {
        /// Project containing the `(default)` database.
        project_id: String,
        /// Default is `https://firestore.googleapis.com`.
        #[serde(default = "default_firestore_base_url")]
        base_url: url::Url,
        /// How often subscriptions re-read the document, in milliseconds.
        ///
        /// Default is `2000`.
        #[serde(default = "default_subscription_poll_interval_ms")]
        poll_interval_ms: u64,
    },
    /// An in-process store, for trying the application without a backend.
    #[default]
    Memory,
}

/// Position source options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionOptions {
    /// Address of the gpsd daemon.
    ///
    /// Default is `127.0.0.1:2947`.
    pub gpsd_address: String,
    /// Default is [`Accuracy::High`].
    pub accuracy: Accuracy,
    /// How long to wait for a fix, in milliseconds.
    ///
    /// Default is `15000`.
    pub timeout_ms: u64,
    /// Oldest fix that is accepted, in milliseconds.
    ///
    /// Default is `10000`.
    pub maximum_age_ms: u64,
}

impl Default for PositionOptions {
    fn default() -> Self {
        Self {
            gpsd_address: "127.0.0.1:2947".to_string(),
            accuracy: Accuracy::High,
            timeout_ms: 15_000,
            maximum_age_ms: 10_000,
        }
    }
}

impl PositionOptions {
    /// Parameters for each position request.
    #[must_use]
    pub fn config(&self) -> PositionConfig {
        PositionConfig {
            accuracy: self.accuracy,
            timeout: Duration::from_millis(self.timeout_ms),
            maximum_age: Duration::from_millis(self.maximum_age_ms),
        }
    }
}

/// Location tracking options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingOptions {
    /// How often the position is sampled during a ride, in milliseconds.
    ///
    /// Default is `3000`.
    pub poll_interval_ms: u64,
    /// Movements shorter than this are not published.
    ///
    /// Default is `1.0`.
    pub threshold_meters: f64,
    /// Speed used to estimate the arrival time.
    ///
    /// Default is `60.0`.
    pub average_speed_kmph: f64,
    /// How many times publishing a location is attempted.
    ///
    /// Default is `3`.
    pub publish_attempts: usize,
}

impl Default for TrackingOptions {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3000,
            threshold_meters: 1.0,
            average_speed_kmph: DEFAULT_AVERAGE_SPEED_KMPH,
            publish_attempts: 3,
        }
    }
}

impl TrackingOptions {
    /// Settings for the location tracker.
    pub fn tracker_config(&self, position: PositionConfig) -> eyre::Result<TrackerConfig> {
        if !(self.threshold_meters.is_finite() && self.threshold_meters >= 0.0) {
            return Err(eyre::eyre!(
                "tracking.threshold_meters must be a non-negative number, got {}",
                self.threshold_meters
            ));
        }
        let publish_backoff =
            ExponentialBackoff::new(Duration::from_millis(500), Duration::from_secs(5))?;
        Ok(TrackerConfig {
            threshold_meters: self.threshold_meters,
            position,
            publish_attempts: self.publish_attempts,
            publish_backoff,
        })
    }

    /// Settings for the ride session.
    #[must_use]
    pub fn ride_settings(&self) -> RideSettings {
        RideSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            average_speed_kmph: self.average_speed_kmph,
        }
    }
}

impl Options {
    /// Initialize the options using the `OPTIONS` environment variable, otherwise load from file
    /// `options.ron` by default. If `OPTIONS` contains a file path, it will load the options from
    /// that path, if `OPTIONS` contains a RON file definition then it will load the options from
    /// the string contained in the variable.
    ///
    /// Messages are written to stderr, logging is not set up yet.
    pub async fn initialize() -> eyre::Result<Self> {
        let options_result = match std::env::var("OPTIONS") {
            Ok(options) => match ron::from_str(&options) {
                Ok(options) => {
                    eprintln!("Options loaded from `OPTIONS` environment variable");
                    Ok(options)
                }
                Err(error) => {
                    let path = PathBuf::from(options);
                    if path.is_file() {
                        let options = Self::read_file(&path).await?;
                        eprintln!("Options loaded from file specified in `OPTIONS` environment variable: {:?}", path);
                        Ok(options)
                    } else {
                        Err(error).wrap_err(
                            "Error deserializing options from `OPTIONS` environment variable \
                            string, or you have specified a file path which does not exist",
                        )
                    }
                }
            },
            Err(std::env::VarError::NotPresent) => {
                let path = Path::new("options.ron");
                if !path.is_file() {
                    return Err(eyre::eyre!(
                        "No `OPTIONS` environment variable specified, and options file \
                        `options.ron` does not exist."
                    )
                    .suggestion(
                        "The following options are available to solve this:\n\
                        + Create `options.ron`.\n\
                        + Specify options file location with `OPTIONS` environment variable.\n\
                        + Specify options in RON format in `OPTIONS` environment variable as a string.",
                    ));
                }
                let options = Self::read_file(path).await;
                eprintln!("Options loaded from default file: {:?}", path);
                options
            }
            Err(error) => {
                return Err(error).wrap_err("Error reading `OPTIONS` environment variable")
            }
        };

        let options_result = options_result.and_then(|options| {
            options.validate()?;
            Ok(options)
        });

        if let Ok(options) = &options_result {
            let options_str = ron::ser::to_string_pretty(options, PrettyConfig::default())?;
            eprintln!("Options{}", options_str);
        }

        options_result
    }

    /// Reject values that deserialize but cannot be used.
    pub fn validate(&self) -> eyre::Result<()> {
        if self.tracking.poll_interval_ms == 0 {
            return Err(eyre::eyre!(
                "tracking.poll_interval_ms must be greater than zero"
            ));
        }
        if let StoreOptions::Firestore {
            poll_interval_ms: 0,
            ..
        } = self.store
        {
            return Err(eyre::eyre!("store.poll_interval_ms must be greater than zero"));
        }
        Ok(())
    }

    async fn read_file(path: &Path) -> eyre::Result<Self> {
        let options_str = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("Error reading options file: {:?}", path))?;
        ron::from_str(&options_str)
            .wrap_err_with(|| format!("Error deserializing options file: {:?}", path))
    }
}
