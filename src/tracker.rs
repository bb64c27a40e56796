//! See [`LocationTracker`].

use std::{sync::Arc, time::Duration};

use futures::Future;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{Interval, MissedTickBehavior},
};

use crate::{
    estimate::InvalidConfiguration,
    gis::Coordinate,
    position_service::{self, PositionConfig, PositionError},
    retry::{self, ExponentialBackoff},
    store::{self, DocumentUpdate, DriverId, StoreError},
    time,
};

/// Settings for [`LocationTracker`].
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// A sample is published only if it is further than this from the last published location.
    pub threshold_meters: f64,
    /// Parameters for each position request.
    pub position: PositionConfig,
    /// Attempts made to publish a location before reporting a warning.
    pub publish_attempts: usize,
    /// Backoff between publish attempts.
    pub publish_backoff: ExponentialBackoff,
}

/// Error encountered while tracking.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// No position could be obtained.
    #[error("Position unavailable")]
    PositionUnavailable(#[from] PositionError),
    /// A location could not be written to the store.
    #[error("Failed to publish location {coordinate}")]
    RemoteWriteFailed {
        /// The location that was not published.
        coordinate: Coordinate,
        /// Store error from the last attempt.
        #[source]
        source: StoreError,
    },
    /// Tracking was started with unusable settings.
    #[error(transparent)]
    InvalidConfiguration(#[from] InvalidConfiguration),
}

/// Check that `poll_interval` can be used to start a [`LocationTracker`].
pub fn validate_poll_interval(poll_interval: Duration) -> Result<(), InvalidConfiguration> {
    if poll_interval.is_zero() {
        Err(InvalidConfiguration(
            "poll interval must be greater than zero".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Notifications produced by [`LocationTracker`].
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    /// The driver moved and the new location has been published.
    LocationChanged(Coordinate),
    /// Something went wrong, tracking continues.
    Warning(Arc<TrackerError>),
    /// Tracking has stopped because of this error.
    Halted(Arc<TrackerError>),
}

/// The latest sample and the last published location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedPosition {
    current: Coordinate,
    previous: Option<Coordinate>,
}

impl TrackedPosition {
    fn new(current: Coordinate) -> Self {
        Self {
            current,
            previous: None,
        }
    }

    /// Latest accepted sample.
    #[must_use]
    pub fn current(&self) -> Coordinate {
        self.current
    }

    /// Last location successfully published to the store.
    #[must_use]
    pub fn previous(&self) -> Option<Coordinate> {
        self.previous
    }

    /// Whether `current` has moved far enough from `previous` to be published.
    #[must_use]
    pub fn needs_publish(&self, threshold_meters: f64) -> bool {
        match &self.previous {
            None => true,
            Some(previous) => previous.ground_distance_m(&self.current) > threshold_meters,
        }
    }
}

#[derive(Clone)]
struct Worker {
    driver_id: DriverId,
    position_source: Arc<dyn position_service::Port>,
    store: Arc<dyn store::Port>,
    time: Arc<dyn time::Port>,
    config: Arc<TrackerConfig>,
    events: broadcast::Sender<TrackerEvent>,
    current: Arc<watch::Sender<Option<Coordinate>>>,
}

impl Worker {
    async fn sample(&self) -> Result<Coordinate, TrackerError> {
        Ok(self
            .position_source
            .current_position(&self.config.position)
            .await?)
    }

    async fn publish(&self, coordinate: Coordinate) -> Result<(), StoreError> {
        let update = DocumentUpdate::driver_location(coordinate);
        retry::retry(
            self.config.publish_attempts,
            self.config.publish_backoff.clone(),
            &*self.time,
            || self.store.update(&self.driver_id, &update),
        )
        .await
    }

    async fn publish_sample(self) -> Result<Coordinate, TrackerError> {
        let coordinate = self.sample().await?;
        self.publish(coordinate)
            .await
            .map_err(|source| TrackerError::RemoteWriteFailed { coordinate, source })?;
        Ok(coordinate)
    }

    async fn on_sample(&self, tracked: &mut Option<TrackedPosition>, coordinate: Coordinate) {
        let position = tracked.get_or_insert_with(|| TrackedPosition::new(coordinate));
        position.current = coordinate;
        self.current.send_replace(Some(coordinate));

        if !position.needs_publish(self.config.threshold_meters) {
            tracing::trace!("Discarding sample {}, below movement threshold", coordinate);
            return;
        }

        tracing::debug!("Publishing driver location {}", coordinate);
        match self.publish(coordinate).await {
            Ok(()) => {
                position.previous = Some(coordinate);
                let _ = self.events.send(TrackerEvent::LocationChanged(coordinate));
            }
            Err(source) => {
                let error = TrackerError::RemoteWriteFailed { coordinate, source };
                tracing::warn!("{:?}", error);
                let _ = self.events.send(TrackerEvent::Warning(Arc::new(error)));
            }
        }
    }

    async fn poll(
        &self,
        interval: &mut Interval,
        tracked: &mut Option<TrackedPosition>,
    ) -> Result<(), TrackerError> {
        interval.tick().await;
        let coordinate = self.sample().await?;
        self.on_sample(tracked, coordinate).await;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(driver_id = %self.driver_id))]
    async fn run(self, poll_interval: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        tracing::debug!(
            "Starting location tracking every {}",
            humantime::format_duration(poll_interval)
        );
        let mut interval = tokio::time::interval(poll_interval);
        // A tick that fires while a sample is still pending is dropped.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut tracked: Option<TrackedPosition> = None;

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Received shutdown broadcast");
                    break;
                }
                result = self.poll(&mut interval, &mut tracked) => {
                    if let Err(error) = result {
                        tracing::error!("Location tracking halted: {:?}", error);
                        let _ = self.events.send(TrackerEvent::Halted(Arc::new(error)));
                        break;
                    }
                }
            }
        }

        self.current.send_replace(None);
    }
}

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

/// Periodically samples the position source and publishes the driver's location to the store
/// whenever it moves further than [`TrackerConfig::threshold_meters`].
pub struct LocationTracker {
    worker: Worker,
    current: watch::Receiver<Option<Coordinate>>,
    running: Option<Running>,
}

impl LocationTracker {
    /// Construct a new, stopped, [`LocationTracker`].
    #[must_use]
    pub fn new(
        driver_id: DriverId,
        position_source: Arc<dyn position_service::Port>,
        store: Arc<dyn store::Port>,
        time: Arc<dyn time::Port>,
        config: TrackerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        let (current_tx, current) = watch::channel(None);
        Self {
            worker: Worker {
                driver_id,
                position_source,
                store,
                time,
                config: Arc::new(config),
                events,
                current: Arc::new(current_tx),
            },
            current,
            running: None,
        }
    }

    /// Receive [`TrackerEvent`]s.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TrackerEvent> {
        self.worker.events.subscribe()
    }

    /// The latest sample, `None` while stopped or before the first sample.
    #[must_use]
    pub fn current(&self) -> Option<Coordinate> {
        *self.current.borrow()
    }

    /// Whether the polling task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map_or(false, |running| !running.join.is_finished())
    }

    /// Start sampling every `poll_interval`. Has no effect if already running. A zero
    /// `poll_interval` emits [`TrackerEvent::Halted`] instead of starting.
    pub fn start(&mut self, poll_interval: Duration) {
        if self.is_running() {
            tracing::trace!("Location tracker is already running");
            return;
        }
        if let Err(error) = validate_poll_interval(poll_interval) {
            tracing::error!("Not starting location tracking: {}", error);
            let _ = self
                .worker
                .events
                .send(TrackerEvent::Halted(Arc::new(error.into())));
            return;
        }
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let join = tokio::spawn(self.worker.clone().run(poll_interval, shutdown_rx));
        self.running = Some(Running { shutdown_tx, join });
    }

    /// Stop sampling. Once this returns no further events are emitted, including for a sample
    /// that was in flight.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown_tx.send(());
            if let Err(error) = running.join.await {
                tracing::error!("Location tracking task failed: {:?}", error);
            }
            tracing::debug!("Location tracking stopped");
        }
        self.worker.current.send_replace(None);
    }

    /// Request a single position from the position source.
    pub async fn sample(&self) -> Result<Coordinate, TrackerError> {
        self.worker.sample().await
    }

    /// Sample once and publish the result regardless of the movement threshold. Independent of
    /// the polling task and emits no events.
    pub fn publish_once(
        &self,
    ) -> impl Future<Output = Result<Coordinate, TrackerError>> + Send + 'static {
        self.worker.clone().publish_sample()
    }
}
