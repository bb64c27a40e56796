//! The ride lifecycle. See [`RideSession`].

use std::{sync::Arc, time::Duration};

use futures::{
    future::{BoxFuture, OptionFuture},
    FutureExt, StreamExt,
};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, watch,
};

use crate::{
    estimate::{self, Estimate, InvalidConfiguration},
    gis::Coordinate,
    permission_service::{self, Permission},
    store::{
        self, DocumentSnapshot, DocumentUpdate, DriverDocument, DriverId, RideStatus, StoreError,
        Subscription,
    },
    tracker::{self, LocationTracker, TrackerError, TrackerEvent},
    view::Dashboard,
};

/// Settings for [`RideSession`].
#[derive(Debug, Clone, PartialEq)]
pub struct RideSettings {
    /// How often the location is sampled while a ride is in progress.
    pub poll_interval: Duration,
    /// Speed used to estimate arrival time.
    pub average_speed_kmph: f64,
}

/// Error returned by [`RideSession`].
#[derive(Debug, thiserror::Error)]
pub enum RideError {
    /// There is no ride to complete.
    #[error("No ride in progress")]
    NoRideInProgress,
    /// The store could not be updated.
    #[error("Unable to update ride status")]
    RemoteWriteFailed(#[from] StoreError),
    /// The session settings are unusable.
    #[error(transparent)]
    InvalidConfiguration(#[from] InvalidConfiguration),
}

/// Notifications produced by [`RideSession`].
#[derive(Debug, Clone)]
pub enum RideEvent {
    /// The dispatcher assigned a ride.
    RideAssigned,
    /// The patient location changed during a ride.
    TargetChanged(Option<Coordinate>),
    /// The dispatcher ended the ride.
    RideEnded,
    /// The driver completed the ride.
    RideCompleted,
    /// Completing the ride failed, the ride is still in progress.
    CompleteFailed(Arc<RideError>),
    /// Location permission was refused, the driver's location will not be shared.
    PermissionDenied,
    /// The driver's document does not exist.
    DriverNotFound,
    /// A new driver location was published.
    LocationChanged(Coordinate),
    /// Tracking hit a recoverable problem.
    TrackingWarning(Arc<TrackerError>),
    /// Tracking stopped.
    TrackingHalted(Arc<TrackerError>),
}

/// Commands accepted by [`RideSession::run()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// See [`RideSession::complete()`].
    Complete,
}

/// Follows the driver's document, starting the [`LocationTracker`] while a ride is in progress
/// and keeping track of the patient location.
pub struct RideSession {
    driver_id: DriverId,
    store: Arc<dyn store::Port>,
    permission: Arc<dyn permission_service::Port>,
    tracker: LocationTracker,
    settings: RideSettings,
    status: RideStatus,
    target: Option<Coordinate>,
    document: Option<DriverDocument>,
    permission_decision: Option<Permission>,
    notice: Option<String>,
    idle_report_due: bool,
    tracker_events: broadcast::Receiver<TrackerEvent>,
    events: broadcast::Sender<RideEvent>,
    dashboard: watch::Sender<Dashboard>,
}

type IdleReport = BoxFuture<'static, Result<Coordinate, TrackerError>>;

impl RideSession {
    /// Construct a new [`RideSession`], with no ride in progress.
    pub fn new(
        driver_id: DriverId,
        store: Arc<dyn store::Port>,
        permission: Arc<dyn permission_service::Port>,
        tracker: LocationTracker,
        settings: RideSettings,
    ) -> Result<Self, RideError> {
        estimate::validate_average_speed(settings.average_speed_kmph)?;
        tracker::validate_poll_interval(settings.poll_interval)?;
        let tracker_events = tracker.subscribe();
        let (events, _) = broadcast::channel(16);
        let (dashboard, _) = watch::channel(Dashboard::default());
        Ok(Self {
            driver_id,
            store,
            permission,
            tracker,
            settings,
            status: RideStatus::Free,
            target: None,
            document: None,
            permission_decision: None,
            notice: None,
            idle_report_due: true,
            tracker_events,
            events,
            dashboard,
        })
    }

    /// Receive [`RideEvent`]s.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RideEvent> {
        self.events.subscribe()
    }

    /// Receive the [`Dashboard`] each time it changes.
    #[must_use]
    pub fn dashboards(&self) -> watch::Receiver<Dashboard> {
        self.dashboard.subscribe()
    }

    /// The current ride status.
    #[must_use]
    pub fn status(&self) -> RideStatus {
        self.status
    }

    /// The patient location, while a ride is in progress and one is set.
    #[must_use]
    pub fn target(&self) -> Option<Coordinate> {
        self.target
    }

    /// Whether the driver's location is being tracked.
    #[must_use]
    pub fn is_tracking(&self) -> bool {
        self.tracker.is_running()
    }

    /// Distance and time to the patient, available when both the driver's current location and
    /// the patient location are known.
    #[must_use]
    pub fn estimate(&self) -> Option<Estimate> {
        let current = self.tracker.current()?;
        let target = self.target?;
        match estimate::estimate(&current, &target, self.settings.average_speed_kmph) {
            Ok(estimate) => Some(estimate),
            Err(error) => {
                tracing::error!("{}", error);
                None
            }
        }
    }

    /// The view model of the current state.
    #[must_use]
    pub fn dashboard(&self) -> Dashboard {
        let document = self.document.as_ref();
        Dashboard {
            driver_name: document.map(|d| d.driver_name.clone()).unwrap_or_default(),
            make: document.map(|d| d.make.clone()).unwrap_or_default(),
            number_plate: document.map(|d| d.number_plate.clone()).unwrap_or_default(),
            status: self.status,
            location: self
                .tracker
                .current()
                .or_else(|| document.and_then(|d| d.driver_location)),
            target: self.target,
            estimate: self.estimate(),
            tracking: self.tracker.is_running(),
            notice: self.notice.clone(),
        }
    }

    fn emit(&self, event: RideEvent) {
        tracing::debug!("Ride event: {:?}", event);
        let _ = self.events.send(event);
    }

    fn refresh_dashboard(&self) {
        let dashboard = self.dashboard();
        self.dashboard.send_if_modified(|current| {
            if *current == dashboard {
                false
            } else {
                *current = dashboard;
                true
            }
        });
    }

    async fn permission(&mut self) -> Permission {
        if let Some(decision) = self.permission_decision {
            return decision;
        }
        match self.permission.request_location().await {
            Ok(decision) => {
                self.permission_decision = Some(decision);
                decision
            }
            Err(error) => {
                tracing::error!("Error requesting location permission: {:?}", error);
                Permission::Denied
            }
        }
    }

    async fn begin_tracking(&mut self) {
        match self.permission().await {
            Permission::Granted => {
                self.tracker_events = self.tracker.subscribe();
                self.tracker.start(self.settings.poll_interval);
            }
            Permission::Denied => {
                tracing::warn!("Location permission denied, location will not be shared");
                self.notice = Some(
                    "Location permission denied, your location is not being shared".to_string(),
                );
                self.emit(RideEvent::PermissionDenied);
            }
        }
    }

    async fn end_ride(&mut self) {
        self.tracker.stop().await;
        // Events still queued from the stopped tracker belong to this ride.
        self.tracker_events = self.tracker.subscribe();
        self.target = None;
        self.status = RideStatus::Free;
    }

    /// Update the session from a snapshot of the driver's document.
    pub async fn apply_snapshot(&mut self, snapshot: DocumentSnapshot) {
        let document = match snapshot.document {
            Some(document) => document,
            None => {
                tracing::error!("Driver data not found for {}", snapshot.key);
                self.end_ride().await;
                self.document = None;
                self.notice = Some("Driver data not found".to_string());
                self.emit(RideEvent::DriverNotFound);
                return;
            }
        };

        let target = match document.patient_target() {
            Ok(target) => target,
            Err(error) => {
                tracing::warn!("Ignoring patient location: {}", error);
                None
            }
        };
        let next_status = document.status;
        self.document = Some(document);

        match (self.status, next_status) {
            (RideStatus::Free, RideStatus::Busy) => {
                tracing::info!("Ride assigned");
                self.status = RideStatus::Busy;
                self.target = target;
                self.notice = None;
                self.emit(RideEvent::RideAssigned);
                self.begin_tracking().await;
            }
            (RideStatus::Busy, RideStatus::Free) => {
                tracing::info!("Ride ended by dispatcher");
                self.end_ride().await;
                self.idle_report_due = true;
                self.emit(RideEvent::RideEnded);
            }
            (RideStatus::Busy, RideStatus::Busy) => {
                if target != self.target {
                    self.target = target;
                    self.emit(RideEvent::TargetChanged(target));
                }
            }
            (RideStatus::Free, RideStatus::Free) => {}
        }
    }

    /// Mark the current ride complete in the store. The ride only ends locally once the store
    /// accepts the update.
    pub async fn complete(&mut self) -> Result<(), RideError> {
        if self.status != RideStatus::Busy {
            return Err(RideError::NoRideInProgress);
        }
        let update = DocumentUpdate::complete_ride();
        self.store.update(&self.driver_id, &update).await?;
        if let Some(document) = &mut self.document {
            update.apply(document);
        }
        self.end_ride().await;
        self.idle_report_due = true;
        tracing::info!("Ride completed");
        self.emit(RideEvent::RideCompleted);
        Ok(())
    }

    fn on_tracker_event(&mut self, event: TrackerEvent) {
        match event {
            TrackerEvent::LocationChanged(coordinate) => {
                self.emit(RideEvent::LocationChanged(coordinate));
            }
            TrackerEvent::Warning(error) => self.emit(RideEvent::TrackingWarning(error)),
            TrackerEvent::Halted(error) => {
                self.notice = Some(format!("Location tracking stopped: {}", error));
                self.emit(RideEvent::TrackingHalted(error));
            }
        }
    }

    /// A single location report for a driver without a ride, started once when the session
    /// begins and again after each ride ends.
    async fn take_idle_report(&mut self) -> Option<IdleReport> {
        if self.status != RideStatus::Free || !self.idle_report_due {
            return None;
        }
        self.idle_report_due = false;
        match self.permission().await {
            Permission::Granted => Some(self.tracker.publish_once().boxed()),
            Permission::Denied => {
                tracing::debug!("Location permission denied, skipping idle location report");
                None
            }
        }
    }

    fn on_idle_report(&mut self, result: Result<Coordinate, TrackerError>) {
        match result {
            Ok(coordinate) => {
                tracing::debug!("Reported idle location {}", coordinate);
                self.emit(RideEvent::LocationChanged(coordinate));
            }
            Err(error) => {
                tracing::warn!("Unable to report idle location: {:?}", error);
                self.emit(RideEvent::TrackingWarning(Arc::new(error)));
            }
        }
    }

    /// Apply snapshots from `subscription` and `commands` until `shutdown_rx` receives a
    /// message, or the subscription ends.
    #[tracing::instrument(skip_all, fields(driver_id = %self.driver_id))]
    pub async fn run(
        mut self,
        mut subscription: Subscription,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut commands_open = true;
        let mut idle_report: Option<IdleReport> = None;

        loop {
            if self.status == RideStatus::Busy {
                idle_report = None;
            } else if let Some(report) = self.take_idle_report().await {
                idle_report = Some(report);
            }

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::debug!("Received shutdown broadcast");
                    break;
                }
                snapshot = subscription.next() => match snapshot {
                    Some(Ok(snapshot)) => self.apply_snapshot(snapshot).await,
                    Some(Err(error)) => {
                        tracing::error!("Error receiving driver document: {:?}", error);
                    }
                    None => {
                        tracing::warn!("Driver document subscription ended");
                        break;
                    }
                },
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Complete) => {
                        if let Err(error) = self.complete().await {
                            tracing::error!("Unable to complete ride: {:?}", error);
                            self.emit(RideEvent::CompleteFailed(Arc::new(error)));
                        }
                    }
                    None => commands_open = false,
                },
                Some(result) = OptionFuture::from(idle_report.as_mut()), if idle_report.is_some() => {
                    idle_report = None;
                    self.on_idle_report(result);
                }
                event = self.tracker_events.recv() => match event {
                    Ok(event) => self.on_tracker_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Skipped {} tracker events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
            }
            self.refresh_dashboard();
        }

        self.tracker.stop().await;
    }
}
