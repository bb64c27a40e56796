use std::{sync::Arc, time::Duration};

use ambulance_driver::{
    options::{Options, StoreOptions},
    permission_service::{self, Port as _},
    position_service,
    reporting::{self, ReportingOptions},
    retry::{self, ExponentialBackoff},
    ride::{Command, RideSession},
    secrets::Secrets,
    store::{self, DriverDocument, StoreError},
    time,
    tracker::LocationTracker,
    view::{self, Dashboard},
};
use color_eyre::Help;
use eyre::Context;
use futures::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    signal::unix::SignalKind,
    sync::{broadcast, mpsc, watch},
};
use tokio_stream::wrappers::WatchStream;
use tracing_appender::rolling::Rotation;

/// Make sure the driver's document exists, creating it from the configured profile if needed.
async fn register_driver(
    store: &dyn store::Port,
    options: &Options,
    time: &dyn time::Port,
) -> eyre::Result<()> {
    let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30))?;
    let existing = retry::retry(5, backoff, time, || store.get(&options.driver_id))
        .await
        .wrap_err("Unable to read driver data")?;
    if existing.is_some() {
        tracing::debug!("Driver {} is registered", options.driver_id);
        return Ok(());
    }

    let profile = options.profile.as_ref().ok_or_else(|| {
        eyre::eyre!("Driver data not found for {}", options.driver_id)
            .suggestion("Add a `profile` to the options to register this driver.")
    })?;
    match store
        .create(&options.driver_id, &DriverDocument::from_profile(profile))
        .await
    {
        Ok(()) | Err(StoreError::AlreadyExists(_)) => {
            tracing::info!("Registered driver {}", options.driver_id);
            Ok(())
        }
        Err(error) => Err(error).wrap_err("Unable to register driver"),
    }
}

async fn read_commands(commands: mpsc::Sender<Command>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.trim() {
                "complete" => {
                    if commands.send(Command::Complete).await.is_err() {
                        break;
                    }
                }
                "" => {}
                other => println!("Unknown command {:?}, the only command is `complete`", other),
            },
            Ok(None) => break,
            Err(error) => {
                tracing::error!("Error reading commands from stdin: {:?}", error);
                break;
            }
        }
    }
}

async fn print_dashboards(
    dashboards: watch::Receiver<Dashboard>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut dashboards = WatchStream::new(dashboards);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            dashboard = dashboards.next() => match dashboard {
                Some(dashboard) => println!("\n{}", view::render(&dashboard)),
                None => break,
            },
        }
    }
}

fn spawn_shutdown_listeners(shutdown_tx: &broadcast::Sender<()>) -> eyre::Result<()> {
    let ctrl_c_shutdown_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen to ctrl-c or SIGINT event: {:?}", error);
            return;
        }
        tracing::warn!("ctrl-c or SIGINT event detected, broadcasting shutdown");
        let _ = ctrl_c_shutdown_tx.send(());
    });

    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .wrap_err("Failed to create SIGTERM signal listener")?;
    let sigterm_shutdown_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            tracing::warn!("SIGTERM signal detected, broadcasting shutdown");
            let _ = sigterm_shutdown_tx.send(());
        }
    });
    Ok(())
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let options = Options::initialize().await?;

    std::fs::create_dir_all(&options.data_dir)
        .wrap_err_with(|| format!("Unable to create data directory {:?}", options.data_dir))?;

    let _reporting_guard = reporting::setup_reporting(&ReportingOptions {
        data_dir: options.data_dir.clone(),
        log_rotation: Rotation::DAILY,
    })?;

    std::fs::create_dir_all(&options.secrets_dir).wrap_err_with(|| {
        format!(
            "Unable to create secrets directory {:?}",
            options.secrets_dir
        )
    })?;

    let secrets = Secrets::initialize(&options.secrets_dir)
        .await
        .wrap_err("Error while initializing secrets")?;

    let time: Arc<dyn time::Port> = Arc::new(time::Gateway);

    let store: Arc<dyn store::Port> = match &options.store {
        StoreOptions::Firestore {
            project_id,
            base_url,
            poll_interval_ms,
        } => Arc::new(store::firestore::Gateway::new(
            reqwest::Client::new(),
            firestore_rest::Database {
                base_url: base_url.to_string(),
                ..firestore_rest::Database::new(project_id.clone())
            },
            secrets.store_token.clone(),
            Duration::from_millis(*poll_interval_ms),
            time.clone(),
        )),
        StoreOptions::Memory => {
            tracing::warn!("Using the in-memory store, rides can only be assigned locally");
            Arc::new(store::memory::Gateway::new())
        }
    };

    register_driver(&*store, &options, &*time).await?;

    // Ask before the command reader takes over stdin.
    let permission = Arc::new(permission_service::Gateway::new(options.permission));
    let decision = permission
        .request_location()
        .await
        .wrap_err("Error requesting location permission")?;
    tracing::info!("Location permission: {:?}", decision);

    let position_source = Arc::new(position_service::Gateway::new(
        options.position.gpsd_address.clone(),
        time.clone(),
    ));
    let tracker = LocationTracker::new(
        options.driver_id.clone(),
        position_source,
        store.clone(),
        time.clone(),
        options
            .tracking
            .tracker_config(options.position.config())
            .wrap_err("Invalid tracking options")?,
    );
    let session = RideSession::new(
        options.driver_id.clone(),
        store.clone(),
        permission,
        tracker,
        options.tracking.ride_settings(),
    )
    .wrap_err("Invalid tracking options")?;

    let (shutdown_tx, session_shutdown_rx) = broadcast::channel::<()>(1);
    spawn_shutdown_listeners(&shutdown_tx)?;

    let (command_tx, command_rx) = mpsc::channel(4);
    tokio::spawn(read_commands(command_tx));
    let print_join = tokio::spawn(print_dashboards(
        session.dashboards(),
        shutdown_tx.subscribe(),
    ));

    let subscription = store.subscribe(&options.driver_id);
    session
        .run(subscription, command_rx, session_shutdown_rx)
        .await;

    let _ = shutdown_tx.send(());
    print_join.await?;

    Ok(())
}
