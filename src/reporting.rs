//! Utilities for logging and automated bug reporting.

use std::{path::PathBuf, str::FromStr};

use eyre::Context;
use tracing_appender::{
    non_blocking::{NonBlockingBuilder, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt};

/// Name of the log files, suffixed with the date by the rolling appender.
const LOG_FILE_NAME: &str = "ambulance-driver.log";

/// Options for writing to log file.
#[derive(Clone)]
struct LogFileOptions {
    /// The directory to store the log files in.
    /// Will be created if it doesn't yet exist.
    pub directory: PathBuf,
    /// How often to rotate the log files
    pub rotation: Rotation,
}

/// Implements [`std::io::Write`] to write `tracing`/panic messages to stderr and the log file.
/// Stdout is left to the dashboard.
struct ReportWriter {
    stderr: bool,
    log_file_writer: Option<RollingFileAppender>,
}

impl ReportWriter {
    fn try_new(stderr: bool, log_file: Option<&LogFileOptions>) -> eyre::Result<Self> {
        let log_file_writer = if let Some(log_file_options) = log_file {
            std::fs::create_dir_all(&log_file_options.directory).wrap_err_with(|| {
                format!(
                    "Unable to create log file directory {:?}",
                    log_file_options.directory
                )
            })?;
            Some(RollingFileAppender::new(
                log_file_options.rotation.clone(),
                log_file_options.directory.clone(),
                LOG_FILE_NAME,
            ))
        } else {
            None
        };

        Ok(Self {
            stderr,
            log_file_writer,
        })
    }
}

impl std::io::Write for ReportWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut retval: usize = buf.len();

        if self.stderr {
            eprint!("{}", String::from_utf8_lossy(buf));
        }

        if let Some(writer) = &mut self.log_file_writer {
            retval = usize::min(retval, writer.write(buf)?);
        }

        Ok(retval)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if self.stderr {
            std::io::stderr().flush()?;
        }

        if let Some(writer) = &mut self.log_file_writer {
            writer.flush()?;
        }

        Ok(())
    }
}

/// Keeps the log writer and sentry client alive, dropping it flushes them.
pub struct ReportingGuard {
    _sentry: Option<sentry::ClientInitGuard>,
    _writer: WorkerGuard,
}

/// Options for [`setup_reporting()`].
pub struct ReportingOptions {
    /// Log files are written to `log/` beneath this.
    pub data_dir: PathBuf,
    /// How often to start a new log file.
    pub log_rotation: Rotation,
}

impl ReportingOptions {
    fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }
}

/// Install the global `tracing` subscriber and the `color-eyre` hooks. Reports to sentry.io
/// when the `SENTRY_DSN` environment variable is set.
pub fn setup_reporting(options: &ReportingOptions) -> eyre::Result<ReportingGuard> {
    let sentry = match std::env::var("SENTRY_DSN") {
        Ok(sentry_dsn) => {
            let dsn = sentry_dsn
                .parse::<sentry::types::Dsn>()
                .wrap_err("Unable to parse SENTRY_DSN environment variable")?;
            Some(sentry::init(sentry::ClientOptions {
                dsn: Some(dsn),
                release: sentry::release_name!(),
                traces_sample_rate: 0.2,
                ..sentry::ClientOptions::default()
            }))
        }
        Err(_) => None,
    };

    let report_writer = ReportWriter::try_new(
        true,
        Some(&LogFileOptions {
            directory: options.log_dir(),
            rotation: options.log_rotation.clone(),
        }),
    )?;

    let (non_blocking_writer, report_writer_guard) = NonBlockingBuilder::default()
        .buffered_lines_limit(1000)
        .lossy(false)
        .finish(report_writer);

    let rust_log_env: String =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "warn,ambulance_driver=debug".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking_writer);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::from_str(rust_log_env.as_str()).unwrap_or_default())
        .with(tracing_error::ErrorLayer::default())
        .with(sentry.as_ref().map(|_| sentry_tracing::layer()))
        .try_init()
        .wrap_err("Unable to install tracing subscriber")?;

    let (eyre_panic_hook, eyre_hook) = color_eyre::config::HookBuilder::new().into_hooks();
    let eyre_panic_hook = eyre_panic_hook.into_panic_hook();
    eyre::set_hook(eyre_hook.into_eyre_hook())?;

    let sentry_enabled: bool = sentry.is_some();
    std::panic::set_hook(Box::new(move |panic_info| {
        eyre_panic_hook(panic_info);
        if sentry_enabled {
            sentry::integrations::panic::panic_handler(panic_info);
        }
    }));

    if sentry_enabled {
        tracing::info!("sentry.io reporting is enabled");
    }

    Ok(ReportingGuard {
        _sentry: sentry,
        _writer: report_writer_guard,
    })
}
