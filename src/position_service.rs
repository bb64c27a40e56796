//! The device position source.
//! See [Port].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use crate::{gis::Coordinate, time};

/// How precise a position fix must be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Accuracy {
    /// Only a three dimensional fix is accepted.
    #[default]
    High,
    /// A two dimensional fix is good enough.
    Balanced,
}

/// Parameters of a single position request.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionConfig {
    /// Required precision of the fix.
    pub accuracy: Accuracy,
    /// How long to wait for a fix before failing with [`PositionError::Timeout`].
    pub timeout: Duration,
    /// Oldest fix that will be accepted.
    pub maximum_age: Duration,
}

impl Default for PositionConfig {
    fn default() -> Self {
        Self {
            accuracy: Accuracy::High,
            timeout: Duration::from_secs(15),
            maximum_age: Duration::from_secs(10),
        }
    }
}

/// The position source was unable to provide a position.
#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    /// No acceptable fix arrived in time.
    #[error("No position fix within {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    /// The position source closed the connection.
    #[error("Position source disconnected")]
    Disconnected,
    /// Error communicating with the position source.
    #[error("Error communicating with position source")]
    Io(#[from] std::io::Error),
}

/// Trait used to allow mocking the position source.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Port: Send + Sync {
    /// Obtain the current position of the device. One-shot, not streaming.
    async fn current_position(&self, config: &PositionConfig)
        -> Result<Coordinate, PositionError>;
}

/// Reports sent by gpsd in its JSON protocol. Only `TPV` (time-position-velocity) is used.
#[derive(Debug, Deserialize)]
#[serde(tag = "class")]
enum Report {
    #[serde(rename = "TPV")]
    Tpv(Tpv),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Tpv {
    /// 0 and 1 mean no fix, 2 is a 2D fix, 3 is a 3D fix.
    #[serde(default)]
    mode: u8,
    time: Option<DateTime<Utc>>,
    lat: Option<f64>,
    lon: Option<f64>,
}

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// Concrete implementation of [`Port`] reading fixes from a
/// [gpsd](https://gpsd.gitlab.io/gpsd/gpsd_json.html) daemon.
pub struct Gateway {
    address: String,
    time: Arc<dyn time::Port>,
}

impl Gateway {
    /// Construct a new [`Gateway`] connecting to gpsd at `address` (e.g. `127.0.0.1:2947`).
    pub fn new(address: impl Into<String>, time: Arc<dyn time::Port>) -> Self {
        Self {
            address: address.into(),
            time,
        }
    }

    /// Accept `tpv` if it is precise and recent enough.
    fn accept(&self, tpv: &Tpv, config: &PositionConfig) -> Option<Coordinate> {
        let required_mode = match config.accuracy {
            Accuracy::High => 3,
            Accuracy::Balanced => 2,
        };
        if tpv.mode < required_mode {
            tracing::trace!("Ignoring fix with mode {}", tpv.mode);
            return None;
        }

        if let Some(fix_time) = tpv.time {
            let age = (self.time.now() - fix_time).to_std().unwrap_or_default();
            if age > config.maximum_age {
                tracing::trace!("Ignoring fix which is {} old", humantime::format_duration(age));
                return None;
            }
        }

        match (tpv.lat, tpv.lon) {
            (Some(latitude), Some(longitude)) => match Coordinate::try_new(latitude, longitude) {
                Ok(coordinate) => Some(coordinate),
                Err(error) => {
                    tracing::warn!("Ignoring fix: {}", error);
                    None
                }
            },
            _ => None,
        }
    }

    async fn read_fix(&self, config: &PositionConfig) -> Result<Coordinate, PositionError> {
        let mut stream = TcpStream::connect(&self.address).await?;
        stream.write_all(WATCH_COMMAND).await?;
        let mut lines = BufReader::new(stream).lines();

        // Unreadable reports are skipped, the request timeout bounds the wait.
        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<Report>(&line) {
                Ok(Report::Tpv(tpv)) => {
                    if let Some(coordinate) = self.accept(&tpv, config) {
                        return Ok(coordinate);
                    }
                }
                Ok(Report::Other) => {}
                Err(error) => {
                    tracing::warn!("Skipping unreadable gpsd report {:?}: {}", line, error);
                }
            }
        }

        Err(PositionError::Disconnected)
    }
}

#[async_trait]
impl Port for Gateway {
    async fn current_position(
        &self,
        config: &PositionConfig,
    ) -> Result<Coordinate, PositionError> {
        match tokio::time::timeout(config.timeout, self.read_fix(config)).await {
            Ok(result) => result,
            Err(_) => Err(PositionError::Timeout(config.timeout)),
        }
    }
}

/// Position sources for tests that need to control exactly when each sample resolves.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::{mpsc, Mutex};

    use super::{Port, PositionConfig, PositionError};
    use crate::gis::Coordinate;

    /// Each request waits for the next value sent on the paired channel, and never resolves
    /// once the channel is closed.
    pub struct ScriptedSource {
        receiver: Mutex<mpsc::UnboundedReceiver<Result<Coordinate, PositionError>>>,
        requests: AtomicUsize,
    }

    impl ScriptedSource {
        pub fn new() -> (
            Self,
            mpsc::UnboundedSender<Result<Coordinate, PositionError>>,
        ) {
            let (sender, receiver) = mpsc::unbounded_channel();
            let source = Self {
                receiver: Mutex::new(receiver),
                requests: AtomicUsize::new(0),
            };
            (source, sender)
        }

        /// Number of position requests made so far.
        pub fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Port for ScriptedSource {
        async fn current_position(
            &self,
            _config: &PositionConfig,
        ) -> Result<Coordinate, PositionError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            let next = self.receiver.lock().await.recv().await;
            match next {
                Some(result) => result,
                None => futures::future::pending().await,
            }
        }
    }
}
