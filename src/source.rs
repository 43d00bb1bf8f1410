//! Opening the physical serial source.

use std::{path::Path, time::Duration};

use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{error, info, warn};

use crate::{config::SourceConfig, error::Error};

fn try_open(config: &SourceConfig) -> Result<SerialStream, Error> {
    // Raw 8N1, the serialport crate does not enable any line discipline processing.
    tokio_serial::new(config.path.to_string_lossy(), config.baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(config.flow_control)
        .open_native_async()
        .map_err(|e| Error::SourceUnavailable {
            path: config.path.clone(),
            problem: e.to_string(),
        })
}

/// Wait until `path` exists, checking `attempts` times with `interval` in between.
pub async fn wait_for<P: AsRef<Path>>(path: P, attempts: u32, interval: Duration) -> bool {
    let path = path.as_ref();

    for attempt in 0..attempts.max(1) {
        if path.exists() {
            return true;
        }

        warn!(?path, attempt, "Waiting for source to appear");
        tokio::time::sleep(interval).await;
    }

    path.exists()
}

/// Open the source once it is available.
///
/// The device is often plugged in (or enumerated) after we start,
/// so we wait for it to show up for a bounded amount of time.
pub async fn open(config: &SourceConfig) -> Result<SerialStream, Error> {
    let interval = Duration::from_millis(config.retry_interval_ms);

    info!(path = ?config.path, baud = config.baud, "Opening source");

    if !wait_for(&config.path, config.open_attempts, interval).await {
        error!(path = ?config.path, "Source never appeared");
        return Err(Error::SourceUnavailable {
            path: config.path.clone(),
            problem: format!(
                "not found after {} attempts, {interval:?} apart",
                config.open_attempts
            ),
        });
    }

    let stream = try_open(config)?;
    info!(path = ?config.path, "Source open");

    Ok(stream)
}
