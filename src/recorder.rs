//! Appending enriched entries to the request log

use std::path::{Path, PathBuf};

use eyre::Context;
use tokio::{fs::OpenOptions, io::AsyncWriteExt};
use tracing::{debug, info, instrument};

use crate::{
    config::Config,
    entry::{Event, LogEntry},
    geo::GeoLocator,
};

/// Writes one line per event to the request log.
#[derive(Clone, Debug)]
pub struct Recorder {
    /// Path of the append-only log
    path: PathBuf,
    /// Enrichment for client addresses
    locator: GeoLocator,
}

impl Recorder {
    /// Prepare a recorder for the log described by `config`, creating its directory if needed.
    pub async fn open(config: &Config) -> eyre::Result<Recorder> {
        let dir = &config.storage.log_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .wrap_err_with(|| format!("Failed to create log directory {}", dir.display()))?;

        Ok(Recorder {
            path: config.storage.log_path(),
            locator: GeoLocator::new(&config.geolocation.endpoint),
        })
    }

    /// Path of the log this recorder appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Geolocate the event's client, then append the resulting entry to the log.
    ///
    /// Geolocation failures are recorded as an unknown location; only I/O errors are returned.
    #[instrument(name = "recorder.record", skip_all, fields(client_ip = event.client_ip.as_deref()))]
    pub async fn record(&self, event: Event) -> eyre::Result<LogEntry> {
        let geo = self.locator.geolocate(event.client_ip.as_deref()).await;
        if geo.is_empty() {
            info!("No location for client, recording as unknown");
        }
        let entry = LogEntry::new(event, geo);
        self.append(&entry).await?;
        Ok(entry)
    }

    /// Append a single entry to the log, creating the file if it does not exist yet.
    async fn append(&self, entry: &LogEntry) -> eyre::Result<()> {
        let mut line = entry.to_line().wrap_err("Failed to serialize log entry")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .wrap_err_with(|| format!("Failed to open {}", self.path.display()))?;
        // The whole line goes out in a single write
        file.write_all(line.as_bytes())
            .await
            .wrap_err_with(|| format!("Failed to append to {}", self.path.display()))?;
        file.flush().await?;

        debug!("Appended entry to {}", self.path.display());
        Ok(())
    }
}
