use std::path::Path;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::TransferError;

/// Minimum time between two progress log lines.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Longest silence tolerated while waiting for response bytes.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Point-in-time view of a transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    /// Completion percentage when the total size is known.
    pub percent: Option<f64>,
    pub kb_per_sec: f64,
    pub elapsed_secs: f64,
}

/// Byte counter with a throttle for progress reporting.
#[derive(Debug)]
pub struct Progress {
    started: Instant,
    last_report: Instant,
    interval: Duration,
    received: u64,
    total: Option<u64>,
}

impl Progress {
    pub fn new(total: Option<u64>, interval: Duration, now: Instant) -> Self {
        Self {
            started: now,
            last_report: now,
            interval,
            received: 0,
            total,
        }
    }

    pub fn advance(&mut self, bytes: u64) {
        self.received += bytes;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// Returns a snapshot if at least one interval passed since the last one.
    pub fn report_due(&mut self, now: Instant) -> Option<ProgressSnapshot> {
        if now.saturating_duration_since(self.last_report) < self.interval {
            return None;
        }
        self.last_report = now;
        Some(self.snapshot(now))
    }

    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        let elapsed_secs = now.saturating_duration_since(self.started).as_secs_f64();
        let kb_per_sec = if elapsed_secs > 0.0 {
            self.received as f64 / 1024.0 / elapsed_secs
        } else {
            0.0
        };
        let percent = self
            .total
            .filter(|t| *t > 0)
            .map(|t| self.received as f64 * 100.0 / t as f64);
        ProgressSnapshot {
            percent,
            kb_per_sec,
            elapsed_secs,
        }
    }
}

/// Streaming HTTP downloader.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    progress_interval: Duration,
}

impl Downloader {
    /// `read_timeout` bounds each wait for data, so a stalled server fails
    /// the transfer instead of holding it open.
    pub fn new(progress_interval: Duration, read_timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(read_timeout)
            .build()?;
        Ok(Self {
            client,
            progress_interval,
        })
    }

    /// Stream `url` into `dest`, returning the number of bytes written.
    ///
    /// A partially written file is left in place on failure.
    pub async fn download_to(&self, url: &str, dest: &Path) -> Result<u64, TransferError> {
        debug!(url = %url, dest = %dest.display(), "Starting download");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let expected = response.content_length();
        let mut file = tokio::fs::File::create(dest).await?;
        let mut progress = Progress::new(expected, self.progress_interval, Instant::now());
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            progress.advance(chunk.len() as u64);

            if let Some(snap) = progress.report_due(Instant::now()) {
                info!(
                    dest = %dest.display(),
                    percent = %format!("{:.1}", snap.percent.unwrap_or(0.0)),
                    kb_per_sec = %format!("{:.1}", snap.kb_per_sec),
                    elapsed_secs = %format!("{:.1}", snap.elapsed_secs),
                    "Download progress"
                );
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        let received = progress.received();
        if let Some(expected) = expected {
            if received < expected {
                return Err(TransferError::Truncated { expected, received });
            }
        }

        info!(dest = %dest.display(), size = received, "Download completed");
        Ok(received)
    }
}
