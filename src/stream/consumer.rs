//! Long-lived consumer of the sensor stream.
//!
//! Reads the line-delimited feed, hands every reading to the detector and
//! reconnects after a fixed backoff whenever the connection fails.

use super::types::{parse_line, StreamError};
use crate::activity::SharedActivityLog;
use crate::config::StreamConfig;
use crate::core::detector::DetectorHandle;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Connect timeout for the data service.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest line accepted from the feed before the connection is dropped.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Streams readings from the data service into the detector.
pub struct StreamConsumer {
    client: reqwest::Client,
    config: StreamConfig,
    detector: DetectorHandle,
    activity: SharedActivityLog,
}

/// A running consumer.
pub struct ConsumerTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ConsumerTask {
    /// Signal the consumer to exit and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!("Stream consumer ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl StreamConsumer {
    pub fn new(
        config: StreamConfig,
        detector: DetectorHandle,
        activity: SharedActivityLog,
    ) -> Result<Self, StreamError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StreamError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            detector,
            activity,
        })
    }

    /// Start consuming on a background task.
    pub fn spawn(self) -> ConsumerTask {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(rx));
        ConsumerTask { shutdown, handle }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let url = self.config.stream_url();
        tracing::info!(url = %url, "Stream consumer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.consume(&url, &mut shutdown).await {
                Ok(()) => break,
                Err(e) => tracing::warn!(
                    device = %self.config.device_name,
                    "Stream disconnected: {}; reconnecting in {:?}",
                    e,
                    self.config.reconnect_backoff
                ),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
            }
        }

        tracing::info!(device = %self.config.device_name, "Stream consumer stopped");
    }

    /// Read one connection until it fails. `Ok` means the consumer should exit.
    async fn consume(&self, url: &str, shutdown: &mut watch::Receiver<bool>) -> Result<(), StreamError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StreamError::Status(response.status().as_u16()));
        }

        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let chunk = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                chunk = tokio::time::timeout(self.config.read_timeout, response.chunk()) => chunk,
            };

            let bytes = match chunk {
                Err(_) => {
                    return Err(StreamError::Transport(format!(
                        "no data for {:?}",
                        self.config.read_timeout
                    )))
                }
                Ok(Err(e)) => return Err(StreamError::Transport(e.to_string())),
                Ok(Ok(None)) => return Err(StreamError::Transport("stream closed by server".to_string())),
                Ok(Ok(Some(bytes))) => bytes,
            };

            buffer.extend_from_slice(&bytes);
            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                if !self.handle_line(line.trim_end_matches(['\r', '\n'])).await {
                    return Ok(());
                }
            }
            if buffer.len() > MAX_LINE_BYTES {
                return Err(StreamError::Transport(format!(
                    "line exceeds {MAX_LINE_BYTES} bytes without a newline"
                )));
            }
        }
    }

    /// Feed one line to the detector. Returns false once the detector is gone.
    async fn handle_line(&self, line: &str) -> bool {
        if line.trim().is_empty() {
            return true;
        }

        match parse_line(line, &self.config.value_key) {
            Ok(Some(reading)) => {
                self.activity.record_reading();
                if let Err(e) = self.detector.process(reading).await {
                    tracing::error!("Dropping stream: {}", e);
                    return false;
                }
            }
            Ok(None) => {
                tracing::debug!("Stream line without a usable reading skipped");
            }
            Err(e) => {
                self.activity.record_malformed_line();
                tracing::warn!("{}", e);
            }
        }
        true
    }
}
