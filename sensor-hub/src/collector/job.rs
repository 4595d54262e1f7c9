//! One collection cycle against one device.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use sensor_client::SampleRate;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{CollectorEvent, CollectorEventSender};
use super::protocol::DeviceProtocol;
use crate::domain::{CollectionResult, CollectionStage, JobId};
use crate::utils::fs::file_size_or_zero;

const CANCELLED: &str = "Cancelled";

/// Parameters of a single collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionRequest {
    pub device: String,
    pub address: String,
    pub duration_secs: u32,
    pub output_location: PathBuf,
    pub upload_enabled: bool,
    /// Applied before collecting when set.
    pub sample_rate: Option<SampleRate>,
}

/// A running collection.
///
/// Cancellation is observed at two checkpoints only: before the collection
/// request is issued and before the upload. Once the device has been told to
/// collect, the download always runs to completion.
pub(crate) struct CollectionJob {
    pub id: JobId,
    pub request: CollectionRequest,
    pub started_at: DateTime<Utc>,
    started: Instant,
    cancel: CancellationToken,
    events: CollectorEventSender,
}

impl CollectionJob {
    pub fn new(
        request: CollectionRequest,
        cancel: CancellationToken,
        events: CollectorEventSender,
    ) -> Self {
        Self {
            id: JobId::new_v4(),
            request,
            started_at: Utc::now(),
            started: Instant::now(),
            cancel,
            events,
        }
    }

    pub fn elapsed_seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn send(&self, event: CollectorEvent) {
        // The receiver only disappears during shutdown.
        let _ = self.events.send(event);
    }

    fn stage(&self, stage: CollectionStage, message: impl Into<String>) {
        self.send(CollectorEvent::Stage {
            job_id: self.id,
            device: self.request.device.clone(),
            stage,
            message: message.into(),
        });
    }

    /// Run the cycle to its terminal stage. Never returns early without
    /// emitting a terminal stage event.
    pub async fn run<P>(&self, protocol: &P) -> CollectionResult
    where
        P: DeviceProtocol + ?Sized,
    {
        let mut result = CollectionResult::pending(self.id, &self.request.device, self.started_at);
        let outcome = self.execute(protocol, &mut result).await;
        result.elapsed_seconds = self.elapsed_seconds();

        match outcome {
            Ok(()) => {
                result.success = true;
                self.stage(
                    CollectionStage::Complete,
                    format!("Complete in {:.1}s", result.elapsed_seconds),
                );
                info!(
                    device = %self.request.device,
                    job_id = %self.id,
                    bytes = result.saved_file_size,
                    elapsed = result.elapsed_seconds,
                    "Collection complete"
                );
                result
            }
            Err(message) => {
                warn!(
                    device = %self.request.device,
                    job_id = %self.id,
                    error = %message,
                    "Collection failed"
                );
                self.stage(CollectionStage::Error, format!("Error: {message}"));
                result.fail(message)
            }
        }
    }

    /// Terminate the job with `message` when `run` did not return normally.
    pub fn abort(&self, message: &str) -> CollectionResult {
        self.stage(CollectionStage::Error, format!("Error: {message}"));
        let mut result =
            CollectionResult::pending(self.id, &self.request.device, self.started_at).fail(message);
        result.elapsed_seconds = self.elapsed_seconds();
        result
    }

    async fn execute<P>(&self, protocol: &P, result: &mut CollectionResult) -> Result<(), String>
    where
        P: DeviceProtocol + ?Sized,
    {
        let address = self.request.address.as_str();

        self.stage(CollectionStage::Connecting, "Connecting...");
        match protocol.probe_status(address).await {
            Ok(status) => {
                result.battery = status.battery_soc;
                let battery = status
                    .battery_soc
                    .map(|soc| format!("{soc:.0}%"))
                    .unwrap_or_else(|| "N/A".to_string());
                self.stage(
                    CollectionStage::Connecting,
                    format!("Connected (Battery: {battery})"),
                );
            }
            // The collection request itself is the authoritative reachability check.
            Err(e) => {
                debug!(device = %self.request.device, error = %e, "Status probe failed");
                self.stage(
                    CollectionStage::Connecting,
                    format!("Status unavailable ({e}), continuing"),
                );
            }
        }

        if let Some(rate) = self.request.sample_rate
            && let Err(e) = protocol.apply_sample_rate(address, rate).await
        {
            warn!(device = %self.request.device, rate = %rate, error = %e, "Failed to apply sample rate");
        }

        if self.cancel.is_cancelled() {
            return Err(CANCELLED.to_string());
        }

        self.stage(
            CollectionStage::Collecting,
            format!("Collecting for {}s...", self.request.duration_secs),
        );

        let downloading = AtomicBool::new(false);
        let on_progress = |downloaded: u64, total: u64| {
            if !downloading.swap(true, Ordering::AcqRel) {
                self.stage(CollectionStage::Downloading, "Downloading...");
            }
            self.send(CollectorEvent::Progress {
                job_id: self.id,
                device: self.request.device.clone(),
                downloaded,
                total,
            });
        };

        let path = protocol
            .collect_and_download(
                address,
                self.request.duration_secs,
                &self.request.output_location,
                &on_progress,
            )
            .await
            .map_err(|e| e.to_string())?;

        let size = file_size_or_zero(&path).await;
        result.saved_file_path = Some(path);
        result.saved_file_size = size;
        self.stage(
            CollectionStage::Downloading,
            format!("Downloaded {:.1} KB", size as f64 / 1024.0),
        );

        if self.cancel.is_cancelled() {
            return Err(CANCELLED.to_string());
        }

        if self.request.upload_enabled {
            self.stage(CollectionStage::Uploading, "Uploading...");
            match protocol.trigger_upload(address).await {
                Ok(report) => {
                    self.stage(
                        CollectionStage::Uploading,
                        format!("Upload: {}", report.status),
                    );
                    result.upload_status = Some(report.status);
                }
                Err(e) => {
                    warn!(device = %self.request.device, error = %e, "Upload failed");
                    result.upload_status = Some(format!("Failed: {e}"));
                    self.send(CollectorEvent::UploadFailed {
                        job_id: self.id,
                        device: self.request.device.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}
