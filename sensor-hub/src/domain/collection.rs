//! Collection cycle stages and results.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::device::DeviceStatus;

/// Identifier of one collection job.
pub type JobId = Uuid;

/// Stage of a collection cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStage {
    Connecting,
    Collecting,
    Downloading,
    Uploading,
    Complete,
    Error,
}

impl CollectionStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, CollectionStage::Complete | CollectionStage::Error)
    }

    /// Device status shown while the job is in this stage.
    ///
    /// `Complete` has no mapping: the status after a finished cycle is
    /// decided by the stop policy when the result is reconciled.
    pub fn device_status(self) -> Option<DeviceStatus> {
        match self {
            CollectionStage::Connecting | CollectionStage::Collecting => {
                Some(DeviceStatus::Collecting)
            }
            CollectionStage::Downloading => Some(DeviceStatus::Downloading),
            CollectionStage::Uploading => Some(DeviceStatus::Uploading),
            CollectionStage::Error => Some(DeviceStatus::Error),
            CollectionStage::Complete => None,
        }
    }
}

impl fmt::Display for CollectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectionStage::Connecting => "connecting",
            CollectionStage::Collecting => "collecting",
            CollectionStage::Downloading => "downloading",
            CollectionStage::Uploading => "uploading",
            CollectionStage::Complete => "complete",
            CollectionStage::Error => "error",
        };
        f.write_str(s)
    }
}

/// Terminal result of one collection job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionResult {
    pub job_id: JobId,
    pub device: String,
    pub started_at: DateTime<Utc>,
    /// Local collection succeeded. Independent of the upload outcome.
    pub success: bool,
    pub saved_file_path: Option<PathBuf>,
    pub saved_file_size: u64,
    /// Status reported by the remote upload, or `Failed: <reason>`.
    pub upload_status: Option<String>,
    /// Absent on success.
    pub error_message: Option<String>,
    pub elapsed_seconds: f64,
    /// Battery state of charge reported by the status probe.
    pub battery: Option<f64>,
}

impl CollectionResult {
    /// A not-yet-successful result for a job that just started.
    pub fn pending(job_id: JobId, device: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            device: device.into(),
            started_at,
            success: false,
            saved_file_path: None,
            saved_file_size: 0,
            upload_status: None,
            error_message: None,
            elapsed_seconds: 0.0,
            battery: None,
        }
    }

    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(message.into());
        self
    }

    /// Whether the remote upload reported success.
    pub fn upload_succeeded(&self) -> bool {
        self.upload_status.as_deref().is_some_and(|status| {
            let status = status.to_ascii_lowercase();
            !status.starts_with("failed") && status.contains("success")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with_upload(status: Option<&str>) -> CollectionResult {
        let mut result = CollectionResult::pending(Uuid::new_v4(), "EVBS_01", Utc::now());
        result.success = true;
        result.upload_status = status.map(str::to_string);
        result
    }

    #[test]
    fn test_upload_succeeded() {
        assert!(result_with_upload(Some("Upload successful")).upload_succeeded());
        assert!(result_with_upload(Some("SUCCESS")).upload_succeeded());
        assert!(!result_with_upload(Some("Unknown")).upload_succeeded());
        assert!(!result_with_upload(Some("Failed: success flag missing")).upload_succeeded());
        assert!(!result_with_upload(None).upload_succeeded());
    }

    #[test]
    fn test_fail_sets_message() {
        let result = CollectionResult::pending(Uuid::new_v4(), "EVBS_01", Utc::now()).fail("boom");
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_stage_device_status_mapping() {
        assert_eq!(
            CollectionStage::Connecting.device_status(),
            Some(DeviceStatus::Collecting)
        );
        assert_eq!(
            CollectionStage::Downloading.device_status(),
            Some(DeviceStatus::Downloading)
        );
        assert_eq!(
            CollectionStage::Uploading.device_status(),
            Some(DeviceStatus::Uploading)
        );
        assert_eq!(CollectionStage::Error.device_status(), Some(DeviceStatus::Error));
        assert_eq!(CollectionStage::Complete.device_status(), None);
        assert!(CollectionStage::Complete.is_terminal());
        assert!(!CollectionStage::Uploading.is_terminal());
    }
}
