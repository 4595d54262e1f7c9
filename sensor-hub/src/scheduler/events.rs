//! Outbound scheduler events.
//!
//! Published on a tokio broadcast channel after the coordinator has applied
//! the corresponding state change, so a subscriber that queries a snapshot
//! in response sees the updated record.

use serde::Serialize;

use crate::domain::{CollectionResult, CollectionStage, JobId};

/// Broadcast capacity; slow subscribers lag rather than block the scheduler.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Why a schedule was halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Stopped by an explicit request.
    Requested,
    /// The stop policy ended the schedule after a completed cycle.
    PolicyComplete,
    /// Discovery reported the device gone.
    DeviceLost,
    /// The configuration no longer allows the device to run.
    NotRunnable,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    DeviceAdded {
        device: String,
        address: String,
    },
    DeviceRemoved {
        device: String,
    },
    /// A status probe outside a job reported the battery level.
    BatteryUpdated {
        device: String,
        battery: f64,
    },
    ScheduleStarted {
        device: String,
    },
    ScheduleStopped {
        device: String,
        reason: StopReason,
    },
    CountdownTick {
        device: String,
        remaining_seconds: u64,
    },
    JobStarted {
        device: String,
        job_id: JobId,
    },
    StageChanged {
        device: String,
        job_id: JobId,
        stage: CollectionStage,
        message: String,
    },
    Progress {
        device: String,
        job_id: JobId,
        downloaded: u64,
        total: u64,
        percent: u8,
    },
    UploadFailed {
        device: String,
        job_id: JobId,
        error: String,
    },
    /// The runner refused a job because one is already in flight.
    JobRejected {
        device: String,
    },
    JobCompleted {
        result: CollectionResult,
    },
}

impl SchedulerEvent {
    pub fn device(&self) -> &str {
        match self {
            SchedulerEvent::DeviceAdded { device, .. }
            | SchedulerEvent::DeviceRemoved { device }
            | SchedulerEvent::BatteryUpdated { device, .. }
            | SchedulerEvent::ScheduleStarted { device }
            | SchedulerEvent::ScheduleStopped { device, .. }
            | SchedulerEvent::CountdownTick { device, .. }
            | SchedulerEvent::JobStarted { device, .. }
            | SchedulerEvent::StageChanged { device, .. }
            | SchedulerEvent::Progress { device, .. }
            | SchedulerEvent::UploadFailed { device, .. }
            | SchedulerEvent::JobRejected { device } => device,
            SchedulerEvent::JobCompleted { result } => &result.device,
        }
    }

    /// Short kind name, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::DeviceAdded { .. } => "device_added",
            SchedulerEvent::DeviceRemoved { .. } => "device_removed",
            SchedulerEvent::BatteryUpdated { .. } => "battery_updated",
            SchedulerEvent::ScheduleStarted { .. } => "schedule_started",
            SchedulerEvent::ScheduleStopped { .. } => "schedule_stopped",
            SchedulerEvent::CountdownTick { .. } => "countdown_tick",
            SchedulerEvent::JobStarted { .. } => "job_started",
            SchedulerEvent::StageChanged { .. } => "stage_changed",
            SchedulerEvent::Progress { .. } => "progress",
            SchedulerEvent::UploadFailed { .. } => "upload_failed",
            SchedulerEvent::JobRejected { .. } => "job_rejected",
            SchedulerEvent::JobCompleted { .. } => "job_completed",
        }
    }
}
