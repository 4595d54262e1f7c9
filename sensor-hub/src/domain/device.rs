//! Device record: identity, schedule configuration and runtime state.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::collection::{CollectionResult, JobId};
use super::schedule::{CycleDecision, ScheduleConfig, StopMode};

/// Immutable identity announced by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub address: String,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }
}

/// Scheduling/display status of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Idle,
    Waiting,
    Collecting,
    Downloading,
    Uploading,
    /// Last cycle failed; display only.
    Error,
}

impl DeviceStatus {
    pub fn label(self) -> &'static str {
        match self {
            DeviceStatus::Idle => "Idle",
            DeviceStatus::Waiting => "Waiting",
            DeviceStatus::Collecting => "Collecting...",
            DeviceStatus::Downloading => "Downloading...",
            DeviceStatus::Uploading => "Uploading...",
            DeviceStatus::Error => "Error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Collection counters. Never decrease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceStats {
    pub collections: u64,
    pub uploaded: u64,
    pub errors: u64,
}

/// Mutable runtime state, owned by the coordinator.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceRuntimeState {
    pub status: DeviceStatus,
    pub is_scheduled: bool,
    pub countdown_seconds: u64,
    /// Only used with [`StopMode::AfterCount`].
    pub remaining_repetitions: u32,
    pub progress_percent: u8,
    pub stats: DeviceStats,
    pub battery: Option<f64>,
    pub last_error: Option<String>,
    /// In-flight job, if any.
    pub active_job: Option<JobId>,
}

/// One known device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    pub config: ScheduleConfig,
    pub runtime: DeviceRuntimeState,
}

impl DeviceRecord {
    pub fn new(identity: DeviceIdentity, config: ScheduleConfig) -> Self {
        Self {
            identity,
            config,
            runtime: DeviceRuntimeState::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn address(&self) -> &str {
        &self.identity.address
    }

    pub fn is_runnable(&self) -> bool {
        self.config.is_runnable()
    }

    pub fn has_job_in_flight(&self) -> bool {
        self.runtime.active_job.is_some()
    }

    pub fn reset_countdown(&mut self) {
        self.runtime.countdown_seconds = self.config.interval_seconds();
    }

    pub fn reset_repetitions(&mut self) {
        self.runtime.remaining_repetitions = self.config.repetition_count;
    }

    /// Decrement the countdown by one second. Returns true once it is zero.
    pub fn tick_countdown(&mut self) -> bool {
        self.runtime.countdown_seconds = self.runtime.countdown_seconds.saturating_sub(1);
        self.runtime.countdown_seconds == 0
    }

    /// Whether the stop policy would halt the schedule after the cycle that
    /// just completed. Pure: evaluating it any number of times changes nothing.
    pub fn would_stop(&self, now: DateTime<Utc>) -> bool {
        match self.config.stop_mode {
            StopMode::Continuous => false,
            StopMode::AfterCount => self.runtime.remaining_repetitions <= 1,
            StopMode::AtTime => self.config.stop_at_time.is_some_and(|at| now >= at),
        }
    }

    /// Consume one cycle against the stop policy.
    ///
    /// Must be called exactly once per completed cycle; for `AfterCount`
    /// every call uses up one repetition.
    pub fn commit_cycle_outcome(&mut self, now: DateTime<Utc>) -> CycleDecision {
        let stop = self.would_stop(now);
        if self.config.stop_mode == StopMode::AfterCount {
            self.runtime.remaining_repetitions = self.runtime.remaining_repetitions.saturating_sub(1);
        }
        if stop {
            CycleDecision::Stop
        } else {
            CycleDecision::Rearm
        }
    }

    /// Fold a job result into the counters.
    pub fn apply_result(&mut self, result: &CollectionResult) {
        let stats = &mut self.runtime.stats;
        if result.success {
            stats.collections += 1;
            if result.upload_succeeded() {
                stats.uploaded += 1;
            }
            self.runtime.last_error = None;
        } else {
            stats.errors += 1;
            self.runtime.last_error = result.error_message.clone();
        }
        if result.battery.is_some() {
            self.runtime.battery = result.battery;
        }
        self.runtime.progress_percent = 0;
    }

    /// Countdown rendered as `MM:SS` or `HH:MM:SS`.
    pub fn format_countdown(&self) -> String {
        format_countdown(self.runtime.countdown_seconds)
    }
}

/// Format seconds as `MM:SS`, or `HH:MM:SS` from one hour on.
pub fn format_countdown(total: u64) -> String {
    let hours = total / 3600;
    let mins = (total % 3600) / 60;
    let secs = total % 60;
    if hours > 0 {
        format!("{hours:02}:{mins:02}:{secs:02}")
    } else {
        format!("{mins:02}:{secs:02}")
    }
}

/// Download progress as a percentage; 50 when the total is unknown.
pub fn progress_percent(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 50;
    }
    let percent = downloaded.saturating_mul(100) / total;
    percent.min(100) as u8
}
