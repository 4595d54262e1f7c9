//! User-editable schedule configuration for a device.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sensor_client::{AccelRange, SampleRate};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Unit of the collection interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Seconds,
    #[default]
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl IntervalUnit {
    pub fn multiplier(self) -> u64 {
        match self {
            IntervalUnit::Seconds => 1,
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 3_600,
            IntervalUnit::Days => 86_400,
            IntervalUnit::Weeks => 604_800,
        }
    }

    pub fn to_seconds(self, value: u64) -> u64 {
        value.saturating_mul(self.multiplier())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IntervalUnit::Seconds => "seconds",
            IntervalUnit::Minutes => "minutes",
            IntervalUnit::Hours => "hours",
            IntervalUnit::Days => "days",
            IntervalUnit::Weeks => "weeks",
        }
    }
}

impl fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntervalUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(IntervalUnit::Seconds),
            "m" | "min" | "minute" | "minutes" => Ok(IntervalUnit::Minutes),
            "h" | "hour" | "hours" => Ok(IntervalUnit::Hours),
            "d" | "day" | "days" => Ok(IntervalUnit::Days),
            "w" | "week" | "weeks" => Ok(IntervalUnit::Weeks),
            other => Err(Error::validation(format!("unknown interval unit: {other}"))),
        }
    }
}

/// Policy deciding whether a schedule re-arms after a completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Never stops on its own.
    #[default]
    Continuous,
    /// Stops after `repetition_count` completed cycles.
    AfterCount,
    /// Stops after the first cycle completing at or past `stop_at_time`.
    AtTime,
}

/// Outcome of evaluating the stop policy for one completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDecision {
    Rearm,
    Stop,
}

/// Per-device schedule and acquisition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Length of one collection in seconds.
    pub collection_duration_secs: u32,
    pub interval_value: u64,
    pub interval_unit: IntervalUnit,
    pub sample_rate: SampleRate,
    pub accel_range: AccelRange,
    /// Destination folder; `None` means the device is not configured.
    pub output_location: Option<PathBuf>,
    pub upload_enabled: bool,
    pub stop_mode: StopMode,
    /// Only used with [`StopMode::AfterCount`].
    pub repetition_count: u32,
    /// Only used with [`StopMode::AtTime`].
    pub stop_at_time: Option<DateTime<Utc>>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            collection_duration_secs: 10,
            interval_value: 5,
            interval_unit: IntervalUnit::Minutes,
            sample_rate: SampleRate::Hz104,
            accel_range: AccelRange::G4,
            output_location: None,
            upload_enabled: true,
            stop_mode: StopMode::Continuous,
            repetition_count: 1,
            stop_at_time: None,
        }
    }
}

impl ScheduleConfig {
    /// Interval normalized to seconds, never below one second.
    pub fn interval_seconds(&self) -> u64 {
        self.interval_unit.to_seconds(self.interval_value).max(1)
    }

    /// A device can only be scheduled once it knows where to save data.
    pub fn is_runnable(&self) -> bool {
        self.output_location.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.collection_duration_secs == 0 {
            return Err(Error::validation("collection duration must be at least 1 second"));
        }
        if self.stop_mode == StopMode::AfterCount && self.repetition_count == 0 {
            return Err(Error::validation("repetition count must be at least 1"));
        }
        if self.stop_mode == StopMode::AtTime && self.stop_at_time.is_none() {
            return Err(Error::validation("stop time is required for the at-time stop mode"));
        }
        if let Some(dir) = &self.output_location
            && dir.as_os_str().is_empty()
        {
            return Err(Error::validation("output location must not be empty"));
        }
        Ok(())
    }
}
