//! Domain types for the collection scheduler.
//!
//! A [`DeviceRecord`] joins a device's identity, its user-editable
//! [`ScheduleConfig`] and the runtime state owned by the coordinator.

pub mod collection;
pub mod device;
pub mod schedule;

pub use collection::{CollectionResult, CollectionStage, JobId};
pub use device::{
    DeviceIdentity, DeviceRecord, DeviceRuntimeState, DeviceStats, DeviceStatus, format_countdown,
    progress_percent,
};
pub use schedule::{CycleDecision, IntervalUnit, ScheduleConfig, StopMode};
