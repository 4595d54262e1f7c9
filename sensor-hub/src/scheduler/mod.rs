//! Schedule coordination.
//!
//! The [`Coordinator`] owns every device record and decides when cycles run
//! and when schedules halt. [`SchedulerService`] hosts it on a single task;
//! everything else talks to it through a [`SchedulerHandle`] and observes it
//! through [`SchedulerEvent`]s.

pub mod coordinator;
pub mod events;
pub mod handle;
pub mod messages;
pub mod registry;
pub mod service;

pub use coordinator::Coordinator;
pub use events::{SchedulerEvent, StopReason};
pub use handle::SchedulerHandle;
pub use messages::SchedulerCommand;
pub use registry::{DeviceRegistry, Registration};
pub use service::{HEARTBEAT_PERIOD, SchedulerService};
