//! Job runner.
//!
//! Executes one collection cycle per request on a worker task, enforcing at
//! most one in-flight job per device. Progress and results are reported as
//! [`CollectorEvent`]s.

pub mod events;
pub mod job;
pub mod manager;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{CollectorEvent, CollectorEventReceiver, CollectorEventSender};
pub use job::CollectionRequest;
pub use manager::{ActiveJob, Collector, JobLauncher};
pub use protocol::{DeviceProtocol, HttpDeviceProtocol, ProtocolError};
