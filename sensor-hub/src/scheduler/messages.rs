//! Commands sent to the scheduler service.
//!
//! Every command carries a oneshot reply so callers observe the outcome of
//! the coordinator operation it maps to.

use tokio::sync::oneshot;

use crate::Result;
use crate::domain::{DeviceRecord, ScheduleConfig};

#[derive(Debug)]
pub enum SchedulerCommand {
    DeviceFound {
        name: String,
        address: String,
        reply: oneshot::Sender<()>,
    },
    DeviceLost {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    StartDevice {
        name: String,
        run_immediately: bool,
        reply: oneshot::Sender<bool>,
    },
    StopDevice {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    StartAll {
        run_immediately: bool,
        reply: oneshot::Sender<usize>,
    },
    StopAll {
        reply: oneshot::Sender<usize>,
    },
    UpdateConfig {
        name: String,
        config: Box<ScheduleConfig>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Copy one device's acquisition and interval settings onto every other
    /// device. Answers with the number of devices updated.
    ApplyConfigToAll {
        source: String,
        reply: oneshot::Sender<Result<usize>>,
    },
    /// Sent by the service to itself once new configurations are persisted.
    CommitConfigs {
        configs: Vec<(String, ScheduleConfig)>,
        reply: oneshot::Sender<Vec<Result<()>>>,
    },
    /// Sent by the service to itself when a discovery-time status probe
    /// reported a battery level.
    BatteryProbed {
        name: String,
        battery: f64,
    },
    CancelJob {
        name: String,
        reply: oneshot::Sender<bool>,
    },
    /// Blink the device LED. Answered once the device responds.
    Identify {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        name: String,
        reply: oneshot::Sender<Option<DeviceRecord>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<DeviceRecord>>,
    },
    /// Stop the service loop. Schedules and in-flight jobs are left as is.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}
