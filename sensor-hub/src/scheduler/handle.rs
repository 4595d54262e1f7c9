//! Cloneable handle to the scheduler service.

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::events::SchedulerEvent;
use super::messages::SchedulerCommand;
use crate::discovery::DiscoverySink;
use crate::domain::{DeviceRecord, ScheduleConfig};
use crate::{Error, Result};

/// Async front-end for the coordinator.
///
/// Every call is a request/response round trip through the service mailbox;
/// once the service has stopped, calls fail with [`Error::SchedulerStopped`].
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
    events: broadcast::Sender<SchedulerEvent>,
    cancellation_token: CancellationToken,
}

impl SchedulerHandle {
    pub(crate) fn new(
        sender: mpsc::Sender<SchedulerCommand>,
        events: broadcast::Sender<SchedulerEvent>,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            sender,
            events,
            cancellation_token,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| Error::SchedulerStopped)?;
        response.await.map_err(|_| Error::SchedulerStopped)
    }

    /// Register a device, or refresh the address of a known one.
    pub async fn device_found(
        &self,
        name: impl Into<String>,
        address: impl Into<String>,
    ) -> Result<()> {
        let name = name.into();
        let address = address.into();
        self.request(|reply| SchedulerCommand::DeviceFound {
            name,
            address,
            reply,
        })
        .await
    }

    /// Forget a device, halting its schedule. Returns false if it was unknown.
    pub async fn device_lost(&self, name: impl Into<String>) -> Result<bool> {
        let name = name.into();
        self.request(|reply| SchedulerCommand::DeviceLost { name, reply })
            .await
    }

    pub async fn start_device(
        &self,
        name: impl Into<String>,
        run_immediately: bool,
    ) -> Result<bool> {
        let name = name.into();
        self.request(|reply| SchedulerCommand::StartDevice {
            name,
            run_immediately,
            reply,
        })
        .await
    }

    pub async fn stop_device(&self, name: impl Into<String>) -> Result<bool> {
        let name = name.into();
        self.request(|reply| SchedulerCommand::StopDevice { name, reply })
            .await
    }

    pub async fn start_all(&self, run_immediately: bool) -> Result<usize> {
        self.request(|reply| SchedulerCommand::StartAll {
            run_immediately,
            reply,
        })
        .await
    }

    pub async fn stop_all(&self) -> Result<usize> {
        self.request(|reply| SchedulerCommand::StopAll { reply }).await
    }

    pub async fn update_config(
        &self,
        name: impl Into<String>,
        config: ScheduleConfig,
    ) -> Result<()> {
        let name = name.into();
        self.request(|reply| SchedulerCommand::UpdateConfig {
            name,
            config: Box::new(config),
            reply,
        })
        .await?
    }

    /// Copy `source`'s duration, interval, sample rate, output location and
    /// upload flag onto every other known device, persisting them first.
    /// Returns how many devices were updated.
    pub async fn apply_config_to_all(&self, source: impl Into<String>) -> Result<usize> {
        let source = source.into();
        self.request(|reply| SchedulerCommand::ApplyConfigToAll { source, reply })
            .await?
    }

    /// Request cancellation of the device's in-flight job.
    pub async fn cancel_job(&self, name: impl Into<String>) -> Result<bool> {
        let name = name.into();
        self.request(|reply| SchedulerCommand::CancelJob { name, reply })
            .await
    }

    /// Flash the device's identification LED.
    pub async fn identify(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| SchedulerCommand::Identify { name, reply })
            .await?
    }

    pub async fn get(&self, name: impl Into<String>) -> Result<Option<DeviceRecord>> {
        let name = name.into();
        self.request(|reply| SchedulerCommand::Get { name, reply })
            .await
    }

    /// Every known device, sorted by name.
    pub async fn snapshot(&self) -> Result<Vec<DeviceRecord>> {
        self.request(|reply| SchedulerCommand::Snapshot { reply })
            .await
    }

    /// Stop the service loop. Succeeds if it already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        match self
            .request(|reply| SchedulerCommand::Shutdown { reply })
            .await
        {
            Ok(()) | Err(Error::SchedulerStopped) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }
}

#[async_trait]
impl DiscoverySink for SchedulerHandle {
    async fn device_found(&self, name: &str, address: &str) -> Result<()> {
        SchedulerHandle::device_found(self, name, address).await
    }

    async fn device_lost(&self, name: &str) -> Result<()> {
        SchedulerHandle::device_lost(self, name).await.map(|_| ())
    }
}
