//! Scheduler service: the task that owns the coordinator.
//!
//! One loop multiplexes the command mailbox, the job event channel, the
//! shared heartbeat and cancellation. The heartbeat is only polled while at
//! least one device is scheduled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::coordinator::Coordinator;
use super::events::{EVENT_CHANNEL_CAPACITY, SchedulerEvent};
use super::handle::SchedulerHandle;
use super::messages::SchedulerCommand;
use super::registry::Registration;
use crate::{Error, Result};
use crate::collector::{Collector, CollectorEventReceiver, DeviceProtocol, JobLauncher};
use crate::config::JsonSettingsStore;
use crate::domain::{DeviceIdentity, ScheduleConfig};

/// Default mailbox capacity.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Period of the shared countdown heartbeat.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

pub struct SchedulerService<L: ?Sized> {
    coordinator: Coordinator<L>,
    mailbox: mpsc::Receiver<SchedulerCommand>,
    /// Lets spawned work report back without keeping the mailbox open.
    commands: mpsc::WeakSender<SchedulerCommand>,
    jobs: CollectorEventReceiver,
    protocol: Arc<dyn DeviceProtocol>,
    settings: Option<Arc<JsonSettingsStore>>,
    cancellation_token: CancellationToken,
}

impl<P: DeviceProtocol> SchedulerService<Collector<P>> {
    /// Build a collector over `protocol` and a service driving it.
    pub fn with_protocol(
        protocol: Arc<P>,
        cancellation_token: CancellationToken,
    ) -> (Self, SchedulerHandle, Arc<Collector<P>>) {
        let (collector, jobs) = Collector::new(protocol.clone());
        let collector = Arc::new(collector);
        let (service, handle) =
            Self::new(collector.clone(), jobs, protocol, cancellation_token);
        (service, handle, collector)
    }
}

impl<L: JobLauncher + ?Sized> SchedulerService<L> {
    pub fn new(
        launcher: Arc<L>,
        jobs: CollectorEventReceiver,
        protocol: Arc<dyn DeviceProtocol>,
        cancellation_token: CancellationToken,
    ) -> (Self, SchedulerHandle) {
        let (tx, mailbox) = mpsc::channel(DEFAULT_MAILBOX_CAPACITY);
        let commands = tx.downgrade();
        let (events, _) = broadcast::channel::<SchedulerEvent>(EVENT_CHANNEL_CAPACITY);
        let handle = SchedulerHandle::new(tx, events.clone(), cancellation_token.clone());
        let service = Self {
            coordinator: Coordinator::new(launcher, events),
            mailbox,
            commands,
            jobs,
            protocol,
            settings: None,
            cancellation_token,
        };
        (service, handle)
    }

    /// Load settings for discovered devices from `settings` and persist
    /// configuration updates to it.
    pub fn with_settings(mut self, settings: Arc<JsonSettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Scheduler service starting");

        let mut heartbeat = tokio::time::interval(HEARTBEAT_PERIOD);
        let mut beating = false;

        loop {
            let active = self.coordinator.heartbeat_active();
            if active && !beating {
                // first tick one full period after the first device is scheduled
                heartbeat.reset();
                debug!("Heartbeat started");
            } else if !active && beating {
                debug!("Heartbeat stopped");
            }
            beating = active;

            tokio::select! {
                biased;

                _ = self.cancellation_token.cancelled() => {
                    info!("Scheduler service cancelled");
                    break;
                }

                event = self.jobs.recv() => match event {
                    Some(event) => self.coordinator.handle_job_event(event),
                    None => {
                        warn!("Job event channel closed");
                        break;
                    }
                },

                command = self.mailbox.recv() => match command {
                    Some(command) => {
                        if self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        debug!("All scheduler handles dropped");
                        break;
                    }
                },

                _ = heartbeat.tick(), if beating => self.coordinator.tick(),
            }
        }

        info!("Scheduler service stopped");
    }

    /// Apply one command. Returns true when the loop should exit.
    fn handle_command(&mut self, command: SchedulerCommand) -> bool {
        match command {
            SchedulerCommand::DeviceFound {
                name,
                address,
                reply,
            } => {
                let config = self.settings_for(&name);
                let registration = self
                    .coordinator
                    .register(DeviceIdentity::new(name.clone(), address.clone()), config);
                if registration == Registration::Added {
                    self.probe_battery(name, address);
                }
                let _ = reply.send(());
            }
            SchedulerCommand::DeviceLost { name, reply } => {
                let _ = reply.send(self.coordinator.unregister(&name).is_some());
            }
            SchedulerCommand::StartDevice {
                name,
                run_immediately,
                reply,
            } => {
                let _ = reply.send(self.coordinator.start_device(&name, run_immediately));
            }
            SchedulerCommand::StopDevice { name, reply } => {
                let _ = reply.send(self.coordinator.stop_device(&name));
            }
            SchedulerCommand::StartAll {
                run_immediately,
                reply,
            } => {
                let _ = reply.send(self.coordinator.start_all(run_immediately));
            }
            SchedulerCommand::StopAll { reply } => {
                let _ = reply.send(self.coordinator.stop_all());
            }
            SchedulerCommand::UpdateConfig {
                name,
                config,
                reply,
            } => {
                let config = *config;
                if let Err(e) = self.check_update(&name, &config) {
                    let _ = reply.send(Err(e));
                    return false;
                }
                self.persist_then_commit(vec![(name, config)], move |result| {
                    let _ = reply.send(result.and_then(|mut results| {
                        results.pop().unwrap_or(Ok(()))
                    }));
                });
            }
            SchedulerCommand::ApplyConfigToAll { source, reply } => {
                let copies = match self.coordinator.config_copies(&source) {
                    Ok(copies) if copies.is_empty() => {
                        let _ = reply.send(Ok(0));
                        return false;
                    }
                    Ok(copies) => copies,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return false;
                    }
                };
                info!(source = %source, devices = copies.len(), "Applying settings to all devices");
                self.persist_then_commit(copies, move |result| {
                    let _ = reply.send(
                        result.map(|results| results.iter().filter(|r| r.is_ok()).count()),
                    );
                });
            }
            SchedulerCommand::CommitConfigs { configs, reply } => {
                let _ = reply.send(self.commit_configs(configs));
            }
            SchedulerCommand::BatteryProbed { name, battery } => {
                if !self.coordinator.record_battery(&name, battery) {
                    debug!(device = %name, "Battery probe for a device no longer known");
                }
            }
            SchedulerCommand::CancelJob { name, reply } => {
                let _ = reply.send(self.coordinator.cancel_job(&name));
            }
            SchedulerCommand::Identify { name, reply } => self.identify(name, reply),
            SchedulerCommand::Get { name, reply } => {
                let _ = reply.send(self.coordinator.get(&name).cloned());
            }
            SchedulerCommand::Snapshot { reply } => {
                let _ = reply.send(self.coordinator.snapshot());
            }
            SchedulerCommand::Shutdown { reply } => {
                info!("Scheduler service shutdown requested");
                let _ = reply.send(());
                return true;
            }
        }
        false
    }

    fn settings_for(&self, name: &str) -> ScheduleConfig {
        self.settings
            .as_ref()
            .map(|settings| settings.load(name))
            .unwrap_or_default()
    }

    fn check_update(&self, name: &str, config: &ScheduleConfig) -> Result<()> {
        config.validate()?;
        if self.coordinator.get(name).is_none() {
            return Err(Error::not_found("Device", name));
        }
        Ok(())
    }

    /// Write `configs` to the settings store off the service task and apply
    /// them only once the write succeeded. Without a store they apply at once.
    fn persist_then_commit(
        &mut self,
        configs: Vec<(String, ScheduleConfig)>,
        done: impl FnOnce(Result<Vec<Result<()>>>) + Send + 'static,
    ) {
        let Some(settings) = self.settings.clone() else {
            done(Ok(self.commit_configs(configs)));
            return;
        };
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = match settings.save_all(&configs).await {
                Ok(()) => commit_through(&commands, configs).await,
                Err(e) => {
                    warn!(error = %e, "Failed to persist device settings, keeping previous ones");
                    Err(e)
                }
            };
            done(result);
        });
    }

    fn commit_configs(&mut self, configs: Vec<(String, ScheduleConfig)>) -> Vec<Result<()>> {
        configs
            .into_iter()
            .map(|(name, config)| self.coordinator.update_config(&name, config))
            .collect()
    }

    /// Read the battery level of a newly found device off the service task.
    fn probe_battery(&self, name: String, address: String) {
        let protocol = Arc::clone(&self.protocol);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let battery = match protocol.probe_status(&address).await {
                Ok(status) => status.battery_soc,
                Err(e) => {
                    debug!(device = %name, error = %e, "Status probe on discovery failed");
                    None
                }
            };
            if let Some(battery) = battery
                && let Some(commands) = commands.upgrade()
            {
                let _ = commands
                    .send(SchedulerCommand::BatteryProbed { name, battery })
                    .await;
            }
        });
    }

    /// Blink runs off the service task so a slow device never stalls it.
    fn identify(&self, name: String, reply: oneshot::Sender<Result<()>>) {
        let Some(record) = self.coordinator.get(&name) else {
            let _ = reply.send(Err(Error::not_found("Device", name)));
            return;
        };
        let address = record.address().to_string();
        let protocol = Arc::clone(&self.protocol);
        tokio::spawn(async move {
            let result = protocol
                .identify_blink(&address)
                .await
                .map_err(|e| Error::Other(format!("Blink failed for {name}: {e}")));
            if result.is_ok() {
                debug!(device = %name, "Identify blink sent");
            }
            let _ = reply.send(result);
        });
    }
}

/// Hand persisted configurations back to the service task and wait for the
/// outcome of applying them.
async fn commit_through(
    commands: &mpsc::WeakSender<SchedulerCommand>,
    configs: Vec<(String, ScheduleConfig)>,
) -> Result<Vec<Result<()>>> {
    let (reply, response) = oneshot::channel();
    let sender = commands.upgrade().ok_or(Error::SchedulerStopped)?;
    sender
        .send(SchedulerCommand::CommitConfigs { configs, reply })
        .await
        .map_err(|_| Error::SchedulerStopped)?;
    drop(sender);
    response.await.map_err(|_| Error::SchedulerStopped)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::*;
    use crate::collector::testing::FakeProtocol;
    use crate::collector::{CollectionRequest, CollectorEvent, CollectorEventSender};
    use crate::domain::{CollectionResult, DeviceStatus, IntervalUnit, JobId, StopMode};

    /// Completes every job successfully as soon as it is launched.
    struct InstantLauncher {
        jobs: CollectorEventSender,
        launched: Mutex<Vec<CollectionRequest>>,
    }

    impl JobLauncher for InstantLauncher {
        fn launch(&self, request: CollectionRequest) -> Option<JobId> {
            let job_id = Uuid::new_v4();
            let mut result = CollectionResult::pending(job_id, &request.device, Utc::now());
            result.success = true;
            self.launched.lock().push(request);
            let _ = self.jobs.send(CollectorEvent::Completed { result });
            Some(job_id)
        }

        fn cancel(&self, _device: &str) -> bool {
            false
        }

        fn cancel_all(&self) -> usize {
            0
        }

        fn is_busy(&self, _device: &str) -> bool {
            false
        }
    }

    fn spawn_service() -> (SchedulerHandle, Arc<InstantLauncher>, Arc<FakeProtocol>, JoinHandle<()>) {
        let (tx, rx) = crate::collector::events::channel();
        let launcher = Arc::new(InstantLauncher {
            jobs: tx,
            launched: Mutex::new(Vec::new()),
        });
        let protocol = Arc::new(FakeProtocol::new());
        let (service, handle) = SchedulerService::new(
            launcher.clone(),
            rx,
            protocol.clone(),
            CancellationToken::new(),
        );
        let task = service.spawn();
        (handle, launcher, protocol, task)
    }

    fn runnable(interval_secs: u64, stop_mode: StopMode, repetitions: u32) -> ScheduleConfig {
        ScheduleConfig {
            interval_value: interval_secs,
            interval_unit: IntervalUnit::Seconds,
            output_location: Some("/tmp/sensor-data".into()),
            stop_mode,
            repetition_count: repetitions,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_drives_after_count_schedule() {
        let (handle, launcher, _protocol, _task) = spawn_service();
        handle.device_found("EVBS_01", "10.0.0.2").await.unwrap();
        handle
            .update_config("EVBS_01", runnable(5, StopMode::AfterCount, 3))
            .await
            .unwrap();
        assert!(handle.start_device("EVBS_01", false).await.unwrap());

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert_eq!(launcher.launched.lock().len(), 0);
        let record = handle.get("EVBS_01").await.unwrap().unwrap();
        assert_eq!(record.runtime.countdown_seconds, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(launcher.launched.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(launcher.launched.lock().len(), 3);
        let record = handle.get("EVBS_01").await.unwrap().unwrap();
        assert!(!record.runtime.is_scheduled);
        assert_eq!(record.runtime.status, DeviceStatus::Idle);
        assert_eq!(record.runtime.stats.collections, 3);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(launcher.launched.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ticks_while_nothing_scheduled() {
        let (handle, _launcher, _protocol, _task) = spawn_service();
        let mut events = handle.subscribe();
        handle.device_found("EVBS_01", "10.0.0.2").await.unwrap();
        handle
            .update_config("EVBS_01", runnable(60, StopMode::Continuous, 1))
            .await
            .unwrap();
        handle.start_device("EVBS_01", false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        handle.stop_device("EVBS_01").await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let mut ticks = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SchedulerEvent::CountdownTick {
                remaining_seconds, ..
            } = event
            {
                ticks.push(remaining_seconds);
            }
        }
        assert_eq!(ticks, vec![59, 58]);
    }

    #[tokio::test]
    async fn test_run_immediately_and_device_lost() {
        let (handle, launcher, _protocol, _task) = spawn_service();
        handle.device_found("EVBS_01", "10.0.0.2").await.unwrap();
        handle
            .update_config("EVBS_01", runnable(300, StopMode::Continuous, 1))
            .await
            .unwrap();

        assert!(handle.start_device("EVBS_01", true).await.unwrap());
        assert_eq!(launcher.launched.lock().len(), 1);
        assert_eq!(launcher.launched.lock()[0].address, "10.0.0.2");

        assert!(handle.device_lost("EVBS_01").await.unwrap());
        assert!(!handle.device_lost("EVBS_01").await.unwrap());
        assert!(handle.get("EVBS_01").await.unwrap().is_none());
        assert!(handle.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_identify_uses_protocol() {
        let (handle, _launcher, protocol, _task) = spawn_service();
        handle.device_found("EVBS_01", "10.0.0.2").await.unwrap();

        handle.identify("EVBS_01").await.unwrap();
        assert_eq!(protocol.blink_calls(), 1);
        assert!(matches!(
            handle.identify("EVBS_99").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_settings_loaded_on_discovery_and_saved_on_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            JsonSettingsStore::open(dir.path().join("settings.json"))
                .unwrap()
                .with_output_root(Some(dir.path().join("data"))),
        );
        let (tx, rx) = crate::collector::events::channel();
        let launcher = Arc::new(InstantLauncher {
            jobs: tx,
            launched: Mutex::new(Vec::new()),
        });
        let (service, handle) = SchedulerService::new(
            launcher,
            rx,
            Arc::new(FakeProtocol::new()),
            CancellationToken::new(),
        );
        let _task = service.with_settings(store.clone()).spawn();

        handle.device_found("EVBS_01", "10.0.0.2").await.unwrap();
        let record = handle.get("EVBS_01").await.unwrap().unwrap();
        assert_eq!(
            record.config.output_location,
            Some(dir.path().join("data").join("EVBS_01"))
        );
        assert!(record.is_runnable());

        let config = runnable(45, StopMode::Continuous, 1);
        handle.update_config("EVBS_01", config.clone()).await.unwrap();
        assert_eq!(store.load("EVBS_01"), config);
    }

    fn spawn_with_store(
        store: Arc<JsonSettingsStore>,
    ) -> (SchedulerHandle, Arc<InstantLauncher>, JoinHandle<()>) {
        let (tx, rx) = crate::collector::events::channel();
        let launcher = Arc::new(InstantLauncher {
            jobs: tx,
            launched: Mutex::new(Vec::new()),
        });
        let (service, handle) = SchedulerService::new(
            launcher.clone(),
            rx,
            Arc::new(FakeProtocol::new()),
            CancellationToken::new(),
        );
        let task = service.with_settings(store).spawn();
        (handle, launcher, task)
    }

    #[tokio::test]
    async fn test_failed_settings_write_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let store = Arc::new(JsonSettingsStore::open(&path).unwrap());
        let (handle, _launcher, _task) = spawn_with_store(store.clone());
        handle.device_found("EVBS_01", "10.0.0.2").await.unwrap();
        let before = handle.get("EVBS_01").await.unwrap().unwrap().config;

        // the settings file can no longer be replaced
        std::fs::create_dir(&path).unwrap();
        let result = handle
            .update_config("EVBS_01", runnable(42, StopMode::Continuous, 1))
            .await;
        assert!(matches!(result, Err(Error::IoPath { .. })));

        let record = handle.get("EVBS_01").await.unwrap().unwrap();
        assert_eq!(record.config, before);
        assert_eq!(record.config.interval_value, 5);
        assert!(!store.contains("EVBS_01"));
        assert!(!dir.path().join("settings.json.tmp").exists());

        // rejected before anything is written
        assert!(matches!(
            handle
                .update_config("EVBS_99", runnable(42, StopMode::Continuous, 1))
                .await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_config_to_all_persists_and_applies() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonSettingsStore::open(dir.path().join("settings.json")).unwrap());
        let (handle, _launcher, _task) = spawn_with_store(store.clone());
        for (name, address) in [
            ("EVBS_01", "10.0.0.2"),
            ("EVBS_02", "10.0.0.3"),
            ("EVBS_03", "10.0.0.4"),
        ] {
            handle.device_found(name, address).await.unwrap();
        }
        let source = ScheduleConfig {
            collection_duration_secs: 20,
            upload_enabled: false,
            ..runnable(90, StopMode::AfterCount, 4)
        };
        handle.update_config("EVBS_02", source.clone()).await.unwrap();

        assert_eq!(handle.apply_config_to_all("EVBS_02").await.unwrap(), 2);
        for name in ["EVBS_01", "EVBS_03"] {
            let config = handle.get(name).await.unwrap().unwrap().config;
            assert_eq!(config.collection_duration_secs, 20);
            assert_eq!(config.interval_seconds(), 90);
            assert_eq!(config.output_location, source.output_location);
            assert!(!config.upload_enabled);
            assert_eq!(config.stop_mode, StopMode::Continuous);
            assert_eq!(store.load(name), config);
        }

        assert!(matches!(
            handle.apply_config_to_all("EVBS_99").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_config_to_all_without_other_devices() {
        let (handle, _launcher, _protocol, _task) = spawn_service();
        handle.device_found("EVBS_01", "10.0.0.2").await.unwrap();
        assert_eq!(handle.apply_config_to_all("EVBS_01").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_battery_probed_on_discovery() {
        let (handle, _launcher, _protocol, _task) = spawn_service();
        let mut events = handle.subscribe();
        handle.device_found("EVBS_01", "10.0.0.2").await.unwrap();

        let battery = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let SchedulerEvent::BatteryUpdated { battery, .. } = events.recv().await.unwrap() {
                    return battery;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(battery, 87.0);

        let record = handle.get("EVBS_01").await.unwrap().unwrap();
        assert_eq!(record.runtime.battery, Some(87.0));
        assert_eq!(record.runtime.stats.collections, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_service() {
        let (handle, _launcher, _protocol, task) = spawn_service();
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(!handle.is_running());
        assert!(matches!(
            handle.snapshot().await,
            Err(Error::SchedulerStopped)
        ));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_token_stops_service() {
        let (handle, _launcher, _protocol, task) = spawn_service();
        handle.cancellation_token().cancel();
        task.await.unwrap();
        assert!(handle.start_all(true).await.is_err());
    }
}
