//! Schedule coordinator.
//!
//! Single owner of every [`DeviceRecord`]. All methods are synchronous and
//! are only ever called from the scheduler service task; job runners reach
//! it exclusively through [`CollectorEvent`]s delivered by that task.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::events::{SchedulerEvent, StopReason};
use super::registry::{DeviceRegistry, Registration};
use crate::collector::{CollectionRequest, CollectorEvent, JobLauncher};
use crate::domain::{
    CollectionResult, CollectionStage, CycleDecision, DeviceIdentity, DeviceRecord, DeviceStatus,
    JobId, ScheduleConfig, progress_percent,
};
use crate::{Error, Result};

pub struct Coordinator<L: ?Sized> {
    registry: DeviceRegistry,
    launcher: Arc<L>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl<L: JobLauncher + ?Sized> Coordinator<L> {
    pub fn new(launcher: Arc<L>, events: broadcast::Sender<SchedulerEvent>) -> Self {
        Self {
            registry: DeviceRegistry::new(),
            launcher,
            events,
        }
    }

    fn publish(&self, event: SchedulerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // --- registry ---

    /// Register a discovered device. A known name only has its address refreshed.
    pub fn register(&mut self, identity: DeviceIdentity, config: ScheduleConfig) -> Registration {
        let name = identity.name.clone();
        let address = identity.address.clone();
        let registration = self.registry.register(identity, config);
        match registration {
            Registration::Added => {
                info!(device = %name, address = %address, "Device registered");
                self.publish(SchedulerEvent::DeviceAdded {
                    device: name,
                    address,
                });
            }
            Registration::Refreshed => {
                debug!(device = %name, address = %address, "Device address refreshed");
            }
        }
        registration
    }

    /// Forget a device, halting its schedule first.
    ///
    /// An in-flight job is left to finish; its completion no longer matches
    /// any record.
    pub fn unregister(&mut self, name: &str) -> Option<DeviceRecord> {
        if self
            .registry
            .get(name)
            .is_some_and(|record| record.runtime.is_scheduled)
        {
            self.halt(name, StopReason::DeviceLost);
        }
        let record = self.registry.remove(name)?;
        info!(device = %name, "Device unregistered");
        self.publish(SchedulerEvent::DeviceRemoved {
            device: name.to_string(),
        });
        Some(record)
    }

    pub fn get(&self, name: &str) -> Option<&DeviceRecord> {
        self.registry.get(name)
    }

    /// All records, sorted by name.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.registry.iter().cloned().collect();
        records.sort_by(|a, b| a.name().cmp(b.name()));
        records
    }

    /// Replace a device's configuration.
    ///
    /// A running schedule keeps its countdown and picks up the new interval
    /// at its next re-arm. A schedule whose new configuration is not runnable
    /// is stopped.
    pub fn update_config(&mut self, name: &str, config: ScheduleConfig) -> Result<()> {
        config.validate()?;
        let record = self
            .registry
            .get_mut(name)
            .ok_or_else(|| Error::not_found("Device", name))?;
        record.config = config;
        let halt = record.runtime.is_scheduled && !record.is_runnable();
        debug!(device = %name, "Schedule configuration updated");
        if halt {
            self.halt(name, StopReason::NotRunnable);
        }
        Ok(())
    }

    /// The configuration every other device ends up with when `source`'s
    /// acquisition and interval settings are copied onto it. Stop policy and
    /// accelerometer range stay per device. Sorted by name.
    pub fn config_copies(&self, source: &str) -> Result<Vec<(String, ScheduleConfig)>> {
        let template = &self
            .registry
            .get(source)
            .ok_or_else(|| Error::not_found("Device", source))?
            .config;
        let mut copies: Vec<(String, ScheduleConfig)> = self
            .registry
            .iter()
            .filter(|record| record.name() != source)
            .map(|record| {
                let mut config = record.config.clone();
                config.collection_duration_secs = template.collection_duration_secs;
                config.interval_value = template.interval_value;
                config.interval_unit = template.interval_unit;
                config.sample_rate = template.sample_rate;
                config.output_location = template.output_location.clone();
                config.upload_enabled = template.upload_enabled;
                (record.name().to_string(), config)
            })
            .collect();
        copies.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(copies)
    }

    /// Store a battery level probed outside a job.
    pub fn record_battery(&mut self, name: &str, battery: f64) -> bool {
        let Some(record) = self.registry.get_mut(name) else {
            return false;
        };
        record.runtime.battery = Some(battery);
        self.publish(SchedulerEvent::BatteryUpdated {
            device: name.to_string(),
            battery,
        });
        true
    }

    // --- scheduling ---

    /// Start a device's schedule. Returns false, changing nothing, when the
    /// device is unknown or has no output location.
    pub fn start_device(&mut self, name: &str, run_immediately: bool) -> bool {
        let Some(record) = self.registry.get_mut(name) else {
            warn!(device = %name, "Cannot start unknown device");
            return false;
        };
        if !record.is_runnable() {
            warn!(device = %name, "Cannot start device without an output location");
            return false;
        }

        record.runtime.is_scheduled = true;
        record.reset_repetitions();
        let in_flight = record.has_job_in_flight();
        record.runtime.status = if in_flight {
            DeviceStatus::Collecting
        } else {
            DeviceStatus::Waiting
        };
        if run_immediately && !in_flight {
            record.runtime.countdown_seconds = 0;
        } else {
            record.reset_countdown();
        }
        info!(
            device = %name,
            interval = record.config.interval_seconds(),
            run_immediately,
            "Schedule started"
        );
        self.publish(SchedulerEvent::ScheduleStarted {
            device: name.to_string(),
        });

        if run_immediately && !in_flight {
            self.request_job(name);
        }
        true
    }

    /// Stop a device's schedule. An in-flight job is not cancelled.
    pub fn stop_device(&mut self, name: &str) -> bool {
        self.halt(name, StopReason::Requested)
    }

    fn halt(&mut self, name: &str, reason: StopReason) -> bool {
        let Some(record) = self.registry.get_mut(name) else {
            return false;
        };
        record.runtime.is_scheduled = false;
        record.runtime.status = DeviceStatus::Idle;
        record.runtime.countdown_seconds = 0;
        info!(device = %name, reason = ?reason, "Schedule stopped");
        self.publish(SchedulerEvent::ScheduleStopped {
            device: name.to_string(),
            reason,
        });
        true
    }

    /// Start every runnable device that is not already scheduled.
    pub fn start_all(&mut self, run_immediately: bool) -> usize {
        let names: Vec<String> = self
            .registry
            .names()
            .into_iter()
            .filter(|name| {
                self.registry
                    .get(name)
                    .is_some_and(|r| r.is_runnable() && !r.runtime.is_scheduled)
            })
            .collect();
        names
            .iter()
            .filter(|name| self.start_device(name, run_immediately))
            .count()
    }

    pub fn stop_all(&mut self) -> usize {
        let names: Vec<String> = self
            .registry
            .iter()
            .filter(|r| r.runtime.is_scheduled)
            .map(|r| r.name().to_string())
            .collect();
        for name in &names {
            self.stop_device(name);
        }
        names.len()
    }

    /// Whether the heartbeat must be running.
    pub fn heartbeat_active(&self) -> bool {
        self.registry.any_scheduled()
    }

    /// One heartbeat: decrement each waiting countdown and request jobs for
    /// those reaching zero.
    pub fn tick(&mut self) {
        let mut due = Vec::new();
        let mut ticks = Vec::new();
        for record in self.registry.iter_mut() {
            if !record.runtime.is_scheduled
                || record.runtime.status != DeviceStatus::Waiting
                || record.has_job_in_flight()
            {
                continue;
            }
            let elapsed = record.tick_countdown();
            ticks.push(SchedulerEvent::CountdownTick {
                device: record.name().to_string(),
                remaining_seconds: record.runtime.countdown_seconds,
            });
            if elapsed {
                due.push(record.name().to_string());
            }
        }
        for event in ticks {
            self.publish(event);
        }
        due.sort();
        for name in due {
            self.request_job(&name);
        }
    }

    /// Ask the runner for a cycle. A busy runner is not a cycle: the
    /// countdown is re-armed and the stop policy is not consulted.
    fn request_job(&mut self, name: &str) {
        let Some(record) = self.registry.get(name) else {
            return;
        };
        if record.has_job_in_flight() {
            debug!(device = %name, "Job already in flight, not requesting another");
            return;
        }
        let Some(output_location) = record.config.output_location.clone() else {
            return;
        };

        let request = CollectionRequest {
            device: name.to_string(),
            address: record.address().to_string(),
            duration_secs: record.config.collection_duration_secs,
            output_location,
            upload_enabled: record.config.upload_enabled,
            sample_rate: Some(record.config.sample_rate),
        };

        // A job left over from a forgotten record still holds the device.
        if self.launcher.is_busy(name) {
            self.reject_job(name);
            return;
        }
        match self.launcher.launch(request) {
            Some(job_id) => self.on_job_started(name, job_id),
            None => self.reject_job(name),
        }
    }

    fn reject_job(&mut self, name: &str) {
        if let Some(record) = self.registry.get_mut(name) {
            record.runtime.status = DeviceStatus::Waiting;
            record.reset_countdown();
        }
        warn!(device = %name, "Collection rejected, device busy");
        self.publish(SchedulerEvent::JobRejected {
            device: name.to_string(),
        });
    }

    /// Record an accepted job.
    pub fn on_job_started(&mut self, name: &str, job_id: JobId) {
        let Some(record) = self.registry.get_mut(name) else {
            return;
        };
        record.runtime.active_job = Some(job_id);
        record.runtime.status = DeviceStatus::Collecting;
        record.runtime.progress_percent = 0;
        self.publish(SchedulerEvent::JobStarted {
            device: name.to_string(),
            job_id,
        });
    }

    /// Request cancellation of a device's in-flight job.
    pub fn cancel_job(&self, name: &str) -> bool {
        self.launcher.cancel(name)
    }

    // --- job events ---

    /// Apply one event from the job runner.
    pub fn handle_job_event(&mut self, event: CollectorEvent) {
        match event {
            CollectorEvent::Stage {
                job_id,
                device,
                stage,
                message,
            } => self.on_stage(job_id, device, stage, message),
            CollectorEvent::Progress {
                job_id,
                device,
                downloaded,
                total,
            } => self.on_progress(job_id, device, downloaded, total),
            CollectorEvent::UploadFailed {
                job_id,
                device,
                error,
            } => {
                warn!(device = %device, error = %error, "Upload failed");
                self.publish(SchedulerEvent::UploadFailed {
                    device,
                    job_id,
                    error,
                });
            }
            CollectorEvent::Completed { result } => self.on_job_completed(result),
        }
    }

    /// The record the job belongs to, if it still exists and the job is its
    /// current one.
    fn owning_record(&mut self, device: &str, job_id: JobId) -> Option<&mut DeviceRecord> {
        self.registry
            .get_mut(device)
            .filter(|record| record.runtime.active_job == Some(job_id))
    }

    fn on_stage(&mut self, job_id: JobId, device: String, stage: CollectionStage, message: String) {
        if let Some(status) = stage.device_status()
            && let Some(record) = self.owning_record(&device, job_id)
        {
            record.runtime.status = status;
        }
        self.publish(SchedulerEvent::StageChanged {
            device,
            job_id,
            stage,
            message,
        });
    }

    fn on_progress(&mut self, job_id: JobId, device: String, downloaded: u64, total: u64) {
        let percent = progress_percent(downloaded, total);
        if let Some(record) = self.owning_record(&device, job_id) {
            record.runtime.progress_percent = percent;
        }
        self.publish(SchedulerEvent::Progress {
            device,
            job_id,
            downloaded,
            total,
            percent,
        });
    }

    /// Reconcile a finished job: update stats, then consume exactly one
    /// cycle against the stop policy and either re-arm or halt.
    pub fn on_job_completed(&mut self, result: CollectionResult) {
        let name = result.device.clone();
        let Some(record) = self.owning_record(&name, result.job_id) else {
            debug!(device = %name, job_id = %result.job_id, "Completion for a job no record owns");
            self.publish(SchedulerEvent::JobCompleted { result });
            return;
        };

        record.runtime.active_job = None;
        record.apply_result(&result);

        let decision = if record.runtime.is_scheduled {
            Some(record.commit_cycle_outcome(Utc::now()))
        } else {
            record.runtime.status = DeviceStatus::Idle;
            None
        };
        if decision == Some(CycleDecision::Rearm) {
            record.runtime.status = DeviceStatus::Waiting;
            record.reset_countdown();
        }

        self.publish(SchedulerEvent::JobCompleted { result });
        if decision == Some(CycleDecision::Stop) {
            self.halt(&name, StopReason::PolicyComplete);
        }
    }
}
