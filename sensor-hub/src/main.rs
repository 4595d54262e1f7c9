use std::sync::Arc;

use sensor_hub::collector::HttpDeviceProtocol;
use sensor_hub::config::{AppConfig, JsonSettingsStore};
use sensor_hub::discovery::{ManualResolver, StaticDiscovery};
use sensor_hub::domain::{CollectionStage, format_countdown};
use sensor_hub::logging;
use sensor_hub::scheduler::{SchedulerEvent, SchedulerService};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = AppConfig::from_env()?;

    let (logging_config, _guard) = logging::init_logging(&config.log_dir)?;
    let shutdown = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown.child_token());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        settings = %config.settings_path.display(),
        logs = %logging_config.log_dir().display(),
        "sensor-hub starting"
    );

    let protocol = Arc::new(HttpDeviceProtocol::new()?);
    let settings = Arc::new(
        JsonSettingsStore::open(&config.settings_path)?.with_output_root(config.output_dir.clone()),
    );

    let (service, handle, collector) =
        SchedulerService::with_protocol(protocol.clone(), shutdown.child_token());
    let mut service_task = service.with_settings(settings).spawn();
    let event_task = spawn_event_log(handle.subscribe());

    StaticDiscovery::new(config.devices.clone())
        .announce(&handle)
        .await;
    ManualResolver::new(protocol)
        .announce_all(&config.manual, &handle)
        .await;

    if config.auto_start {
        let started = handle.start_all(config.run_immediately).await?;
        info!(
            started,
            run_immediately = config.run_immediately,
            "Started configured schedules"
        );
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
        }
        result = &mut service_task => {
            result?;
            warn!("Scheduler service exited unexpectedly");
        }
    }

    if handle.is_running() {
        let stopped = handle.stop_all().await?;
        let cancelled = collector.cancel_all();
        info!(stopped, cancelled, "Stopped schedules");
        handle.shutdown().await?;
    }
    shutdown.cancel();
    if !service_task.is_finished() {
        service_task.await?;
    }
    event_task.abort();

    info!("sensor-hub stopped");
    Ok(())
}

/// Render scheduler events as log lines.
fn spawn_event_log(mut events: broadcast::Receiver<SchedulerEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    trace!(kind = event.kind(), device = %event.device(), "Scheduler event");
                    log_event(&event);
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event log lagging behind"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::DeviceAdded { device, address } => {
            info!(device = %device, address = %address, "Device added")
        }
        SchedulerEvent::DeviceRemoved { device } => info!(device = %device, "Device removed"),
        SchedulerEvent::BatteryUpdated { device, battery } => {
            info!(device = %device, battery = *battery, "Battery level")
        }
        SchedulerEvent::ScheduleStarted { device } => {
            info!(device = %device, "Schedule started")
        }
        SchedulerEvent::ScheduleStopped { device, reason } => {
            info!(device = %device, reason = ?reason, "Schedule stopped")
        }
        SchedulerEvent::CountdownTick {
            device,
            remaining_seconds,
        } => trace!(
            device = %device,
            next_in = %format_countdown(*remaining_seconds),
            "Countdown"
        ),
        SchedulerEvent::JobStarted { device, job_id } => {
            info!(device = %device, job_id = %job_id, "Collection started")
        }
        SchedulerEvent::StageChanged {
            device,
            stage,
            message,
            ..
        } => {
            if *stage == CollectionStage::Error {
                warn!(device = %device, stage = %stage, "{message}")
            } else {
                info!(device = %device, stage = %stage, "{message}")
            }
        }
        SchedulerEvent::Progress {
            device,
            downloaded,
            total,
            percent,
            ..
        } => debug!(device = %device, downloaded, total, percent, "Download progress"),
        SchedulerEvent::UploadFailed { device, error, .. } => {
            warn!(device = %device, error = %error, "Upload failed")
        }
        SchedulerEvent::JobRejected { device } => {
            warn!(device = %device, "Collection skipped, previous job still running")
        }
        SchedulerEvent::JobCompleted { result } => {
            if result.success {
                info!(
                    device = %result.device,
                    file = ?result.saved_file_path,
                    bytes = result.saved_file_size,
                    upload = ?result.upload_status,
                    elapsed = %format!("{:.1}s", result.elapsed_seconds),
                    "Collection finished"
                )
            } else {
                error!(
                    device = %result.device,
                    error = ?result.error_message,
                    elapsed = %format!("{:.1}s", result.elapsed_seconds),
                    "Collection failed"
                )
            }
        }
    }
}
