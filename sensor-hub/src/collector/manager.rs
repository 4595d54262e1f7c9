//! Collector: runs collection jobs with at most one job per device.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::events::{self, CollectorEvent, CollectorEventReceiver, CollectorEventSender};
use super::job::{CollectionJob, CollectionRequest};
use super::protocol::DeviceProtocol;
use crate::domain::JobId;

// A panicking job is reported as a failed result, which needs unwinding.
#[cfg(panic = "abort")]
compile_error!("sensor-hub must be built with panic = \"unwind\"");

/// Launches and cancels collection jobs on behalf of the scheduler.
pub trait JobLauncher: Send + Sync + 'static {
    /// Start a job unless one is already running for the device.
    ///
    /// Returns the new job id, or `None` when the device is busy. Check and
    /// insert happen atomically.
    fn launch(&self, request: CollectionRequest) -> Option<JobId>;

    /// Request cancellation of the device's in-flight job.
    fn cancel(&self, device: &str) -> bool;

    /// Request cancellation of every in-flight job. Returns how many were signalled.
    fn cancel_all(&self) -> usize;

    fn is_busy(&self, device: &str) -> bool;
}

/// Bookkeeping for an in-flight job.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Job runner. Jobs execute on their own tasks and report through the
/// channel returned by [`Collector::new`].
pub struct Collector<P: ?Sized> {
    protocol: Arc<P>,
    /// Device name -> in-flight job.
    active_jobs: Arc<DashMap<String, ActiveJob>>,
    event_tx: CollectorEventSender,
}

impl<P: DeviceProtocol + ?Sized> Collector<P> {
    pub fn new(protocol: Arc<P>) -> (Self, CollectorEventReceiver) {
        let (event_tx, event_rx) = events::channel();
        let collector = Self {
            protocol,
            active_jobs: Arc::new(DashMap::new()),
            event_tx,
        };
        (collector, event_rx)
    }

    /// Start a collection. Returns false if the device already has a job.
    pub fn start_collection(&self, request: CollectionRequest) -> bool {
        self.launch(request).is_some()
    }

    pub fn launch(&self, request: CollectionRequest) -> Option<JobId> {
        let cancel = CancellationToken::new();
        let job = CollectionJob::new(request, cancel.clone(), self.event_tx.clone());
        let job_id = job.id;

        match self.active_jobs.entry(job.request.device.clone()) {
            Entry::Occupied(entry) => {
                debug!(
                    device = %entry.key(),
                    active_job = %entry.get().job_id,
                    "Collection already in progress"
                );
                return None;
            }
            Entry::Vacant(entry) => {
                entry.insert(ActiveJob {
                    job_id,
                    started_at: job.started_at,
                    cancel,
                });
            }
        }

        info!(
            device = %job.request.device,
            job_id = %job_id,
            duration = job.request.duration_secs,
            "Starting collection"
        );

        let protocol = Arc::clone(&self.protocol);
        let active_jobs = Arc::clone(&self.active_jobs);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(job.run(&*protocol)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    error!(device = %job.request.device, job_id = %job.id, "Collection job panicked");
                    job.abort("collection job panicked")
                }
            };

            // remove the job just before the event so a launch triggered by
            // the completion never sees a stale entry
            active_jobs.remove_if(&job.request.device, |_, active| active.job_id == job.id);
            let _ = event_tx.send(CollectorEvent::Completed { result });
        });

        Some(job_id)
    }

    pub fn is_busy(&self, device: &str) -> bool {
        self.active_jobs.contains_key(device)
    }

    pub fn active_count(&self) -> usize {
        self.active_jobs.len()
    }

    pub fn active_job(&self, device: &str) -> Option<ActiveJob> {
        self.active_jobs.get(device).map(|entry| entry.value().clone())
    }

    /// Signal cancellation. The job stays registered until it reaches its
    /// next checkpoint and completes.
    pub fn cancel(&self, device: &str) -> bool {
        match self.active_jobs.get(device) {
            Some(active) => {
                info!(device = %device, job_id = %active.job_id, "Cancelling collection");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.active_jobs.iter() {
            entry.value().cancel.cancel();
            count += 1;
        }
        if count > 0 {
            info!(count, "Cancelling all collections");
        }
        count
    }
}

impl<P: DeviceProtocol + ?Sized> JobLauncher for Collector<P> {
    fn launch(&self, request: CollectionRequest) -> Option<JobId> {
        Collector::launch(self, request)
    }

    fn cancel(&self, device: &str) -> bool {
        Collector::cancel(self, device)
    }

    fn cancel_all(&self) -> usize {
        Collector::cancel_all(self)
    }

    fn is_busy(&self, device: &str) -> bool {
        Collector::is_busy(self, device)
    }
}
