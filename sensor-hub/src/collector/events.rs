//! Notifications published by running jobs.
//!
//! Jobs run on worker tasks and never touch device state. Everything they
//! report travels as a [`CollectorEvent`] over an mpsc channel whose single
//! consumer is the scheduler service.

use tokio::sync::mpsc;

use crate::domain::{CollectionResult, CollectionStage, JobId};

/// Event emitted by a collection job.
#[derive(Debug, Clone)]
pub enum CollectorEvent {
    /// The job entered a stage (or reports a message within it).
    Stage {
        job_id: JobId,
        device: String,
        stage: CollectionStage,
        message: String,
    },
    /// Bytes received so far; `total` is 0 when unknown.
    Progress {
        job_id: JobId,
        device: String,
        downloaded: u64,
        total: u64,
    },
    /// Remote upload failed. Does not fail the job.
    UploadFailed {
        job_id: JobId,
        device: String,
        error: String,
    },
    /// Terminal result. Sent exactly once per job.
    Completed { result: CollectionResult },
}

/// Sending side of the job event channel.
pub type CollectorEventSender = mpsc::UnboundedSender<CollectorEvent>;

/// Receiving side of the job event channel.
pub type CollectorEventReceiver = mpsc::UnboundedReceiver<CollectorEvent>;

/// Create the job event channel.
///
/// Unbounded so that a slow consumer can never make a job drop its
/// completion event.
pub fn channel() -> (CollectorEventSender, CollectorEventReceiver) {
    mpsc::unbounded_channel()
}
