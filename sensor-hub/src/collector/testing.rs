//! In-process device used by the collector and scheduler tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use sensor_client::{SampleRate, StatusReport, UploadReport};
use tokio::sync::Semaphore;

use super::events::{CollectorEvent, CollectorEventReceiver};
use super::job::CollectionRequest;
use super::protocol::{DeviceProtocol, ProtocolError};
use crate::domain::CollectionResult;

#[derive(Default)]
struct Behaviour {
    fail_status: bool,
    fail_collect: Option<String>,
    fail_upload: Option<String>,
    panic_on_collect: bool,
    device_id: Option<String>,
}

#[derive(Default)]
pub struct FakeProtocol {
    behaviour: Mutex<Behaviour>,
    status_gate: Option<Arc<Semaphore>>,
    collect_gate: Option<Arc<Semaphore>>,
    collect_calls: AtomicUsize,
    upload_calls: AtomicUsize,
    blink_calls: AtomicUsize,
    rates: Mutex<Vec<SampleRate>>,
}

impl FakeProtocol {
    pub const PAYLOAD: &'static [u8] = &[b'x'; 1024];

    pub fn new() -> Self {
        Self::default()
    }

    /// Block status probes until [`FakeProtocol::release_status`].
    pub fn with_status_gate(mut self) -> Self {
        self.status_gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Block collections until [`FakeProtocol::release_collect`].
    pub fn with_collect_gate(mut self) -> Self {
        self.collect_gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    pub fn release_status(&self, n: usize) {
        if let Some(gate) = &self.status_gate {
            gate.add_permits(n);
        }
    }

    pub fn release_collect(&self, n: usize) {
        if let Some(gate) = &self.collect_gate {
            gate.add_permits(n);
        }
    }

    pub fn fail_status(&self) {
        self.behaviour.lock().fail_status = true;
    }

    pub fn fail_collect(&self, message: &str) {
        self.behaviour.lock().fail_collect = Some(message.to_string());
    }

    pub fn fail_upload(&self, message: &str) {
        self.behaviour.lock().fail_upload = Some(message.to_string());
    }

    pub fn report_device_id(&self, device_id: &str) {
        self.behaviour.lock().device_id = Some(device_id.to_string());
    }

    pub fn panic_on_collect(&self) {
        self.behaviour.lock().panic_on_collect = true;
    }

    pub fn collect_calls(&self) -> usize {
        self.collect_calls.load(Ordering::SeqCst)
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub fn blink_calls(&self) -> usize {
        self.blink_calls.load(Ordering::SeqCst)
    }

    pub fn applied_rates(&self) -> Vec<SampleRate> {
        self.rates.lock().clone()
    }
}

async fn pass(gate: &Option<Arc<Semaphore>>) {
    if let Some(gate) = gate {
        gate.acquire().await.unwrap().forget();
    }
}

#[async_trait]
impl DeviceProtocol for FakeProtocol {
    async fn probe_status(&self, _address: &str) -> Result<StatusReport, ProtocolError> {
        pass(&self.status_gate).await;
        let behaviour = self.behaviour.lock();
        if behaviour.fail_status {
            return Err(ProtocolError::connectivity("status timed out"));
        }
        Ok(StatusReport {
            battery_soc: Some(87.0),
            device_id: behaviour.device_id.clone(),
            ..Default::default()
        })
    }

    async fn apply_sample_rate(
        &self,
        _address: &str,
        rate: SampleRate,
    ) -> Result<(), ProtocolError> {
        self.rates.lock().push(rate);
        Ok(())
    }

    async fn collect_and_download(
        &self,
        address: &str,
        _duration_secs: u32,
        destination: &Path,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<PathBuf, ProtocolError> {
        let call = self.collect_calls.fetch_add(1, Ordering::SeqCst);
        pass(&self.collect_gate).await;

        let (fail, panic) = {
            let behaviour = self.behaviour.lock();
            (behaviour.fail_collect.clone(), behaviour.panic_on_collect)
        };
        if panic {
            panic!("device exploded");
        }
        if let Some(message) = fail {
            return Err(ProtocolError::connectivity(message));
        }

        let total = Self::PAYLOAD.len() as u64;
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|e| ProtocolError::remote(e.to_string()))?;
        let path = destination.join(format!("{address}_{call}.csv"));
        tokio::fs::write(&path, Self::PAYLOAD)
            .await
            .map_err(|e| ProtocolError::remote(e.to_string()))?;
        on_progress(total / 2, total);
        on_progress(total, total);
        Ok(path)
    }

    async fn trigger_upload(&self, _address: &str) -> Result<UploadReport, ProtocolError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.behaviour.lock().fail_upload.clone() {
            return Err(ProtocolError::connectivity(message));
        }
        Ok(UploadReport {
            status: "Upload successful".to_string(),
            extra: Default::default(),
        })
    }

    async fn identify_blink(&self, _address: &str) -> Result<(), ProtocolError> {
        self.blink_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn request(device: &str, dir: &Path) -> CollectionRequest {
    CollectionRequest {
        device: device.to_string(),
        address: format!("{}.local", device.to_lowercase()),
        duration_secs: 10,
        output_location: dir.to_path_buf(),
        upload_enabled: true,
        sample_rate: None,
    }
}

/// Drain events until the next completion.
pub async fn wait_for_completion(
    rx: &mut CollectorEventReceiver,
) -> (Vec<CollectorEvent>, CollectionResult) {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        if let CollectorEvent::Completed { result } = event {
            return (events, result);
        }
        events.push(event);
    }
    panic!("collector event channel closed");
}
