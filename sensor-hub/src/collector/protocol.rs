//! Device protocol adapter for the job runner.
//!
//! Jobs talk to devices only through [`DeviceProtocol`], so the runner can be
//! driven by the real HTTP client or by an in-process fake.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sensor_client::{
    ClientError, HttpClients, SampleRate, SensorClient, StatusReport, UploadReport,
};

/// Remote operations a collection job needs from a device.
#[async_trait]
pub trait DeviceProtocol: Send + Sync + 'static {
    /// Probe liveness and battery.
    async fn probe_status(&self, address: &str) -> Result<StatusReport, ProtocolError>;

    /// Apply the acquisition rate before collecting. Callers treat failure as non-fatal.
    async fn apply_sample_rate(&self, address: &str, rate: SampleRate)
    -> Result<(), ProtocolError>;

    /// Start a collection of `duration_secs` and stream the file into `destination`.
    ///
    /// `on_progress(downloaded, total)` is invoked per received chunk; `total`
    /// is 0 when unknown.
    async fn collect_and_download(
        &self,
        address: &str,
        duration_secs: u32,
        destination: &Path,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<PathBuf, ProtocolError>;

    /// Ask the device to push its last collection to cloud storage.
    async fn trigger_upload(&self, address: &str) -> Result<UploadReport, ProtocolError>;

    /// Flash the identification LED.
    async fn identify_blink(&self, address: &str) -> Result<(), ProtocolError>;
}

/// Error type for protocol operations.
#[derive(Debug, Clone)]
pub struct ProtocolError {
    /// Error message.
    pub message: String,
    /// Whether the device was unreachable (connect failure or timeout).
    pub connectivity: bool,
}

impl ProtocolError {
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            connectivity: true,
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            connectivity: false,
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ProtocolError {}

impl From<ClientError> for ProtocolError {
    fn from(err: ClientError) -> Self {
        Self {
            connectivity: err.is_connectivity(),
            message: err.to_string(),
        }
    }
}

/// [`DeviceProtocol`] over the sensor HTTP API, sharing connection pools
/// across devices.
#[derive(Debug, Clone)]
pub struct HttpDeviceProtocol {
    http: HttpClients,
}

impl HttpDeviceProtocol {
    pub fn new() -> crate::Result<Self> {
        Ok(Self {
            http: HttpClients::new()?,
        })
    }

    fn client(&self, address: &str) -> Result<SensorClient, ProtocolError> {
        SensorClient::with_clients(self.http.clone(), address).map_err(ProtocolError::from)
    }
}

#[async_trait]
impl DeviceProtocol for HttpDeviceProtocol {
    async fn probe_status(&self, address: &str) -> Result<StatusReport, ProtocolError> {
        Ok(self.client(address)?.status().await?)
    }

    async fn apply_sample_rate(
        &self,
        address: &str,
        rate: SampleRate,
    ) -> Result<(), ProtocolError> {
        Ok(self.client(address)?.set_sample_rate(rate).await?)
    }

    async fn collect_and_download(
        &self,
        address: &str,
        duration_secs: u32,
        destination: &Path,
        on_progress: &(dyn Fn(u64, u64) + Send + Sync),
    ) -> Result<PathBuf, ProtocolError> {
        let client = self.client(address)?;
        let path = client
            .collect_to_dir(duration_secs, destination, |downloaded, total| {
                on_progress(downloaded, total)
            })
            .await?;
        Ok(path)
    }

    async fn trigger_upload(&self, address: &str) -> Result<UploadReport, ProtocolError> {
        Ok(self.client(address)?.upload().await?)
    }

    async fn identify_blink(&self, address: &str) -> Result<(), ProtocolError> {
        Ok(self.client(address)?.blink().await?)
    }
}
