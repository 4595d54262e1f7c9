//! HTTP client for a single sensor.
//!
//! The firmware serves two listeners: the control API on port 80 and a data
//! server on port 8000 that runs a collection and streams the resulting CSV.

use std::path::{Path, PathBuf};
use std::sync::{LazyLock, OnceLock};
use std::time::Duration;

use chrono::Local;
use futures::StreamExt;
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, HeaderMap};
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use crate::error::{ClientError, Result};
use crate::types::{SampleRate, SensorSettings, StatusReport, UploadReport};

/// Port of the firmware's data server.
pub const DATA_PORT: u16 = 8000;

/// Connect timeout for the control API.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect timeout for the data server, which may be busy finishing a transfer.
pub const DATA_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Request timeout for control endpoints (status, settings, blink...).
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Request timeout for the remote upload trigger.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Floor for the collect+download timeout.
const COLLECT_TIMEOUT_FLOOR_SECS: u64 = 120;

/// Slack added on top of the collection duration before the stream starts.
const COLLECT_TIMEOUT_SLACK_SECS: u64 = 90;

static FILENAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"filename="?([^";\n]+)"?"#).expect("valid filename regex"));

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build an HTTP client with the given connect timeout.
pub fn build_http_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    install_rustls_provider();
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .no_proxy()
        .build()
        .map_err(ClientError::from)
}

/// Connection pools shared by every sensor: one per firmware listener.
#[derive(Debug, Clone)]
pub struct HttpClients {
    pub control: reqwest::Client,
    pub data: reqwest::Client,
}

impl HttpClients {
    pub fn new() -> Result<Self> {
        Ok(Self {
            control: build_http_client(CONNECT_TIMEOUT)?,
            data: build_http_client(DATA_CONNECT_TIMEOUT)?,
        })
    }
}

/// Timeout for a collection of `duration_secs`: the device collects first,
/// then streams, so the budget scales with the duration.
pub fn collect_timeout(duration_secs: u32) -> Duration {
    let secs = COLLECT_TIMEOUT_FLOOR_SECS.max(u64::from(duration_secs) + COLLECT_TIMEOUT_SLACK_SECS);
    Duration::from_secs(secs)
}

/// Time limits for a streamed download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTimeouts {
    /// Until the response headers arrive.
    pub response: Duration,
    /// Longest silence between two body chunks. The transfer as a whole is
    /// unbounded while data keeps arriving.
    pub idle: Duration,
}

impl StreamTimeouts {
    pub fn for_duration(duration_secs: u32) -> Self {
        let timeout = collect_timeout(duration_secs);
        Self {
            response: timeout,
            idle: timeout,
        }
    }
}

/// Extract the filename from a `Content-Disposition` header value.
pub fn filename_from_disposition(value: &str) -> Option<String> {
    if !value.contains("filename=") {
        return None;
    }
    FILENAME_RE
        .captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        // never let the device choose a path outside the output directory
        .and_then(|name| {
            Path::new(&name)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .filter(|name| !name.is_empty())
}

/// Fallback name when the device does not send one.
pub fn default_filename() -> String {
    format!("sensor_data_{}.csv", Local::now().format("%Y-%m-%d_%H-%M-%S"))
}

/// Client bound to one sensor address.
#[derive(Debug, Clone)]
pub struct SensorClient {
    http: HttpClients,
    address: String,
    base_url: String,
    data_url: String,
}

impl SensorClient {
    /// Create a client with its own connection pools.
    pub fn new(address: &str) -> Result<Self> {
        Self::with_clients(HttpClients::new()?, address)
    }

    /// Create a client that shares existing connection pools.
    pub fn with_clients(http: HttpClients, address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() || address.contains('/') || address.contains(' ') {
            return Err(ClientError::InvalidAddress(address.to_string()));
        }
        Ok(Self {
            http,
            address: address.to_string(),
            base_url: format!("http://{address}"),
            data_url: format!("http://{address}:{DATA_PORT}"),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn data_url(&self) -> &str {
        &self.data_url
    }

    /// `GET` a control endpoint and decode its JSON body.
    async fn control_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = format!("{}/{endpoint}", self.base_url);
        get_json(&self.http.control, &url, CONTROL_TIMEOUT).await
    }

    /// Device status: battery, WiFi, firmware version.
    pub async fn status(&self) -> Result<StatusReport> {
        self.control_json("status").await
    }

    /// Current acquisition settings.
    pub async fn settings(&self) -> Result<SensorSettings> {
        self.control_json("settings").await
    }

    /// Information about the last saved collection.
    pub async fn file_info(&self) -> Result<serde_json::Value> {
        self.control_json("file_info").await
    }

    /// Progress of the running collection or transfer.
    pub async fn progress(&self) -> Result<serde_json::Value> {
        self.control_json("progress").await
    }

    /// Flash the identification LED.
    pub async fn blink(&self) -> Result<()> {
        self.http
            .control
            .get(format!("{}/blink", self.base_url))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Stop the running collection or transfer.
    pub async fn stop(&self) -> Result<serde_json::Value> {
        self.control_json("stop").await
    }

    pub async fn set_duration(&self, duration_secs: u32) -> Result<serde_json::Value> {
        let url = format!("{}/duration?value={duration_secs}", self.base_url);
        let response = self
            .http
            .control
            .post(url)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn set_sample_rate(&self, rate: SampleRate) -> Result<()> {
        let url = format!("{}/odr?value={}", self.base_url, rate.query_value());
        self.http
            .control
            .post(url)
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Run a collection of `duration_secs` and stream the CSV into `output_dir`.
    ///
    /// `on_progress(downloaded, total)` is called for every received chunk;
    /// `total` is 0 when the device does not announce a length. A partially
    /// written file is removed when the transfer fails.
    pub async fn collect_to_dir<F>(
        &self,
        duration_secs: u32,
        output_dir: &Path,
        on_progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(u64, u64),
    {
        let url = format!(
            "{}/start?duration={duration_secs}&format=csv",
            self.data_url
        );
        debug!(url = %url, "Starting collection");
        self.stream_to_dir(
            &url,
            output_dir,
            StreamTimeouts::for_duration(duration_secs),
            on_progress,
        )
        .await
    }

    async fn stream_to_dir<F>(
        &self,
        url: &str,
        output_dir: &Path,
        timeouts: StreamTimeouts,
        mut on_progress: F,
    ) -> Result<PathBuf>
    where
        F: FnMut(u64, u64),
    {
        let response = tokio::time::timeout(timeouts.response, self.http.data.get(url).send())
            .await
            .map_err(|_| {
                ClientError::Timeout(format!("no response within {:?}", timeouts.response))
            })??
            .error_for_status()?;

        let total = response.content_length().unwrap_or(0);
        let filename = filename_from_headers(response.headers()).unwrap_or_else(default_filename);
        let output_path = output_dir.join(filename);

        tokio::fs::create_dir_all(output_dir).await?;
        let mut file = tokio::fs::File::create(&output_path).await?;

        match write_body(response, &mut file, timeouts.idle, total, &mut on_progress).await {
            Ok(downloaded) => {
                debug!(path = %output_path.display(), bytes = downloaded, "Collection saved");
                Ok(output_path)
            }
            Err(e) => {
                drop(file);
                if let Err(remove_err) = tokio::fs::remove_file(&output_path).await {
                    debug!(
                        path = %output_path.display(),
                        error = %remove_err,
                        "Failed to remove partial download"
                    );
                }
                Err(e)
            }
        }
    }

    /// Ask the device to push its last collection to cloud storage.
    pub async fn upload(&self) -> Result<UploadReport> {
        let url = format!("{}/upload", self.data_url);
        get_json(&self.http.data, &url, UPLOAD_TIMEOUT).await
    }
}

async fn get_json<T: DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<T> {
    trace!(url = %url, "GET");
    let response = http
        .get(url)
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.json::<T>().await?)
}

/// Copy the body into `file`, failing when no chunk arrives within `idle`.
async fn write_body<F>(
    response: reqwest::Response,
    file: &mut tokio::fs::File,
    idle: Duration,
    total: u64,
    on_progress: &mut F,
) -> Result<u64>
where
    F: FnMut(u64, u64),
{
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    loop {
        let next = tokio::time::timeout(idle, stream.next())
            .await
            .map_err(|_| ClientError::Timeout(format!("no data received for {idle:?}")))?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        on_progress(downloaded, total);
    }
    file.flush().await?;
    Ok(downloaded)
}

fn filename_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition)
}
