//! Client for the EVBS sensor HTTP API.
//!
//! Covers the control endpoints (status, settings, blink, duration, sample
//! rate) and the data server that runs a collection and streams it back.

pub mod client;
pub mod error;
pub mod types;

pub use client::{
    HttpClients, SensorClient, StreamTimeouts, build_http_client, collect_timeout,
    install_rustls_provider,
};
pub use error::{ClientError, Result};
pub use types::{AccelRange, SampleRate, SensorSettings, StatusReport, UploadReport};
