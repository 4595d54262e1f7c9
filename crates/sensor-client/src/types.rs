//! Wire types exchanged with the sensor firmware.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output data rate supported by the sensor's IMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    #[serde(rename = "12.5")]
    Hz12_5,
    #[serde(rename = "26")]
    Hz26,
    #[serde(rename = "52")]
    Hz52,
    #[default]
    #[serde(rename = "104")]
    Hz104,
    #[serde(rename = "208")]
    Hz208,
    #[serde(rename = "416")]
    Hz416,
    #[serde(rename = "833")]
    Hz833,
    #[serde(rename = "1666")]
    Hz1666,
    #[serde(rename = "3333")]
    Hz3333,
    #[serde(rename = "6666")]
    Hz6666,
}

impl SampleRate {
    pub const ALL: [SampleRate; 10] = [
        SampleRate::Hz12_5,
        SampleRate::Hz26,
        SampleRate::Hz52,
        SampleRate::Hz104,
        SampleRate::Hz208,
        SampleRate::Hz416,
        SampleRate::Hz833,
        SampleRate::Hz1666,
        SampleRate::Hz3333,
        SampleRate::Hz6666,
    ];

    pub fn hz(self) -> f64 {
        match self {
            SampleRate::Hz12_5 => 12.5,
            SampleRate::Hz26 => 26.0,
            SampleRate::Hz52 => 52.0,
            SampleRate::Hz104 => 104.0,
            SampleRate::Hz208 => 208.0,
            SampleRate::Hz416 => 416.0,
            SampleRate::Hz833 => 833.0,
            SampleRate::Hz1666 => 1666.0,
            SampleRate::Hz3333 => 3333.0,
            SampleRate::Hz6666 => 6666.0,
        }
    }

    /// Map a numeric rate onto a supported value, falling back to 104 Hz.
    pub fn from_hz(value: f64) -> Self {
        Self::ALL
            .into_iter()
            .find(|rate| rate.hz() == value)
            .unwrap_or_default()
    }

    /// Value as sent in query strings (`12.5`, `104`, ...).
    pub fn query_value(self) -> String {
        match self {
            SampleRate::Hz12_5 => "12.5".to_string(),
            other => format!("{}", other.hz() as u32),
        }
    }
}

impl fmt::Display for SampleRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Hz", self.query_value())
    }
}

/// Accelerometer full-scale range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AccelRange {
    #[serde(rename = "2")]
    G2,
    #[default]
    #[serde(rename = "4")]
    G4,
    #[serde(rename = "8")]
    G8,
    #[serde(rename = "16")]
    G16,
}

impl AccelRange {
    pub fn g(self) -> u8 {
        match self {
            AccelRange::G2 => 2,
            AccelRange::G4 => 4,
            AccelRange::G8 => 8,
            AccelRange::G16 => 16,
        }
    }
}

impl fmt::Display for AccelRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "±{}g", self.g())
    }
}

/// Response of `GET /status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(rename = "Battery SOC", default)]
    pub battery_soc: Option<f64>,
    #[serde(rename = "Device ID", default)]
    pub device_id: Option<String>,
    /// Remaining fields (WiFi, firmware version, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Subset of `GET /settings` that the firmware documents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorSettings {
    #[serde(default)]
    pub odr: Option<Value>,
    #[serde(default)]
    pub gravity_comp: Option<Value>,
    #[serde(default)]
    pub accel_range: Option<Value>,
    #[serde(default)]
    pub gyro_range: Option<Value>,
    #[serde(default)]
    pub duration: Option<Value>,
    #[serde(default)]
    pub accel: Option<Value>,
    #[serde(default)]
    pub gyro: Option<Value>,
}

/// Response of the data server's `GET /upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadReport {
    #[serde(default = "unknown_status")]
    pub status: String,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

fn unknown_status() -> String {
    "Unknown".to_string()
}
