//! Unattended periodic data collection from a fleet of EVBS sensors.
//!
//! Devices arrive through [`discovery`], are scheduled by the
//! [`scheduler`] and collected from by the [`collector`].

pub mod collector;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod utils;

pub use error::{Error, Result};
