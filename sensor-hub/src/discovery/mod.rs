//! Device discovery adapters.
//!
//! Discovery resolves device identities and reports their arrival and
//! departure to a [`DiscoverySink`]; the scheduler handle is the sink used by
//! the daemon.

pub mod resolver;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::Result;
use crate::domain::DeviceIdentity;

pub use resolver::{ManualEntry, ManualResolver};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Found { name: String, address: String },
    Lost { name: String },
}

/// Receiver of discovery notifications.
#[async_trait]
pub trait DiscoverySink: Send + Sync {
    async fn device_found(&self, name: &str, address: &str) -> Result<()>;

    async fn device_lost(&self, name: &str) -> Result<()>;

    async fn apply(&self, event: DiscoveryEvent) -> Result<()> {
        match event {
            DiscoveryEvent::Found { name, address } => self.device_found(&name, &address).await,
            DiscoveryEvent::Lost { name } => self.device_lost(&name).await,
        }
    }
}

/// A fixed device list announced once.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    devices: Vec<DeviceIdentity>,
}

impl StaticDiscovery {
    pub fn new(devices: Vec<DeviceIdentity>) -> Self {
        Self { devices }
    }

    pub fn events(&self) -> impl Iterator<Item = DiscoveryEvent> + '_ {
        self.devices.iter().map(|device| DiscoveryEvent::Found {
            name: device.name.clone(),
            address: device.address.clone(),
        })
    }

    /// Announce every device. Returns how many the sink accepted.
    pub async fn announce(&self, sink: &dyn DiscoverySink) -> usize {
        let mut announced = 0;
        for event in self.events() {
            match sink.apply(event.clone()).await {
                Ok(()) => announced += 1,
                Err(e) => warn!(event = ?event, error = %e, "Failed to announce device"),
            }
        }
        if announced > 0 {
            info!(count = announced, "Announced configured devices");
        }
        announced
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub events: Mutex<Vec<DiscoveryEvent>>,
    }

    #[async_trait]
    impl DiscoverySink for RecordingSink {
        async fn device_found(&self, name: &str, address: &str) -> Result<()> {
            self.events.lock().push(DiscoveryEvent::Found {
                name: name.to_string(),
                address: address.to_string(),
            });
            Ok(())
        }

        async fn device_lost(&self, name: &str) -> Result<()> {
            self.events.lock().push(DiscoveryEvent::Lost {
                name: name.to_string(),
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_static_discovery_announces_all() {
        let discovery = StaticDiscovery::new(vec![
            DeviceIdentity::new("EVBS_01", "10.0.0.2"),
            DeviceIdentity::new("EVBS_02", "10.0.0.3"),
        ]);
        let sink = RecordingSink::default();

        assert_eq!(discovery.announce(&sink).await, 2);
        assert_eq!(
            sink.events.lock().as_slice(),
            [
                DiscoveryEvent::Found {
                    name: "EVBS_01".to_string(),
                    address: "10.0.0.2".to_string()
                },
                DiscoveryEvent::Found {
                    name: "EVBS_02".to_string(),
                    address: "10.0.0.3".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_routes_lost() {
        let sink = RecordingSink::default();
        sink.apply(DiscoveryEvent::Lost {
            name: "EVBS_01".to_string(),
        })
        .await
        .unwrap();
        assert_eq!(sink.events.lock().len(), 1);
    }
}
