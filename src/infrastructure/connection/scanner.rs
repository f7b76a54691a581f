//! BLE Scanner Module
//!
//! Handles Bluetooth LE discovery of arms advertising the UART service.

use crate::domain::models::ScannedDevice;
use crate::infrastructure::connection::ble::{BleConfig, BleConnection};
use anyhow::Result;
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// A discovered peripheral and its advertised identity
pub struct DiscoveredPeripheral {
    pub peripheral: Peripheral,
    pub device: ScannedDevice,
}

impl DiscoveredPeripheral {
    /// Wrap this peripheral in a connection object.
    pub fn into_connection(self, config: BleConfig) -> BleConnection {
        BleConnection::new(
            self.peripheral,
            Some(self.device.name),
            self.device.signal_strength,
            config,
        )
    }
}

/// BLE Scanner for discovering arms
pub struct BleScanner {
    adapter: Adapter,
    service_uuid: Uuid,
}

impl BleScanner {
    /// Open the first Bluetooth adapter on the system
    pub async fn new(service_uuid: Uuid) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;

        Ok(Self {
            adapter,
            service_uuid,
        })
    }

    /// Scan for `duration` and return unique peripherals.
    ///
    /// # Arguments
    /// * `duration` - How long to listen for advertisements
    /// * `show_all_devices` - If true, report every peripheral regardless of service UUID
    pub async fn scan(
        &self,
        duration: Duration,
        show_all_devices: bool,
    ) -> Result<Vec<DiscoveredPeripheral>> {
        info!("Starting BLE scan for service UUID: {}", self.service_uuid);

        let filter = if show_all_devices {
            ScanFilter::default()
        } else {
            ScanFilter {
                services: vec![self.service_uuid],
            }
        };

        self.adapter.start_scan(filter).await?;
        tokio::time::sleep(duration).await;
        let peripherals = self.adapter.peripherals().await?;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Stopping scan failed: {}", e);
        }

        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for peripheral in peripherals {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };

            // Some stacks ignore the scan filter, so check again here
            if !show_all_devices && !properties.services.contains(&self.service_uuid) {
                continue;
            }

            let address = properties.address.to_string();
            if !seen.insert(address.clone()) {
                continue;
            }

            let device = ScannedDevice {
                name: properties
                    .local_name
                    .filter(|name| !name.is_empty())
                    .unwrap_or_else(|| "Unknown".to_string()),
                address,
                signal_strength: properties.rssi,
            };
            debug!(address = %device.address, name = %device.name, "Device found");
            found.push(DiscoveredPeripheral { peripheral, device });
        }

        info!("Scan finished, {} device(s) found", found.len());
        Ok(found)
    }

    /// Scan and return the peripheral with the given address, if seen.
    pub async fn find_by_address(
        &self,
        address: &str,
        duration: Duration,
    ) -> Result<Option<DiscoveredPeripheral>> {
        let found = self.scan(duration, true).await?;
        Ok(found
            .into_iter()
            .find(|d| d.device.address.eq_ignore_ascii_case(address)))
    }
}
