//! Bluetooth LE transport implementation.
//!
//! The device exposes one GATT service with a write characteristic
//! (host → radio) and a notify characteristic (radio → host). Notifications
//! are message-oriented, but the byte flow is framed identically to the
//! stream transports so the codec layer stays uniform.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{READ_CHANNEL_CAPACITY, Transport};

/// GATT service UUID of the device link service.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6ba1_b218_15a8_461f_9fa8_5dca_e273_eafd);

/// Write characteristic (host → radio).
pub const TO_RADIO_UUID: Uuid = Uuid::from_u128(0xf75c_76d2_129e_4dad_a1dd_7866_1244_01e7);

/// Notify characteristic (radio → host).
pub const FROM_RADIO_UUID: Uuid = Uuid::from_u128(0x2c55_e69e_4993_11ed_b878_0242_ac12_0002);

/// Configuration for the BLE transport.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Advertised device name to connect to.
    pub device_name: String,
    /// How long to scan for the device before giving up.
    pub scan_timeout: Duration,
}

impl BleConfig {
    /// Creates a new BLE configuration with default settings.
    #[must_use]
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
            scan_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the scan timeout.
    #[must_use]
    pub const fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }
}

fn ble_error(e: btleplug::Error) -> Error {
    Error::Connection {
        message: e.to_string(),
    }
}

/// Bluetooth LE transport.
pub struct BleTransport {
    config: BleConfig,
    peripheral: Option<Peripheral>,
    to_radio: Option<Characteristic>,
    reader_rx: Option<mpsc::Receiver<Bytes>>,
    pump: Option<JoinHandle<()>>,
}

impl BleTransport {
    /// Creates a new BLE transport with the given configuration.
    #[must_use]
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            peripheral: None,
            to_radio: None,
            reader_rx: None,
            pump: None,
        }
    }

    /// Scans for the configured device on the first available adapter.
    async fn find_peripheral(&self) -> Result<Peripheral> {
        let manager = Manager::new().await.map_err(ble_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(ble_error)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Connection {
                message: "no bluetooth adapter".into(),
            })?;

        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(ble_error)?;
        tokio::time::sleep(self.config.scan_timeout).await;
        let peripherals = adapter.peripherals().await.map_err(ble_error)?;
        let _ = adapter.stop_scan().await;

        for peripheral in peripherals {
            let name = peripheral
                .properties()
                .await
                .map_err(ble_error)?
                .and_then(|p| p.local_name);
            if name.as_deref() == Some(self.config.device_name.as_str()) {
                return Ok(peripheral);
            }
        }

        Err(Error::Connection {
            message: format!("device '{}' not found", self.config.device_name),
        })
    }
}

impl Transport for BleTransport {
    fn connect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.peripheral.is_some() {
                return Ok(());
            }

            tracing::info!("scanning for BLE device '{}'", self.config.device_name);
            let peripheral = self.find_peripheral().await?;

            peripheral.connect().await.map_err(ble_error)?;
            peripheral.discover_services().await.map_err(ble_error)?;

            let mut to_radio = None;
            let mut from_radio = None;
            for characteristic in peripheral.characteristics() {
                if characteristic.uuid == TO_RADIO_UUID {
                    to_radio = Some(characteristic);
                } else if characteristic.uuid == FROM_RADIO_UUID {
                    from_radio = Some(characteristic);
                }
            }
            let to_radio = to_radio.ok_or_else(|| Error::Connection {
                message: "to-radio characteristic missing".into(),
            })?;
            let from_radio = from_radio.ok_or_else(|| Error::Connection {
                message: "from-radio characteristic missing".into(),
            })?;

            peripheral.subscribe(&from_radio).await.map_err(ble_error)?;
            let mut notifications = peripheral.notifications().await.map_err(ble_error)?;

            let (tx, rx) = mpsc::channel(READ_CHANNEL_CAPACITY);
            self.pump = Some(tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    if notification.uuid != FROM_RADIO_UUID {
                        continue;
                    }
                    if tx.send(Bytes::from(notification.value)).await.is_err() {
                        tracing::debug!("byte receiver dropped");
                        break;
                    }
                }
                tracing::debug!("BLE notification stream ended");
            }));
            self.reader_rx = Some(rx);
            self.to_radio = Some(to_radio);
            self.peripheral = Some(peripheral);

            tracing::info!("connected to BLE device");
            Ok(())
        })
    }

    fn disconnect(&mut self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(pump) = self.pump.take() {
                pump.abort();
            }
            if let Some(peripheral) = self.peripheral.take() {
                if let Err(e) = peripheral.disconnect().await {
                    tracing::warn!("BLE disconnect error: {}", e);
                }
                tracing::info!("disconnected from BLE device");
            }
            self.to_radio = None;
            self.reader_rx = None;
            Ok(())
        })
    }

    fn send(&mut self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let peripheral = self.peripheral.clone();
        let to_radio = self.to_radio.clone();
        Box::pin(async move {
            let (peripheral, to_radio) = peripheral
                .zip(to_radio)
                .ok_or(Error::NotConnected)?;

            tracing::trace!("sending {} bytes", data.len());
            peripheral
                .write(&to_radio, &data, WriteType::WithoutResponse)
                .await
                .map_err(ble_error)?;
            Ok(())
        })
    }

    fn take_reader(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.reader_rx.take()
    }

    fn is_connected(&self) -> bool {
        self.peripheral.is_some()
    }
}
