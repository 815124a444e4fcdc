//! WinRT Backend
//!
//! Advertisement watcher discovery and GATT access through the Windows
//! Bluetooth LE APIs.

use crate::domain::command::EncodedPayload;
use crate::domain::models::{AdapterState, CommandTarget, DiscoveryEvent, PeripheralRef};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, ConnectionHandle, DiscoveryStream, TransportError, TransportResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::{IInspectable, GUID};
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattCommunicationStatus, GattDeviceService, GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothCacheMode, BluetoothError, BluetoothLEDevice,
};
use windows::Devices::Radios::{Radio, RadioState};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::DataWriter;

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError::Platform(e.message().to_string())
    }
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

/// `AA:BB:CC:DD:EE:FF` form of a 48-bit device address
fn format_address(address: u64) -> String {
    (0..6)
        .rev()
        .map(|i| format!("{:02X}", (address >> (i * 8)) & 0xff))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_address(id: &str) -> TransportResult<u64> {
    let hex: String = id.chars().filter(|c| *c != ':').collect();
    if hex.len() != 12 {
        return Err(TransportError::PeripheralNotFound(id.to_string()));
    }
    u64::from_str_radix(&hex, 16).map_err(|_| TransportError::PeripheralNotFound(id.to_string()))
}

fn radio_state(state: RadioState) -> AdapterState {
    match state {
        RadioState::On => AdapterState::PoweredOn,
        RadioState::Off => AdapterState::PoweredOff,
        RadioState::Disabled => AdapterState::Unauthorized,
        _ => AdapterState::Unknown,
    }
}

pub struct WinRtTransport {
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
    /// Kept alive so its StateChanged handler stays registered
    radio: Mutex<Option<Radio>>,
    adapter: Arc<watch::Sender<AdapterState>>,
}

impl WinRtTransport {
    pub fn new() -> Self {
        let (adapter, _) = watch::channel(AdapterState::Unknown);
        Self {
            watcher: Mutex::new(None),
            radio: Mutex::new(None),
            adapter: Arc::new(adapter),
        }
    }

    fn watcher(&self) -> MutexGuard<'_, Option<BluetoothLEAdvertisementWatcher>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watch_radio(&self, radio: &Radio) -> TransportResult<()> {
        let mut slot = self.radio.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        let sender = Arc::clone(&self.adapter);
        let handler = TypedEventHandler::new(
            move |radio: windows::core::Ref<Radio>, _: windows::core::Ref<IInspectable>| {
                if let Some(radio) = radio.as_ref() {
                    let state = radio_state(radio.State()?);
                    debug!(?state, "Radio state changed");
                    sender.send_replace(state);
                }
                Ok(())
            },
        );
        radio.StateChanged(&handler)?;
        *slot = Some(radio.clone());
        Ok(())
    }
}

impl Default for WinRtTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleTransport for WinRtTransport {
    async fn adapter_state(&self) -> TransportResult<AdapterState> {
        let adapter = match BluetoothAdapter::GetDefaultAsync()?.await {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("No default Bluetooth adapter: {}", e.message());
                return Ok(AdapterState::Unsupported);
            }
        };
        if !adapter.IsLowEnergySupported()? {
            return Ok(AdapterState::Unsupported);
        }

        let radio = adapter.GetRadioAsync()?.await?;
        let state = radio_state(radio.State()?);
        self.watch_radio(&radio)?;
        self.adapter.send_replace(state);
        Ok(state)
    }

    fn watch_adapter_state(&self) -> watch::Receiver<AdapterState> {
        self.adapter.subscribe()
    }

    async fn start_scan(&self) -> TransportResult<DiscoveryStream> {
        let mut slot = self.watcher();
        if let Some(previous) = slot.take() {
            previous.Stop()?;
        }

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;
        let (sender, receiver) = mpsc::unbounded_channel();

        let found = sender.clone();
        let received = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let service_uuids = adv.ServiceUuids()?;
                    let mut advertised_services = Vec::with_capacity(service_uuids.Size()? as usize);
                    for i in 0..service_uuids.Size()? {
                        advertised_services.push(to_uuid(service_uuids.GetAt(i)?));
                    }

                    let name = adv.LocalName()?.to_string();
                    let peripheral = PeripheralRef::new(
                        format_address(args.BluetoothAddress()?),
                        Some(name),
                    );
                    let _ = found.send(DiscoveryEvent::Found {
                        peripheral,
                        advertised_services,
                        rssi: Some(args.RawSignalStrengthInDBm()?),
                    });
                }
                Ok(())
            },
        );

        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let error = args.Error()?;
                    if error != BluetoothError::Success {
                        let _ = sender.send(DiscoveryEvent::Failed {
                            cause: format!("advertisement watcher stopped: {:?}", error),
                        });
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&received)?;
        watcher.Stopped(&stopped)?;
        watcher.Start()?;
        info!("Advertisement watcher started");
        *slot = Some(watcher);

        Ok(receiver)
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        if let Some(watcher) = self.watcher().take() {
            info!("Stopping advertisement watcher");
            watcher.Stop()?;
        }
        Ok(())
    }

    async fn connect(
        &self,
        peripheral: &PeripheralRef,
    ) -> TransportResult<Box<dyn ConnectionHandle>> {
        let address = parse_address(&peripheral.id)?;
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?
            .await
            .map_err(|_| TransportError::PeripheralNotFound(peripheral.id.clone()))?;
        info!("Device opened: {:?}", device.Name()?);

        Ok(Box::new(WinRtLink {
            device,
            services: Mutex::new(HashMap::new()),
            characteristics: Mutex::new(HashMap::new()),
        }))
    }
}

struct WinRtLink {
    device: BluetoothLEDevice,
    services: Mutex<HashMap<Uuid, GattDeviceService>>,
    characteristics: Mutex<HashMap<CommandTarget, GattCharacteristic>>,
}

impl WinRtLink {
    fn service(&self, uuid: Uuid) -> TransportResult<GattDeviceService> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::ServiceNotFound(uuid))
    }

    fn characteristic(&self, target: &CommandTarget) -> Option<GattCharacteristic> {
        self.characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(target)
            .cloned()
    }
}

#[async_trait]
impl ConnectionHandle for WinRtLink {
    async fn services(&self) -> TransportResult<Vec<Uuid>> {
        let result = self
            .device
            .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        if result.Status()? != GattCommunicationStatus::Success {
            return Err(TransportError::Gatt(format!(
                "service discovery returned {:?}",
                result.Status()?
            )));
        }

        let services = result.Services()?;
        let mut uuids = Vec::with_capacity(services.Size()? as usize);
        let mut cache = HashMap::new();
        for i in 0..services.Size()? {
            let service = services.GetAt(i)?;
            let uuid = to_uuid(service.Uuid()?);
            uuids.push(uuid);
            cache.insert(uuid, service);
        }
        *self.services.lock().unwrap_or_else(PoisonError::into_inner) = cache;
        Ok(uuids)
    }

    async fn characteristics(&self, service_uuid: Uuid) -> TransportResult<Vec<Uuid>> {
        let service = self.service(service_uuid)?;
        let result = service
            .GetCharacteristicsWithCacheModeAsync(BluetoothCacheMode::Uncached)?
            .await?;
        if result.Status()? != GattCommunicationStatus::Success {
            return Err(TransportError::Gatt(format!(
                "characteristic discovery returned {:?}",
                result.Status()?
            )));
        }

        let characteristics = result.Characteristics()?;
        let mut uuids = Vec::with_capacity(characteristics.Size()? as usize);
        let mut found = Vec::with_capacity(uuids.capacity());
        for i in 0..characteristics.Size()? {
            let characteristic = characteristics.GetAt(i)?;
            let uuid = to_uuid(characteristic.Uuid()?);
            uuids.push(uuid);
            found.push((CommandTarget::new(service_uuid, uuid), characteristic));
        }
        self.characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(found);
        Ok(uuids)
    }

    async fn write_with_response(
        &self,
        target: &CommandTarget,
        payload: &EncodedPayload,
    ) -> TransportResult<()> {
        let characteristic = self
            .characteristic(target)
            .ok_or(TransportError::CharacteristicNotFound(target.characteristic_uuid))?;

        let writer = DataWriter::new()?;
        writer.WriteBytes(payload.as_bytes())?;
        let buffer = writer.DetachBuffer()?;

        let result = characteristic
            .WriteValueWithResultAndOptionAsync(&buffer, GattWriteOption::WriteWithResponse)?
            .await?;
        match result.Status()? {
            GattCommunicationStatus::Success => Ok(()),
            GattCommunicationStatus::Unreachable => Err(TransportError::LinkLost),
            status => Err(TransportError::Gatt(format!("write returned {:?}", status))),
        }
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.characteristics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let services: Vec<GattDeviceService> = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, service)| service)
            .collect();
        for service in services {
            if let Err(e) = service.Close() {
                warn!("Failed to close GATT service: {}", e.message());
            }
        }
        self.device.Close()?;
        info!("Device closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let address = 0xF412_FA00_1A01;
        assert_eq!(format_address(address), "F4:12:FA:00:1A:01");
        assert_eq!(parse_address("F4:12:FA:00:1A:01").unwrap(), address);
        assert!(parse_address("F4:12").is_err());
    }

    #[test]
    fn test_guid_conversion() {
        let guid = GUID::from_u128(0x0000_1843_0000_1000_8000_0080_5f9b_34fb);
        assert_eq!(
            to_uuid(guid),
            Uuid::parse_str("00001843-0000-1000-8000-00805f9b34fb").unwrap()
        );
    }
}
