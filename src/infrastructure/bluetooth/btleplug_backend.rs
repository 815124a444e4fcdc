//! btleplug Backend
//!
//! Cross-platform transport for hosts without WinRT (BlueZ, CoreBluetooth).

use crate::domain::command::EncodedPayload;
use crate::domain::models::{AdapterState, CommandTarget, DiscoveryEvent, PeripheralRef};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, ConnectionHandle, DiscoveryStream, TransportError, TransportResult,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl From<btleplug::Error> for TransportError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::DeviceNotFound => {
                TransportError::PeripheralNotFound("device not found".to_string())
            }
            btleplug::Error::NotConnected => TransportError::LinkLost,
            other => TransportError::Platform(other.to_string()),
        }
    }
}

type PeripheralCache = Arc<Mutex<HashMap<String, Peripheral>>>;

fn lock_cache(cache: &PeripheralCache) -> MutexGuard<'_, HashMap<String, Peripheral>> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}

fn central_state(state: CentralState) -> AdapterState {
    match state {
        CentralState::PoweredOn => AdapterState::PoweredOn,
        CentralState::PoweredOff => AdapterState::PoweredOff,
        _ => AdapterState::Unknown,
    }
}

pub struct BtleplugTransport {
    adapter: Option<Adapter>,
    peripherals: PeripheralCache,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    state_task: Option<JoinHandle<()>>,
    state: Arc<watch::Sender<AdapterState>>,
}

impl BtleplugTransport {
    /// Open the first adapter the platform reports and follow its power state
    pub async fn new() -> TransportResult<Self> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next();
        let initial = match &adapter {
            Some(adapter) => {
                info!("Using adapter: {}", adapter.adapter_info().await?);
                central_state(adapter.adapter_state().await?)
            }
            None => {
                warn!("No Bluetooth adapter found");
                AdapterState::Unsupported
            }
        };
        let (state, _) = watch::channel(initial);
        let state = Arc::new(state);

        let state_task = match &adapter {
            Some(adapter) => {
                let mut events = adapter.events().await?;
                let state = Arc::clone(&state);
                Some(tokio::spawn(async move {
                    while let Some(event) = events.next().await {
                        if let CentralEvent::StateUpdate(update) = event {
                            let update = central_state(update);
                            debug!(?update, "Adapter state changed");
                            state.send_replace(update);
                        }
                    }
                }))
            }
            None => None,
        };

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scan_task: Mutex::new(None),
            state_task,
            state,
        })
    }

    fn adapter(&self) -> TransportResult<&Adapter> {
        self.adapter.as_ref().ok_or(TransportError::NoAdapter)
    }

    fn abort_scan_task(&self) {
        let task = self
            .scan_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.abort_scan_task();
        if let Some(task) = self.state_task.take() {
            task.abort();
        }
    }
}

/// Resolve a discovery notification into a `Found` event
async fn describe(adapter: &Adapter, id: &PeripheralId) -> Option<(Peripheral, DiscoveryEvent)> {
    let peripheral = adapter.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;
    let event = DiscoveryEvent::Found {
        peripheral: PeripheralRef::new(peripheral.address().to_string(), properties.local_name),
        advertised_services: properties.services,
        rssi: properties.rssi,
    };
    Some((peripheral, event))
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn adapter_state(&self) -> TransportResult<AdapterState> {
        let Some(adapter) = &self.adapter else {
            return Ok(AdapterState::Unsupported);
        };
        let current = central_state(adapter.adapter_state().await?);
        self.state.send_if_modified(|state| {
            let changed = *state != current;
            *state = current;
            changed
        });
        Ok(current)
    }

    fn watch_adapter_state(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }

    async fn start_scan(&self) -> TransportResult<DiscoveryStream> {
        self.abort_scan_task();
        let adapter = self.adapter()?.clone();
        let mut events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let cache = Arc::clone(&self.peripherals);
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };
                if let Some((peripheral, found)) = describe(&adapter, &id).await {
                    let address = peripheral.address().to_string();
                    lock_cache(&cache).insert(address, peripheral);
                    if sender.send(found).is_err() {
                        break;
                    }
                }
            }
            debug!("Discovery event stream ended");
        });
        *self.scan_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        info!("btleplug scan started");
        Ok(receiver)
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.abort_scan_task();
        if let Some(adapter) = &self.adapter {
            adapter.stop_scan().await?;
        }
        Ok(())
    }

    async fn connect(
        &self,
        peripheral: &PeripheralRef,
    ) -> TransportResult<Box<dyn ConnectionHandle>> {
        let device = lock_cache(&self.peripherals)
            .get(&peripheral.id)
            .cloned()
            .ok_or_else(|| TransportError::PeripheralNotFound(peripheral.id.clone()))?;

        let mut pending = PendingLink {
            device: Some(device.clone()),
        };
        device.connect().await?;
        pending.device = None;
        info!(id = %peripheral.id, "Peripheral connected");
        Ok(Box::new(BtleplugLink { device }))
    }
}

/// Closes the link of a connect attempt that did not hand it back, either
/// because it failed or because its future was dropped
struct PendingLink {
    device: Option<Peripheral>,
}

impl Drop for PendingLink {
    fn drop(&mut self) {
        let Some(device) = self.device.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = device.disconnect().await {
                    debug!("Releasing abandoned link failed: {}", e);
                }
            });
        }
    }
}

struct BtleplugLink {
    device: Peripheral,
}

#[async_trait]
impl ConnectionHandle for BtleplugLink {
    async fn services(&self) -> TransportResult<Vec<Uuid>> {
        self.device.discover_services().await?;
        Ok(self.device.services().iter().map(|s| s.uuid).collect())
    }

    async fn characteristics(&self, service_uuid: Uuid) -> TransportResult<Vec<Uuid>> {
        self.device
            .services()
            .iter()
            .find(|s| s.uuid == service_uuid)
            .map(|s| s.characteristics.iter().map(|c| c.uuid).collect())
            .ok_or(TransportError::ServiceNotFound(service_uuid))
    }

    async fn write_with_response(
        &self,
        target: &CommandTarget,
        payload: &EncodedPayload,
    ) -> TransportResult<()> {
        let characteristic = self
            .device
            .characteristics()
            .into_iter()
            .find(|c| {
                c.service_uuid == target.service_uuid && c.uuid == target.characteristic_uuid
            })
            .ok_or(TransportError::CharacteristicNotFound(target.characteristic_uuid))?;

        self.device
            .write(&characteristic, payload.as_bytes(), WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.device.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_central_state_mapping() {
        assert_eq!(central_state(CentralState::PoweredOn), AdapterState::PoweredOn);
        assert_eq!(central_state(CentralState::PoweredOff), AdapterState::PoweredOff);
        assert_eq!(central_state(CentralState::Unknown), AdapterState::Unknown);
    }
}
