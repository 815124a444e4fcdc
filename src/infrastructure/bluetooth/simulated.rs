//! In-memory BLE transport
//!
//! Scripted peripherals, injectable discovery events and failure switches.
//! Backs the unit tests and stands in for the radio on hosts built without
//! a native backend.

use crate::domain::command::{self, EncodedPayload};
use crate::domain::models::{AdapterState, CommandTarget, DiscoveryEvent, PeripheralRef};
use crate::infrastructure::bluetooth::transport::{
    BleTransport, ConnectionHandle, DiscoveryStream, TransportError, TransportResult,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub peripheral: PeripheralRef,
    pub advertised_services: Vec<Uuid>,
    pub rssi: Option<i16>,
    pub services: Vec<(Uuid, Vec<Uuid>)>,
}

impl SimulatedPeripheral {
    pub fn new(id: &str, name: Option<&str>) -> Self {
        Self {
            peripheral: PeripheralRef::new(id, name.map(str::to_string)),
            advertised_services: Vec::new(),
            rssi: Some(-60),
            services: Vec::new(),
        }
    }

    pub fn with_service(mut self, service_uuid: Uuid, characteristics: Vec<Uuid>) -> Self {
        self.services.push((service_uuid, characteristics));
        self
    }

    pub fn advertising(mut self, service_uuid: Uuid) -> Self {
        self.advertised_services.push(service_uuid);
        self
    }

    /// Peripheral exposing the default control service with the volume and
    /// raw data characteristics
    pub fn speaker(id: &str, name: Option<&str>) -> Self {
        let service = command::from_short(0x1843);
        Self::new(id, name)
            .with_service(command::from_short(0x1800), vec![command::from_short(0x2a00)])
            .with_service(
                service,
                vec![command::from_short(0x2b7e), command::from_short(0x2b7b)],
            )
            .advertising(service)
    }

    pub fn discovery_event(&self) -> DiscoveryEvent {
        DiscoveryEvent::Found {
            peripheral: self.peripheral.clone(),
            advertised_services: self.advertised_services.clone(),
            rssi: self.rssi,
        }
    }
}

/// A write acknowledged by a simulated peripheral
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub peripheral_id: String,
    pub target: CommandTarget,
    pub payload: EncodedPayload,
}

struct SimState {
    peripherals: Vec<SimulatedPeripheral>,
    advertise_on_scan: bool,
    scan_sender: Option<mpsc::UnboundedSender<DiscoveryEvent>>,
    scan_starts: usize,
    scan_failure: Option<String>,
    connect_failures: HashMap<String, String>,
    stalled_connects: HashSet<String>,
    enumeration_failures: HashMap<(String, Uuid), String>,
    blocked_enumeration: HashSet<String>,
    write_failure: Option<String>,
    stall_writes: bool,
    connects: Vec<String>,
    disconnects: Vec<String>,
    writes: Vec<WriteRecord>,
}

/// Cloning yields another handle onto the same simulated radio
#[derive(Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
    adapter: Arc<watch::Sender<AdapterState>>,
}

impl Default for SimulatedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTransport {
    /// Powered-on adapter with no peripherals
    pub fn new() -> Self {
        let (adapter, _) = watch::channel(AdapterState::PoweredOn);
        Self {
            state: Arc::new(Mutex::new(SimState {
                peripherals: Vec::new(),
                advertise_on_scan: true,
                scan_sender: None,
                scan_starts: 0,
                scan_failure: None,
                connect_failures: HashMap::new(),
                stalled_connects: HashSet::new(),
                enumeration_failures: HashMap::new(),
                blocked_enumeration: HashSet::new(),
                write_failure: None,
                stall_writes: false,
                connects: Vec::new(),
                disconnects: Vec::new(),
                writes: Vec::new(),
            })),
            adapter: Arc::new(adapter),
        }
    }

    /// A small neighbourhood for running the console without hardware
    pub fn demo() -> Self {
        let transport = Self::new();
        transport.add_peripheral(SimulatedPeripheral::speaker(
            "F4:12:FA:00:1A:01",
            Some("BT Speaker"),
        ));
        transport.add_peripheral(
            SimulatedPeripheral::new("F4:12:FA:00:1A:02", None).with_service(
                command::from_short(0x180f),
                vec![command::from_short(0x2a19)],
            ),
        );
        transport
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registered peripherals are advertised, in registration order, when a
    /// scan starts
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        self.lock().peripherals.push(peripheral);
    }

    pub fn set_advertise_on_scan(&self, advertise: bool) {
        self.lock().advertise_on_scan = advertise;
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.adapter.send_replace(state);
    }

    /// Push an event into the running scan. Returns `false` when idle.
    pub fn emit(&self, event: DiscoveryEvent) -> bool {
        self.lock()
            .scan_sender
            .as_ref()
            .is_some_and(|sender| sender.send(event).is_ok())
    }

    /// The radio closes the discovery stream without being asked to stop
    pub fn end_scan_stream(&self) {
        self.lock().scan_sender = None;
    }

    pub fn fail_next_scan(&self, cause: &str) {
        self.lock().scan_failure = Some(cause.to_string());
    }

    pub fn fail_connect(&self, peripheral_id: &str, cause: &str) {
        self.lock()
            .connect_failures
            .insert(peripheral_id.to_string(), cause.to_string());
    }

    /// Link establishment to this peripheral never completes. Dropping the
    /// pending attempt tears the half-open link down, which is recorded as a
    /// disconnect.
    pub fn stall_connect(&self, peripheral_id: &str) {
        self.lock()
            .stalled_connects
            .insert(peripheral_id.to_string());
    }

    pub fn fail_enumeration(&self, peripheral_id: &str, service_uuid: Uuid, cause: &str) {
        self.lock()
            .enumeration_failures
            .insert((peripheral_id.to_string(), service_uuid), cause.to_string());
    }

    /// Service discovery on this peripheral never completes
    pub fn block_enumeration(&self, peripheral_id: &str) {
        self.lock()
            .blocked_enumeration
            .insert(peripheral_id.to_string());
    }

    pub fn fail_writes(&self, cause: &str) {
        self.lock().write_failure = Some(cause.to_string());
    }

    /// Writes are never acknowledged
    pub fn stall_writes(&self) {
        self.lock().stall_writes = true;
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scan_sender.is_some()
    }

    pub fn scan_starts(&self) -> usize {
        self.lock().scan_starts
    }

    pub fn connects(&self) -> Vec<String> {
        self.lock().connects.clone()
    }

    pub fn disconnects(&self) -> Vec<String> {
        self.lock().disconnects.clone()
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }
}

#[async_trait]
impl BleTransport for SimulatedTransport {
    async fn adapter_state(&self) -> TransportResult<AdapterState> {
        Ok(*self.adapter.borrow())
    }

    fn watch_adapter_state(&self) -> watch::Receiver<AdapterState> {
        self.adapter.subscribe()
    }

    async fn start_scan(&self) -> TransportResult<DiscoveryStream> {
        let mut state = self.lock();
        if let Some(cause) = state.scan_failure.take() {
            return Err(TransportError::Platform(cause));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        if state.advertise_on_scan {
            for peripheral in &state.peripherals {
                let _ = sender.send(peripheral.discovery_event());
            }
        }
        state.scan_sender = Some(sender);
        state.scan_starts += 1;
        debug!(
            peripherals = state.peripherals.len(),
            "Simulated scan started"
        );
        Ok(receiver)
    }

    async fn stop_scan(&self) -> TransportResult<()> {
        self.lock().scan_sender = None;
        Ok(())
    }

    async fn connect(
        &self,
        peripheral: &PeripheralRef,
    ) -> TransportResult<Box<dyn ConnectionHandle>> {
        let (services, stalled) = {
            let mut state = self.lock();
            state.connects.push(peripheral.id.clone());

            if let Some(cause) = state.connect_failures.get(&peripheral.id) {
                return Err(TransportError::Platform(cause.clone()));
            }

            let simulated = state
                .peripherals
                .iter()
                .find(|p| p.peripheral.id == peripheral.id)
                .ok_or_else(|| TransportError::PeripheralNotFound(peripheral.id.clone()))?;
            (
                simulated.services.clone(),
                state.stalled_connects.contains(&peripheral.id),
            )
        };

        if stalled {
            let _half_open = HalfOpenLink {
                peripheral_id: peripheral.id.clone(),
                state: Arc::clone(&self.state),
            };
            std::future::pending::<()>().await;
        }

        Ok(Box::new(SimulatedLink {
            peripheral_id: peripheral.id.clone(),
            services,
            state: Arc::clone(&self.state),
            connected: AtomicBool::new(true),
        }))
    }
}

/// Link that the radio opened but never handed back; torn down when the
/// connect future is dropped
struct HalfOpenLink {
    peripheral_id: String,
    state: Arc<Mutex<SimState>>,
}

impl Drop for HalfOpenLink {
    fn drop(&mut self) {
        debug!(id = %self.peripheral_id, "Simulated half-open link released");
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .disconnects
            .push(self.peripheral_id.clone());
    }
}

struct SimulatedLink {
    peripheral_id: String,
    services: Vec<(Uuid, Vec<Uuid>)>,
    state: Arc<Mutex<SimState>>,
    connected: AtomicBool,
}

impl SimulatedLink {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> TransportResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::LinkLost)
        }
    }
}

#[async_trait]
impl ConnectionHandle for SimulatedLink {
    async fn services(&self) -> TransportResult<Vec<Uuid>> {
        self.ensure_connected()?;
        let blocked = self.lock().blocked_enumeration.contains(&self.peripheral_id);
        if blocked {
            std::future::pending::<()>().await;
        }
        Ok(self.services.iter().map(|(service, _)| *service).collect())
    }

    async fn characteristics(&self, service_uuid: Uuid) -> TransportResult<Vec<Uuid>> {
        self.ensure_connected()?;
        let failure = self
            .lock()
            .enumeration_failures
            .get(&(self.peripheral_id.clone(), service_uuid))
            .cloned();
        if let Some(cause) = failure {
            return Err(TransportError::Gatt(cause));
        }

        self.services
            .iter()
            .find(|(service, _)| *service == service_uuid)
            .map(|(_, characteristics)| characteristics.clone())
            .ok_or(TransportError::ServiceNotFound(service_uuid))
    }

    async fn write_with_response(
        &self,
        target: &CommandTarget,
        payload: &EncodedPayload,
    ) -> TransportResult<()> {
        self.ensure_connected()?;
        let (stall, failure) = {
            let state = self.lock();
            (state.stall_writes, state.write_failure.clone())
        };
        if stall {
            std::future::pending::<()>().await;
        }
        if let Some(cause) = failure {
            return Err(TransportError::Gatt(cause));
        }

        let exists = self.services.iter().any(|(service, characteristics)| {
            *service == target.service_uuid && characteristics.contains(&target.characteristic_uuid)
        });
        if !exists {
            return Err(TransportError::CharacteristicNotFound(
                target.characteristic_uuid,
            ));
        }

        self.lock().writes.push(WriteRecord {
            peripheral_id: self.peripheral_id.clone(),
            target: *target,
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.lock().disconnects.push(self.peripheral_id.clone());
        Ok(())
    }
}
