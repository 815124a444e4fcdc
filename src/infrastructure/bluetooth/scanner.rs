//! BLE Scanner Module
//!
//! Owns the scanning state and the device registry. Discovery events arrive
//! as a stream from the transport and are applied in arrival order.

use crate::domain::error::{SessionError, SessionResult};
use crate::domain::models::{AppEvent, DiscoveryEvent, MessageSeverity, StatusMessage};
use crate::domain::registry::DeviceRegistry;
use crate::domain::settings::RefreshPolicy;
use crate::infrastructure::bluetooth::adapter::AdapterMonitor;
use crate::infrastructure::bluetooth::transport::{BleTransport, DiscoveryStream};
use crate::infrastructure::permissions::PermissionGate;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub struct ScanSession {
    registry: DeviceRegistry,
    stream: Option<DiscoveryStream>,
    service_filter: Option<Uuid>,
    refresh_policy: RefreshPolicy,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ScanSession {
    /// # Arguments
    /// * `service_filter` - Only keep peripherals advertising this service (None keeps all)
    /// * `refresh_policy` - Whether `refresh` starts from an empty registry
    pub fn new(
        event_sender: mpsc::UnboundedSender<AppEvent>,
        service_filter: Option<Uuid>,
        refresh_policy: RefreshPolicy,
    ) -> Self {
        Self {
            registry: DeviceRegistry::new(),
            stream: None,
            service_filter,
            refresh_policy,
            event_sender,
        }
    }

    /// Start a new scan session. The registry is reset.
    ///
    /// Calling this while already scanning does nothing.
    pub async fn start(
        &mut self,
        transport: &dyn BleTransport,
        permissions: &dyn PermissionGate,
        adapter: &AdapterMonitor,
    ) -> SessionResult<()> {
        if self.is_scanning() {
            debug!("Scan already running");
            return Ok(());
        }

        Self::check_preconditions(permissions, adapter).await?;
        self.reset_registry();
        self.begin(transport).await
    }

    /// Stop, then start again. Registry handling follows the refresh policy.
    pub async fn refresh(
        &mut self,
        transport: &dyn BleTransport,
        permissions: &dyn PermissionGate,
        adapter: &AdapterMonitor,
    ) -> SessionResult<()> {
        self.stop(transport).await?;
        Self::check_preconditions(permissions, adapter).await?;
        if self.refresh_policy == RefreshPolicy::Clear {
            self.reset_registry();
        }
        self.begin(transport).await
    }

    /// Halt discovery. Safe to call when idle.
    pub async fn stop(&mut self, transport: &dyn BleTransport) -> SessionResult<()> {
        if self.stream.take().is_none() {
            return Ok(());
        }

        info!("Stopping BLE scan...");
        let _ = self.event_sender.send(AppEvent::ScanState(false));
        self.send_log("Scan stopped.", MessageSeverity::Info);
        transport
            .stop_scan()
            .await
            .map_err(|e| SessionError::ScanError(e.to_string()))
    }

    async fn check_preconditions(
        permissions: &dyn PermissionGate,
        adapter: &AdapterMonitor,
    ) -> SessionResult<()> {
        if !permissions.has_bluetooth_scan_permission().await {
            warn!("Bluetooth scan permission not granted");
            return Err(SessionError::PermissionDenied(
                "bluetooth scan permission not granted".to_string(),
            ));
        }
        adapter.ensure_powered_on().await
    }

    async fn begin(&mut self, transport: &dyn BleTransport) -> SessionResult<()> {
        match self.service_filter {
            Some(filter) => info!("Starting BLE scan for service UUID: {}", filter),
            None => info!("Starting BLE scan for all devices"),
        }
        self.send_log("Scanning for devices...", MessageSeverity::Info);

        let stream = transport.start_scan().await.map_err(|e| {
            error!("Failed to start scan: {}", e);
            SessionError::ScanError(e.to_string())
        })?;
        self.stream = Some(stream);
        let _ = self.event_sender.send(AppEvent::ScanState(true));
        Ok(())
    }

    /// Wait for the next discovery event. Never resolves while idle;
    /// `None` means the transport closed the stream.
    pub async fn next_event(&mut self) -> Option<DiscoveryEvent> {
        match self.stream.as_mut() {
            Some(stream) => stream.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Apply one discovery event. Returns whether a new device was added.
    ///
    /// A failure event ends the scan and is returned as `ScanError`.
    pub async fn handle_event(
        &mut self,
        event: DiscoveryEvent,
        transport: &dyn BleTransport,
    ) -> SessionResult<bool> {
        match event {
            DiscoveryEvent::Found {
                peripheral,
                advertised_services,
                rssi,
            } => {
                if let Some(filter) = self.service_filter {
                    if !advertised_services.contains(&filter) {
                        trace!(id = %peripheral.id, "Ignoring peripheral outside service filter");
                        return Ok(false);
                    }
                }

                debug!(id = %peripheral.id, name = peripheral.label(), ?rssi, "Discovered peripheral");
                let inserted = self.registry.insert(peripheral);
                if inserted {
                    self.publish_devices();
                }
                Ok(inserted)
            }
            DiscoveryEvent::Failed { cause } => {
                error!("Scan failed: {}", cause);
                self.stream = None;
                if let Err(e) = transport.stop_scan().await {
                    warn!("Failed to halt radio after scan error: {}", e);
                }
                let _ = self.event_sender.send(AppEvent::ScanState(false));
                Err(SessionError::ScanError(cause))
            }
        }
    }

    /// The transport ended the stream on its own. While scanning this ends
    /// the scan with `ScanError`; an idle session ignores it.
    pub async fn handle_stream_closed(
        &mut self,
        transport: &dyn BleTransport,
    ) -> SessionResult<()> {
        if self.stream.take().is_none() {
            return Ok(());
        }
        error!("Discovery stream ended during an active scan");
        if let Err(e) = transport.stop_scan().await {
            warn!("Failed to halt radio after the stream closed: {}", e);
        }
        let _ = self.event_sender.send(AppEvent::ScanState(false));
        Err(SessionError::ScanError("discovery stream ended".to_string()))
    }

    /// Apply every event already delivered. Returns the number of new devices.
    pub async fn drain(&mut self, transport: &dyn BleTransport) -> SessionResult<usize> {
        let mut added = 0;
        loop {
            let next = match self.stream.as_mut() {
                Some(stream) => stream.try_recv(),
                None => break,
            };
            match next {
                Ok(event) => {
                    if self.handle_event(event, transport).await? {
                        added += 1;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.handle_stream_closed(transport).await?;
                    break;
                }
            }
        }
        Ok(added)
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn is_scanning(&self) -> bool {
        self.stream.is_some()
    }

    fn reset_registry(&mut self) {
        self.registry.clear();
        self.publish_devices();
    }

    fn publish_devices(&self) {
        let _ = self
            .event_sender
            .send(AppEvent::DevicesUpdated(self.registry.snapshot()));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
