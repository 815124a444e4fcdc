//! Bluetooth Service Module
//!
//! Caller-facing session that coordinates permission and adapter gating,
//! scanning, the connection and command dispatch for a remote speaker.

use crate::domain::catalog::{CharacteristicEntry, GattCatalog};
use crate::domain::command::{self, CommandEncoder, Directive, VolumeDirection};
use crate::domain::error::{SessionError, SessionResult};
use crate::domain::models::{
    AdapterState, AppEvent, CommandTarget, ConnectionSnapshot, ConnectionState, DiscoveryEvent,
    MessageSeverity, PeripheralRef, StatusMessage,
};
use crate::domain::settings::{BleSettings, RefreshPolicy};
use crate::infrastructure::bluetooth::{
    adapter::AdapterMonitor,
    connection::{ConnectionConfig, ConnectionManager},
    dispatcher::CommandDispatcher,
    scanner::ScanSession,
    transport::BleTransport,
};
use crate::infrastructure::permissions::PermissionGate;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

/// Validated session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub service_uuid: Uuid,
    pub volume_characteristic_uuid: Uuid,
    pub raw_characteristic_uuid: Uuid,
    pub scan_service_filter: Option<Uuid>,
    pub refresh_policy: RefreshPolicy,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub scan_on_start: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_uuid: command::from_short(0x1843),
            volume_characteristic_uuid: command::from_short(0x2b7e),
            raw_characteristic_uuid: command::from_short(0x2b7b),
            scan_service_filter: None,
            refresh_policy: RefreshPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
            scan_on_start: true,
        }
    }
}

impl TryFrom<&BleSettings> for SessionConfig {
    type Error = anyhow::Error;

    fn try_from(settings: &BleSettings) -> anyhow::Result<Self> {
        let scan_service_filter = match settings.scan_service_filter.as_deref() {
            Some(filter) if !filter.trim().is_empty() => Some(
                command::parse_uuid(filter).context("Invalid ble.scan_service_filter")?,
            ),
            _ => None,
        };

        Ok(Self {
            service_uuid: command::parse_uuid(&settings.service_uuid)
                .context("Invalid ble.service_uuid")?,
            volume_characteristic_uuid: command::parse_uuid(&settings.volume_characteristic_uuid)
                .context("Invalid ble.volume_characteristic_uuid")?,
            raw_characteristic_uuid: command::parse_uuid(&settings.raw_characteristic_uuid)
                .context("Invalid ble.raw_characteristic_uuid")?,
            scan_service_filter,
            refresh_policy: settings.refresh_policy,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            write_timeout: Duration::from_millis(settings.write_timeout_ms),
            scan_on_start: settings.scan_on_start,
        })
    }
}

/// One BLE session: created at startup, torn down with [`BleSession::shutdown`]
pub struct BleSession {
    transport: Arc<dyn BleTransport>,
    permissions: Box<dyn PermissionGate>,
    adapter: AdapterMonitor,
    scanner: ScanSession,
    connection: ConnectionManager,
    dispatcher: CommandDispatcher,
    selected_service: Option<Uuid>,
    selected_characteristic: Option<Uuid>,
    config: SessionConfig,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl BleSession {
    pub fn new(
        transport: Arc<dyn BleTransport>,
        permissions: Box<dyn PermissionGate>,
        config: SessionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            adapter: AdapterMonitor::new(Arc::clone(&transport)),
            scanner: ScanSession::new(
                event_sender.clone(),
                config.scan_service_filter,
                config.refresh_policy,
            ),
            connection: ConnectionManager::new(
                ConnectionConfig {
                    connect_timeout: config.connect_timeout,
                },
                event_sender.clone(),
            ),
            dispatcher: CommandDispatcher::new(config.write_timeout),
            transport,
            permissions,
            selected_service: None,
            selected_characteristic: None,
            config,
            event_sender,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn event_sender(&self) -> &mpsc::UnboundedSender<AppEvent> {
        &self.event_sender
    }

    // --- Scanning ---

    pub async fn start_scan(&mut self) -> SessionResult<()> {
        self.scanner
            .start(
                self.transport.as_ref(),
                self.permissions.as_ref(),
                &self.adapter,
            )
            .await
    }

    pub async fn stop_scan(&mut self) -> SessionResult<()> {
        self.scanner.stop(self.transport.as_ref()).await
    }

    pub async fn refresh_scan(&mut self) -> SessionResult<()> {
        self.scanner
            .refresh(
                self.transport.as_ref(),
                self.permissions.as_ref(),
                &self.adapter,
            )
            .await
    }

    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Registry snapshot in discovery order
    pub fn devices(&self) -> Vec<PeripheralRef> {
        self.scanner.registry().snapshot()
    }

    /// Next discovery event; pending while not scanning
    pub async fn next_discovery(&mut self) -> Option<DiscoveryEvent> {
        self.scanner.next_event().await
    }

    /// Apply one discovery event. A scan failure is also published as
    /// `ScanFailed`.
    pub async fn handle_discovery(&mut self, event: DiscoveryEvent) -> SessionResult<bool> {
        let result = self
            .scanner
            .handle_event(event, self.transport.as_ref())
            .await;
        if let Err(e) = &result {
            let _ = self.event_sender.send(AppEvent::ScanFailed(e.clone()));
        }
        result
    }

    /// The backend closed the discovery stream. Ending an active scan this
    /// way is a `ScanError`, also published as `ScanFailed`.
    pub async fn discovery_ended(&mut self) -> SessionResult<()> {
        let result = self
            .scanner
            .handle_stream_closed(self.transport.as_ref())
            .await;
        if let Err(e) = &result {
            let _ = self.event_sender.send(AppEvent::ScanFailed(e.clone()));
        }
        result
    }

    /// Apply every discovery event already delivered
    pub async fn pump_discovery(&mut self) -> SessionResult<usize> {
        let result = self.scanner.drain(self.transport.as_ref()).await;
        if let Err(e) = &result {
            let _ = self.event_sender.send(AppEvent::ScanFailed(e.clone()));
        }
        result
    }

    // --- Adapter ---

    pub fn subscribe_adapter(&self) -> watch::Receiver<AdapterState> {
        self.adapter.subscribe()
    }

    /// React to a power-state change; a radio that goes away ends the scan
    pub async fn handle_adapter_change(&mut self, state: AdapterState) {
        info!(?state, "Adapter state changed");
        let _ = self.event_sender.send(AppEvent::AdapterState(state));

        if state != AdapterState::PoweredOn && self.scanner.is_scanning() {
            if let Err(e) = self.stop_scan().await {
                warn!("Failed to stop scan after adapter change: {}", e);
            }
            let _ = self.event_sender.send(AppEvent::ScanFailed(
                SessionError::AdapterNotReady(format!("adapter is {:?}", state)),
            ));
        }
    }

    // --- Connection ---

    /// Connect to a discovered peripheral. Selection is reset.
    ///
    /// An unknown id leaves a settled connection alone, but an attempt that
    /// was abandoned mid-way (`Connecting`/`Discovering`) is released first.
    pub async fn connect(&mut self, peripheral_id: &str) -> SessionResult<()> {
        let Some(peripheral) = self.scanner.registry().get(peripheral_id).cloned() else {
            if matches!(
                self.connection.state(),
                ConnectionState::Connecting | ConnectionState::Discovering
            ) {
                self.disconnect().await;
            }
            return Err(SessionError::ConnectError(format!(
                "peripheral {} not discovered",
                peripheral_id
            )));
        };

        self.selected_service = None;
        self.selected_characteristic = None;
        self.connection
            .connect(self.transport.as_ref(), peripheral)
            .await
    }

    pub async fn disconnect(&mut self) {
        self.selected_service = None;
        self.selected_characteristic = None;
        self.connection.disconnect().await;
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    pub fn catalog(&self) -> Option<&GattCatalog> {
        self.connection.catalog()
    }

    fn ready_catalog(&self) -> SessionResult<&GattCatalog> {
        self.connection.catalog().ok_or_else(|| {
            SessionError::NotConnected(format!("connection is {:?}", self.connection.state()))
        })
    }

    // --- Catalog browsing ---

    pub fn list_services(&self) -> SessionResult<Vec<Uuid>> {
        let services = self.ready_catalog()?.service_uuids();
        let _ = self.event_sender.send(AppEvent::Services(services.clone()));
        Ok(services)
    }

    pub fn list_characteristics(&self, service_uuid: &str) -> SessionResult<Vec<CharacteristicEntry>> {
        let service = command::parse_uuid(service_uuid)?;
        let characteristics = self
            .ready_catalog()?
            .characteristics(&service)
            .ok_or_else(|| SessionError::InvalidTarget(format!("service {} not found", service)))?
            .to_vec();

        let _ = self.event_sender.send(AppEvent::Characteristics {
            service,
            characteristics: characteristics.clone(),
        });
        Ok(characteristics)
    }

    /// Flat list across all services, each tagged with its owner
    pub fn list_all_characteristics(&self) -> SessionResult<Vec<CharacteristicEntry>> {
        Ok(self.ready_catalog()?.all_characteristics().copied().collect())
    }

    pub fn select_service(&mut self, service_uuid: &str) -> SessionResult<Uuid> {
        let uuid = command::parse_uuid(service_uuid)?;
        self.selected_service = Some(uuid);
        self.send_log(&format!("Selected service {}", uuid), MessageSeverity::Info);
        Ok(uuid)
    }

    pub fn select_characteristic(&mut self, characteristic_uuid: &str) -> SessionResult<Uuid> {
        let uuid = command::parse_uuid(characteristic_uuid)?;
        self.selected_characteristic = Some(uuid);
        self.send_log(
            &format!("Selected characteristic {}", uuid),
            MessageSeverity::Info,
        );
        Ok(uuid)
    }

    pub fn selection(&self) -> (Option<Uuid>, Option<Uuid>) {
        (self.selected_service, self.selected_characteristic)
    }

    // --- Commands ---

    /// Target for volume directives: the selection when complete, otherwise
    /// the configured defaults
    pub fn volume_target(&self) -> CommandTarget {
        match (self.selected_service, self.selected_characteristic) {
            (Some(service), Some(characteristic)) => CommandTarget::new(service, characteristic),
            _ => CommandTarget::new(
                self.config.service_uuid,
                self.config.volume_characteristic_uuid,
            ),
        }
    }

    pub fn default_raw_target(&self) -> CommandTarget {
        CommandTarget::new(self.config.service_uuid, self.config.raw_characteristic_uuid)
    }

    pub async fn send_volume_directive(&self, direction: VolumeDirection) -> SessionResult<()> {
        let target = self.volume_target();
        let payload = CommandEncoder::encode_directive(&Directive::Volume(direction));
        info!(%target, %direction, "Sending volume directive");

        self.dispatcher
            .send(&self.connection, &target, &payload)
            .await?;
        self.send_log(
            &format!("Volume adjusted {}", direction),
            MessageSeverity::Success,
        );
        Ok(())
    }

    pub async fn send_raw_payload(
        &self,
        service_uuid: &str,
        characteristic_uuid: &str,
        text: &str,
    ) -> SessionResult<()> {
        self.ready_catalog()?;
        let target = CommandTarget::new(
            command::parse_uuid(service_uuid)?,
            command::parse_uuid(characteristic_uuid)?,
        );
        let payload = CommandEncoder::encode_text(text);
        info!(%target, bytes = payload.len(), "Sending raw payload");

        self.dispatcher
            .send(&self.connection, &target, &payload)
            .await?;
        self.send_log("Payload sent", MessageSeverity::Success);
        Ok(())
    }

    /// Stop scanning and release the connection
    pub async fn shutdown(&mut self) {
        info!("Shutting down BLE session");
        if let Err(e) = self.stop_scan().await {
            warn!("Failed to stop scan during shutdown: {}", e);
        }
        self.disconnect().await;
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;
    use crate::infrastructure::bluetooth::simulated::{SimulatedPeripheral, SimulatedTransport};
    use crate::infrastructure::permissions::StaticPermissionGate;

    fn session(sim: &SimulatedTransport) -> (BleSession, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = BleSession::new(
            Arc::new(sim.clone()),
            Box::new(StaticPermissionGate::granted()),
            SessionConfig::default(),
            tx,
        );
        (session, rx)
    }

    fn speakers() -> SimulatedTransport {
        let sim = SimulatedTransport::new();
        sim.add_peripheral(SimulatedPeripheral::speaker("AA:BB", Some("Speaker A")));
        sim.add_peripheral(SimulatedPeripheral::speaker("CC:DD", None));
        sim.set_advertise_on_scan(true);
        sim
    }

    #[test]
    fn test_config_from_settings() {
        let settings = BleSettings {
            scan_service_filter: Some("1843".to_string()),
            connect_timeout_ms: 2500,
            ..BleSettings::default()
        };

        let config = SessionConfig::try_from(&settings).unwrap();
        let defaults = SessionConfig::default();
        assert_eq!(config.service_uuid, defaults.service_uuid);
        assert_eq!(config.volume_characteristic_uuid, defaults.volume_characteristic_uuid);
        assert_eq!(config.raw_characteristic_uuid, defaults.raw_characteristic_uuid);
        assert_eq!(config.scan_service_filter, Some(defaults.service_uuid));
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn test_config_rejects_bad_uuid() {
        let settings = BleSettings {
            raw_characteristic_uuid: "not-a-uuid".to_string(),
            ..BleSettings::default()
        };
        assert!(SessionConfig::try_from(&settings).is_err());
    }

    #[tokio::test]
    async fn test_end_to_end_volume_up() {
        let sim = speakers();
        let (mut session, mut rx) = session(&sim);

        session.start_scan().await.unwrap();
        assert_eq!(session.pump_discovery().await.unwrap(), 2);
        let ids: Vec<String> = session.devices().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["AA:BB", "CC:DD"]);

        session.connect("AA:BB").await.unwrap();
        assert_eq!(session.connection().state, ConnectionState::Ready);
        assert_eq!(
            session.list_services().unwrap(),
            vec![command::from_short(0x1800), command::from_short(0x1843)]
        );

        session
            .send_volume_directive(VolumeDirection::Up)
            .await
            .unwrap();

        let writes = sim.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].peripheral_id, "AA:BB");
        assert_eq!(writes[0].target, session.volume_target());
        assert_eq!(writes[0].payload.as_base64(), "QVQrU1BLVk9MPSsNCg==");

        let mut success = false;
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::LogMessage(status) = event {
                if status.severity == MessageSeverity::Success && status.message.contains("Volume")
                {
                    success = true;
                }
            }
        }
        assert!(success);
    }

    #[tokio::test]
    async fn test_connect_requires_discovered_peripheral() {
        let sim = speakers();
        let (mut session, _rx) = session(&sim);

        let err = session.connect("AA:BB").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectError);
        assert!(sim.connects().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_connect_releases_abandoned_attempt() {
        let sim = speakers();
        sim.block_enumeration("AA:BB");
        let (mut session, _rx) = session(&sim);
        session.start_scan().await.unwrap();
        session.pump_discovery().await.unwrap();

        // The caller gives up while services are still being discovered
        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), session.connect("AA:BB")).await;
        assert!(abandoned.is_err());
        assert_eq!(session.connection().state, ConnectionState::Discovering);

        let err = session.connect("ZZ:ZZ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectError);
        assert_eq!(session.connection().state, ConnectionState::Disconnected);
        assert_eq!(sim.disconnects(), vec!["AA:BB"]);
    }

    #[tokio::test]
    async fn test_unknown_connect_keeps_ready_link() {
        let sim = speakers();
        let (mut session, _rx) = session(&sim);
        session.start_scan().await.unwrap();
        session.pump_discovery().await.unwrap();
        session.connect("AA:BB").await.unwrap();

        let err = session.connect("ZZ:ZZ").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectError);
        assert_eq!(session.connection().state, ConnectionState::Ready);
        assert!(sim.disconnects().is_empty());
    }

    #[tokio::test]
    async fn test_volume_follows_complete_selection() {
        let sim = speakers();
        let (mut session, _rx) = session(&sim);
        session.start_scan().await.unwrap();
        session.pump_discovery().await.unwrap();
        session.connect("CC:DD").await.unwrap();

        // Half a selection falls back to the defaults
        session.select_service("1843").unwrap();
        assert_eq!(
            session.volume_target(),
            CommandTarget::new(session.config().service_uuid, session.config().volume_characteristic_uuid)
        );

        session.select_characteristic("0x2B7B").unwrap();
        session
            .send_volume_directive(VolumeDirection::Down)
            .await
            .unwrap();

        let writes = sim.writes();
        assert_eq!(writes[0].target, session.default_raw_target());
        assert_eq!(writes[0].payload.as_base64(), "QVQrU1BLVk9MPS0NCg==");
    }

    #[tokio::test]
    async fn test_raw_payload_and_browsing() {
        let sim = speakers();
        let (mut session, mut rx) = session(&sim);
        session.start_scan().await.unwrap();
        session.pump_discovery().await.unwrap();
        session.connect("AA:BB").await.unwrap();

        let characteristics = session.list_characteristics("1843").unwrap();
        assert_eq!(
            characteristics
                .iter()
                .map(|c| c.uuid)
                .collect::<Vec<_>>(),
            vec![command::from_short(0x2b7e), command::from_short(0x2b7b)]
        );
        assert_eq!(session.list_all_characteristics().unwrap().len(), 3);
        assert_eq!(
            session.list_characteristics("180f").unwrap_err().kind(),
            ErrorKind::InvalidTarget
        );

        session
            .send_raw_payload(
                command::DEFAULT_SERVICE_UUID,
                command::RAW_DATA_CHAR_UUID,
                "hello",
            )
            .await
            .unwrap();
        assert_eq!(sim.writes()[0].payload.as_base64(), "aGVsbG8=");

        let err = session
            .send_raw_payload("1843", "zz", "hello")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTarget);

        let mut characteristics_event = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, AppEvent::Characteristics { .. }) {
                characteristics_event = true;
            }
        }
        assert!(characteristics_event);
    }

    #[tokio::test]
    async fn test_browsing_requires_ready() {
        let sim = speakers();
        let (session, _rx) = session(&sim);

        assert_eq!(session.list_services().unwrap_err().kind(), ErrorKind::NotConnected);
        assert_eq!(
            session.list_all_characteristics().unwrap_err().kind(),
            ErrorKind::NotConnected
        );
        assert_eq!(
            session
                .send_volume_directive(VolumeDirection::Up)
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::NotConnected
        );
        // The connection is checked before the target is parsed
        assert_eq!(
            session
                .send_raw_payload("1843", "zz", "hello")
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::NotConnected
        );
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn test_closed_discovery_stream_is_a_scan_failure() {
        let sim = speakers();
        let (mut session, mut rx) = session(&sim);
        session.start_scan().await.unwrap();
        sim.end_scan_stream();

        let err = session.pump_discovery().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ScanError);
        assert!(!session.is_scanning());

        let mut failures = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::ScanFailed(e) = event {
                failures.push(e.kind());
            }
        }
        assert_eq!(failures, vec![ErrorKind::ScanError]);
    }

    #[tokio::test]
    async fn test_adapter_power_off_ends_scan() {
        let sim = speakers();
        let (mut session, mut rx) = session(&sim);
        session.start_scan().await.unwrap();

        session.handle_adapter_change(AdapterState::PoweredOff).await;

        assert!(!session.is_scanning());
        let mut failure = None;
        while let Ok(event) = rx.try_recv() {
            if let AppEvent::ScanFailed(e) = event {
                failure = Some(e.kind());
            }
        }
        assert_eq!(failure, Some(ErrorKind::AdapterNotReady));
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let sim = speakers();
        let (mut session, _rx) = session(&sim);
        session.start_scan().await.unwrap();
        session.pump_discovery().await.unwrap();
        session.connect("AA:BB").await.unwrap();

        session.shutdown().await;

        assert!(!session.is_scanning());
        assert!(!sim.is_scanning());
        assert_eq!(session.connection().state, ConnectionState::Disconnected);
        assert_eq!(sim.disconnects(), vec!["AA:BB"]);
    }
}
