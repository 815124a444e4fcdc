//! BLE Connection Module
//!
//! Owns the single active connection: link establishment, GATT enumeration
//! and teardown. Transitions run strictly in sequence:
//!
//! ```text
//! Disconnected -> Connecting -> Discovering -> Ready
//!                     |             |
//!                     +-> Failed <--+
//! ```
//!
//! `disconnect` is valid from every state and always ends in `Disconnected`.

use crate::domain::catalog::GattCatalog;
use crate::domain::error::{SessionError, SessionResult};
use crate::domain::models::{
    AppEvent, ConnectionSnapshot, ConnectionState, MessageSeverity, PeripheralRef, StatusMessage,
};
use crate::infrastructure::bluetooth::transport::{BleTransport, ConnectionHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Upper bound for link establishment
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

enum Phase {
    Disconnected,
    Connecting {
        peripheral: PeripheralRef,
    },
    Discovering {
        peripheral: PeripheralRef,
        handle: Box<dyn ConnectionHandle>,
    },
    Ready {
        peripheral: PeripheralRef,
        handle: Box<dyn ConnectionHandle>,
        catalog: GattCatalog,
    },
    Failed {
        peripheral: PeripheralRef,
        error: SessionError,
    },
}

impl Phase {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Disconnected => ConnectionState::Disconnected,
            Self::Connecting { .. } => ConnectionState::Connecting,
            Self::Discovering { .. } => ConnectionState::Discovering,
            Self::Ready { .. } => ConnectionState::Ready,
            Self::Failed { .. } => ConnectionState::Failed,
        }
    }

    fn peripheral(&self) -> Option<&PeripheralRef> {
        match self {
            Self::Disconnected => None,
            Self::Connecting { peripheral }
            | Self::Discovering { peripheral, .. }
            | Self::Ready { peripheral, .. }
            | Self::Failed { peripheral, .. } => Some(peripheral),
        }
    }

    fn into_handle(self) -> Option<Box<dyn ConnectionHandle>> {
        match self {
            Self::Discovering { handle, .. } | Self::Ready { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

pub struct ConnectionManager {
    phase: Phase,
    config: ConnectionConfig,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            phase: Phase::Disconnected,
            config,
            event_sender,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.phase.state()
    }

    pub fn peripheral(&self) -> Option<&PeripheralRef> {
        self.phase.peripheral()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.phase.state(),
            peripheral: self.phase.peripheral().cloned(),
            failure: match &self.phase {
                Phase::Failed { error, .. } => Some(error.clone()),
                _ => None,
            },
        }
    }

    /// Catalog of the current connection; only available once `Ready`
    pub fn catalog(&self) -> Option<&GattCatalog> {
        match &self.phase {
            Phase::Ready { catalog, .. } => Some(catalog),
            _ => None,
        }
    }

    pub(crate) fn ready_link(&self) -> Option<(&dyn ConnectionHandle, &GattCatalog)> {
        match &self.phase {
            Phase::Ready {
                handle, catalog, ..
            } => Some((handle.as_ref(), catalog)),
            _ => None,
        }
    }

    /// Connect to a peripheral and enumerate its GATT database.
    ///
    /// Any previous attempt or connection is torn down first. If this future
    /// is dropped mid-way the established link stays recorded, so the next
    /// `connect` or `disconnect` releases it.
    pub async fn connect(
        &mut self,
        transport: &dyn BleTransport,
        peripheral: PeripheralRef,
    ) -> SessionResult<()> {
        self.release().await;

        info!(id = %peripheral.id, "Connecting to {}", peripheral.label());
        self.send_log(
            &format!("Connecting to {}...", peripheral.label()),
            MessageSeverity::Info,
        );

        // Step 1: Establish the link
        self.enter(Phase::Connecting {
            peripheral: peripheral.clone(),
        });
        let attempt =
            tokio::time::timeout(self.config.connect_timeout, transport.connect(&peripheral)).await;
        let handle = match attempt {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                return Err(self.fail(peripheral, SessionError::ConnectError(e.to_string())));
            }
            Err(_) => {
                let cause = format!(
                    "no link after {} ms",
                    self.config.connect_timeout.as_millis()
                );
                return Err(self.fail(peripheral, SessionError::ConnectError(cause)));
            }
        };
        info!(id = %peripheral.id, "Link established");

        // Step 2: Enumerate services, then characteristics of each service
        self.enter(Phase::Discovering {
            peripheral: peripheral.clone(),
            handle,
        });
        let enumeration = match &self.phase {
            Phase::Discovering { handle, .. } => enumerate(handle.as_ref()).await,
            _ => Err(SessionError::EnumerationError(
                "link released during discovery".to_string(),
            )),
        };

        // Step 3: Publish the catalog, or release the link
        match enumeration {
            Ok(catalog) => {
                debug_assert!(catalog.is_consistent());
                match self.take_phase().into_handle() {
                    Some(handle) => {
                        self.enter(Phase::Ready {
                            peripheral,
                            handle,
                            catalog,
                        });
                        Ok(())
                    }
                    None => Err(self.fail(
                        peripheral,
                        SessionError::EnumerationError("link released during discovery".to_string()),
                    )),
                }
            }
            Err(e) => {
                if let Some(handle) = self.take_phase().into_handle() {
                    if let Err(de) = handle.disconnect().await {
                        warn!("Failed to release link after enumeration error: {}", de);
                    }
                }
                Err(self.fail(peripheral, e))
            }
        }
    }

    /// Tear down whatever is current and end in `Disconnected`
    pub async fn disconnect(&mut self) {
        let was = self.state();
        self.release().await;
        if was != ConnectionState::Disconnected {
            info!("Disconnected from device");
            self.send_log("Disconnected from device", MessageSeverity::Info);
        }
    }

    /// Release the link if one is held. Emits a state change unless already
    /// disconnected.
    async fn release(&mut self) {
        let previous = self.take_phase();
        if matches!(previous, Phase::Disconnected) {
            return;
        }

        let id = previous.peripheral().map(|p| p.id.clone());
        if let Some(handle) = previous.into_handle() {
            debug!(?id, "Releasing link");
            if let Err(e) = handle.disconnect().await {
                warn!("Failed to release link cleanly: {}", e);
                self.send_log(
                    &format!("Link release reported an error: {}", e),
                    MessageSeverity::Warning,
                );
            }
        }
        self.notify_state();
    }

    fn take_phase(&mut self) -> Phase {
        std::mem::replace(&mut self.phase, Phase::Disconnected)
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        self.notify_state();

        if let Phase::Ready {
            peripheral,
            catalog,
            ..
        } = &self.phase
        {
            info!(
                id = %peripheral.id,
                services = catalog.len(),
                "GATT catalog ready"
            );
            let _ = self.event_sender.send(AppEvent::CatalogReady(catalog.clone()));
            self.send_log(
                &format!("Connected to {}", peripheral.label()),
                MessageSeverity::Success,
            );
        }
    }

    fn fail(&mut self, peripheral: PeripheralRef, error: SessionError) -> SessionError {
        error!(id = %peripheral.id, "Connection failed: {}", error);
        self.send_log(&error.to_string(), MessageSeverity::Error);
        self.enter(Phase::Failed {
            peripheral,
            error: error.clone(),
        });
        error
    }

    fn notify_state(&self) {
        let _ = self
            .event_sender
            .send(AppEvent::ConnectionState(self.snapshot()));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

/// Full service-then-characteristic enumeration. Any failure aborts the
/// whole catalog.
async fn enumerate(handle: &dyn ConnectionHandle) -> SessionResult<GattCatalog> {
    let services = handle
        .services()
        .await
        .map_err(|e| SessionError::EnumerationError(format!("service discovery: {}", e)))?;
    debug!("Found {} services", services.len());

    let mut entries = Vec::with_capacity(services.len());
    for service in services {
        let characteristics = handle.characteristics(service).await.map_err(|e| {
            SessionError::EnumerationError(format!("characteristics of {}: {}", service, e))
        })?;
        debug!(%service, "Found {} characteristics", characteristics.len());
        entries.push((service, characteristics));
    }

    Ok(entries.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command;
    use crate::domain::error::ErrorKind;
    use crate::infrastructure::bluetooth::simulated::{SimulatedPeripheral, SimulatedTransport};

    fn sim() -> SimulatedTransport {
        let sim = SimulatedTransport::new();
        sim.add_peripheral(SimulatedPeripheral::speaker("AA:BB", Some("Speaker A")));
        sim.add_peripheral(SimulatedPeripheral::speaker("CC:DD", Some("Speaker B")));
        sim
    }

    fn manager() -> (ConnectionManager, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = ConnectionConfig {
            connect_timeout: Duration::from_millis(200),
        };
        (ConnectionManager::new(config, tx), rx)
    }

    fn peripheral(id: &str) -> PeripheralRef {
        PeripheralRef::new(id, None)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[AppEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|e| match e {
                AppEvent::ConnectionState(snapshot) => Some(snapshot.state),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_connect_reaches_ready_with_catalog() {
        let sim = sim();
        let (mut manager, mut rx) = manager();

        manager.connect(&sim, peripheral("AA:BB")).await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Ready);
        let catalog = manager.catalog().unwrap();
        assert!(catalog.is_consistent());
        assert_eq!(
            catalog.service_uuids(),
            vec![command::from_short(0x1800), command::from_short(0x1843)]
        );
        assert_eq!(
            states(&drain(&mut rx)),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Discovering,
                ConnectionState::Ready
            ]
        );
    }

    #[tokio::test]
    async fn test_link_failure_enters_failed() {
        let sim = sim();
        sim.fail_connect("AA:BB", "page timeout");
        let (mut manager, _rx) = manager();

        let err = manager.connect(&sim, peripheral("AA:BB")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConnectError);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert_eq!(manager.snapshot().failure, Some(err));
        assert!(manager.catalog().is_none());

        // Retrying is an explicit caller action
        assert_eq!(sim.connects(), vec!["AA:BB"]);
    }

    #[tokio::test]
    async fn test_connect_timeout_releases_half_open_link() {
        let sim = sim();
        sim.stall_connect("AA:BB");
        let (mut manager, mut rx) = manager();

        let err = manager.connect(&sim, peripheral("AA:BB")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConnectError);
        assert!(err.cause().contains("200 ms"));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert_eq!(manager.snapshot().failure, Some(err));
        assert!(manager.catalog().is_none());
        assert_eq!(sim.disconnects(), vec!["AA:BB"]);
        assert_eq!(
            states(&drain(&mut rx)),
            vec![ConnectionState::Connecting, ConnectionState::Failed]
        );
    }

    #[tokio::test]
    async fn test_partial_enumeration_is_a_failure() {
        let sim = sim();
        sim.fail_enumeration("AA:BB", command::from_short(0x1843), "ATT error 0x0e");
        let (mut manager, mut rx) = manager();

        let err = manager.connect(&sim, peripheral("AA:BB")).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::EnumerationError);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(manager.catalog().is_none());
        assert_eq!(sim.disconnects(), vec!["AA:BB"]);
        assert!(!drain(&mut rx)
            .iter()
            .any(|e| matches!(e, AppEvent::CatalogReady(_))));
    }

    #[tokio::test]
    async fn test_unknown_peripheral_is_connect_error() {
        let sim = sim();
        let (mut manager, _rx) = manager();

        let err = manager.connect(&sim, peripheral("99:99")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectError);
    }

    #[tokio::test]
    async fn test_connect_supersedes_attempt_in_discovery() {
        let sim = sim();
        sim.block_enumeration("AA:BB");
        let (mut manager, mut rx) = manager();

        {
            let attempt = manager.connect(&sim, peripheral("AA:BB"));
            tokio::pin!(attempt);
            tokio::select! {
                biased;
                _ = &mut attempt => panic!("blocked enumeration cannot complete"),
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
        assert_eq!(manager.state(), ConnectionState::Discovering);

        manager.connect(&sim, peripheral("CC:DD")).await.unwrap();

        assert_eq!(manager.state(), ConnectionState::Ready);
        assert_eq!(manager.peripheral().unwrap().id, "CC:DD");
        assert_eq!(sim.disconnects(), vec!["AA:BB"]);

        let events = drain(&mut rx);
        let catalogs = events
            .iter()
            .filter(|e| matches!(e, AppEvent::CatalogReady(_)))
            .count();
        assert_eq!(catalogs, 1);
        for event in &events {
            if let AppEvent::ConnectionState(snapshot) = event {
                if snapshot.state == ConnectionState::Ready {
                    assert_eq!(snapshot.peripheral.as_ref().unwrap().id, "CC:DD");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_disconnect_from_every_state() {
        let sim = sim();
        sim.fail_connect("EE:FF", "refused");
        sim.block_enumeration("CC:DD");
        let (mut manager, _rx) = manager();

        // Disconnected
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // Ready
        manager.connect(&sim, peripheral("AA:BB")).await.unwrap();
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.catalog().is_none());

        // Failed
        let _ = manager.connect(&sim, peripheral("EE:FF")).await;
        assert_eq!(manager.state(), ConnectionState::Failed);
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // Discovering (attempt abandoned mid-enumeration)
        {
            let attempt = manager.connect(&sim, peripheral("CC:DD"));
            tokio::pin!(attempt);
            tokio::select! {
                biased;
                _ = &mut attempt => panic!("blocked enumeration cannot complete"),
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
        assert_eq!(manager.state(), ConnectionState::Discovering);
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        assert_eq!(sim.disconnects(), vec!["AA:BB", "CC:DD"]);
    }
}
