//! Writes encoded payloads to a characteristic of the ready connection.

use crate::domain::command::EncodedPayload;
use crate::domain::error::{SessionError, SessionResult};
use crate::domain::models::CommandTarget;
use crate::infrastructure::bluetooth::connection::ConnectionManager;
use std::time::Duration;
use tracing::{debug, error};

pub struct CommandDispatcher {
    write_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(write_timeout: Duration) -> Self {
        Self { write_timeout }
    }

    /// Write with response and wait for the acknowledgement.
    ///
    /// Fails with `NotConnected` outside `Ready` and with `InvalidTarget` when
    /// the catalog does not hold the target. Nothing is retried.
    pub async fn send(
        &self,
        connection: &ConnectionManager,
        target: &CommandTarget,
        payload: &EncodedPayload,
    ) -> SessionResult<()> {
        let (handle, catalog) = connection.ready_link().ok_or_else(|| {
            SessionError::NotConnected(format!("connection is {:?}", connection.state()))
        })?;

        let service = catalog.service(&target.service_uuid).ok_or_else(|| {
            SessionError::InvalidTarget(format!("service {} not found", target.service_uuid))
        })?;
        if !service.contains(&target.characteristic_uuid) {
            return Err(SessionError::InvalidTarget(format!(
                "characteristic {} not found in service {}",
                target.characteristic_uuid, target.service_uuid
            )));
        }

        debug!(%target, bytes = payload.len(), "Writing payload");
        match tokio::time::timeout(
            self.write_timeout,
            handle.write_with_response(target, payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(%target, "Write failed: {}", e);
                Err(SessionError::WriteError(e.to_string()))
            }
            Err(_) => {
                error!(%target, "Write was not acknowledged");
                Err(SessionError::WriteError(format!(
                    "no acknowledgement within {} ms",
                    self.write_timeout.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::command::{self, CommandEncoder, Directive, VolumeDirection};
    use crate::domain::error::ErrorKind;
    use crate::domain::models::{AppEvent, PeripheralRef};
    use crate::infrastructure::bluetooth::connection::ConnectionConfig;
    use crate::infrastructure::bluetooth::simulated::{SimulatedPeripheral, SimulatedTransport};
    use tokio::sync::mpsc;

    fn volume_target() -> CommandTarget {
        CommandTarget::new(command::from_short(0x1843), command::from_short(0x2b7e))
    }

    fn volume_up() -> EncodedPayload {
        CommandEncoder::encode_directive(&Directive::Volume(VolumeDirection::Up))
    }

    async fn ready() -> (
        SimulatedTransport,
        ConnectionManager,
        mpsc::UnboundedReceiver<AppEvent>,
    ) {
        let sim = SimulatedTransport::new();
        sim.add_peripheral(SimulatedPeripheral::speaker("AA:BB", Some("Speaker")));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut connection = ConnectionManager::new(ConnectionConfig::default(), tx);
        connection
            .connect(&sim, PeripheralRef::new("AA:BB", None))
            .await
            .unwrap();
        (sim, connection, rx)
    }

    #[tokio::test]
    async fn test_send_writes_acknowledged_payload() {
        let (sim, connection, _rx) = ready().await;
        let dispatcher = CommandDispatcher::new(Duration::from_secs(1));

        dispatcher
            .send(&connection, &volume_target(), &volume_up())
            .await
            .unwrap();

        let writes = sim.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].target, volume_target());
        assert_eq!(writes[0].payload.as_base64(), "QVQrU1BLVk9MPSsNCg==");
    }

    #[tokio::test]
    async fn test_send_requires_ready_connection() {
        let sim = SimulatedTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::new(ConnectionConfig::default(), tx);
        let dispatcher = CommandDispatcher::new(Duration::from_secs(1));

        let err = dispatcher
            .send(&connection, &volume_target(), &volume_up())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotConnected);
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn test_send_after_disconnect_is_not_connected() {
        let (sim, mut connection, _rx) = ready().await;
        connection.disconnect().await;
        let dispatcher = CommandDispatcher::new(Duration::from_secs(1));

        let err = dispatcher
            .send(&connection, &volume_target(), &volume_up())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::NotConnected);
        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn test_target_outside_catalog_is_invalid() {
        let (sim, connection, _rx) = ready().await;
        let dispatcher = CommandDispatcher::new(Duration::from_secs(1));

        let unknown_service =
            CommandTarget::new(command::from_short(0x180f), command::from_short(0x2a19));
        let err = dispatcher
            .send(&connection, &unknown_service, &volume_up())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTarget);

        // Characteristic exists, but under a different service
        let misplaced =
            CommandTarget::new(command::from_short(0x1800), command::from_short(0x2b7e));
        let err = dispatcher
            .send(&connection, &misplaced, &volume_up())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTarget);

        assert!(sim.writes().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure_is_write_error() {
        let (sim, connection, _rx) = ready().await;
        sim.fail_writes("ATT error 0x03");
        let dispatcher = CommandDispatcher::new(Duration::from_secs(1));

        let err = dispatcher
            .send(&connection, &volume_target(), &volume_up())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::WriteError);
        assert!(err.cause().contains("ATT error 0x03"));
    }

    #[tokio::test]
    async fn test_missing_acknowledgement_times_out() {
        let (sim, connection, _rx) = ready().await;
        sim.stall_writes();
        let dispatcher = CommandDispatcher::new(Duration::from_millis(30));

        let err = dispatcher
            .send(&connection, &volume_target(), &volume_up())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::WriteError);
        assert!(sim.writes().is_empty());
    }
}
