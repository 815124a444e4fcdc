//! Bluetooth adapter power-state monitor.

use crate::domain::error::{SessionError, SessionResult};
use crate::domain::models::AdapterState;
use crate::infrastructure::bluetooth::transport::BleTransport;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct AdapterMonitor {
    transport: Arc<dyn BleTransport>,
}

impl AdapterMonitor {
    pub fn new(transport: Arc<dyn BleTransport>) -> Self {
        Self { transport }
    }

    /// Current adapter state; a failed query reads as `Unknown`
    pub async fn state(&self) -> AdapterState {
        match self.transport.adapter_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Failed to query adapter state: {}", e);
                AdapterState::Unknown
            }
        }
    }

    pub async fn is_powered_on(&self) -> bool {
        self.state().await == AdapterState::PoweredOn
    }

    /// Gate for operations that need the radio
    pub async fn ensure_powered_on(&self) -> SessionResult<()> {
        let state = self
            .transport
            .adapter_state()
            .await
            .map_err(|e| SessionError::AdapterNotReady(e.to_string()))?;
        debug!(?state, "Adapter state checked");

        if state == AdapterState::PoweredOn {
            Ok(())
        } else {
            Err(SessionError::AdapterNotReady(format!(
                "adapter is {:?}",
                state
            )))
        }
    }

    /// Change notifications, starting from the current state
    pub fn subscribe(&self) -> watch::Receiver<AdapterState> {
        self.transport.watch_adapter_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorKind;
    use crate::infrastructure::bluetooth::simulated::SimulatedTransport;

    #[tokio::test]
    async fn test_powered_on_gate() {
        let sim = SimulatedTransport::new();
        let monitor = AdapterMonitor::new(Arc::new(sim.clone()));
        assert!(monitor.is_powered_on().await);
        assert!(monitor.ensure_powered_on().await.is_ok());

        sim.set_adapter_state(AdapterState::PoweredOff);
        assert!(!monitor.is_powered_on().await);
        let err = monitor.ensure_powered_on().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterNotReady);
        assert!(err.cause().contains("PoweredOff"));
    }

    #[tokio::test]
    async fn test_subscribe_sees_changes() {
        let sim = SimulatedTransport::new();
        let monitor = AdapterMonitor::new(Arc::new(sim.clone()));
        let mut changes = monitor.subscribe();

        sim.set_adapter_state(AdapterState::Unauthorized);
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow(), AdapterState::Unauthorized);
    }
}
