//! Transport seam between the session core and a concrete BLE stack.
//!
//! A backend implements [`BleTransport`] for the adapter and hands out one
//! [`ConnectionHandle`] per established link. The handle exposes exactly the
//! GATT operations the core needs.

use crate::domain::command::EncodedPayload;
use crate::domain::models::{AdapterState, CommandTarget, DiscoveryEvent, PeripheralRef};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No Bluetooth adapter found")]
    NoAdapter,

    #[error("Peripheral {0} is not reachable")]
    PeripheralNotFound(String),

    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),

    #[error("Characteristic {0} not found")]
    CharacteristicNotFound(Uuid),

    #[error("GATT communication failed: {0}")]
    Gatt(String),

    #[error("Link to peripheral was lost")]
    LinkLost,

    #[error("Platform error: {0}")]
    Platform(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Discovery events in arrival order. Dropping the receiver ends the stream.
pub type DiscoveryStream = mpsc::UnboundedReceiver<DiscoveryEvent>;

#[async_trait]
pub trait BleTransport: Send + Sync {
    async fn adapter_state(&self) -> TransportResult<AdapterState>;

    /// Adapter power-state change notifications
    fn watch_adapter_state(&self) -> watch::Receiver<AdapterState>;

    async fn start_scan(&self) -> TransportResult<DiscoveryStream>;

    /// Halting an idle radio is not an error
    async fn stop_scan(&self) -> TransportResult<()>;

    /// Open a link. The caller may drop this future on timeout or
    /// supersession; a link opened by a dropped attempt must be closed by
    /// the backend.
    async fn connect(&self, peripheral: &PeripheralRef)
        -> TransportResult<Box<dyn ConnectionHandle>>;
}

/// An established link to one peripheral
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Primary services in the order the peripheral reports them
    async fn services(&self) -> TransportResult<Vec<Uuid>>;

    /// Characteristics of one service in reported order
    async fn characteristics(&self, service_uuid: Uuid) -> TransportResult<Vec<Uuid>>;

    /// Write with response; resolves once the peripheral acknowledged
    async fn write_with_response(
        &self,
        target: &CommandTarget,
        payload: &EncodedPayload,
    ) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;
}
