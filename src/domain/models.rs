use crate::domain::catalog::{CharacteristicEntry, GattCatalog};
use crate::domain::command::VolumeDirection;
use crate::domain::error::SessionError;
use std::fmt;
use uuid::Uuid;

/// A discovered peripheral. Identity is `id`; the entry is never updated
/// after it is first seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralRef {
    pub id: String,
    pub display_name: Option<String>,
}

impl PeripheralRef {
    pub fn new(id: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.filter(|name| !name.is_empty()),
        }
    }

    /// Name suitable for log lines
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or("Unnamed device")
    }
}

/// Raw discovery output of a transport
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Found {
        peripheral: PeripheralRef,
        advertised_services: Vec<Uuid>,
        rssi: Option<i16>,
    },
    /// The radio reported a failure; the scan is over
    Failed { cause: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Discovering,
    Ready,
    Failed,
}

/// Read-only view of the connection owned by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub peripheral: Option<PeripheralRef>,
    pub failure: Option<SessionError>,
}

impl ConnectionSnapshot {
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            peripheral: None,
            failure: None,
        }
    }
}

/// Service/characteristic pair a command is written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandTarget {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
}

impl CommandTarget {
    pub fn new(service_uuid: Uuid, characteristic_uuid: Uuid) -> Self {
        Self {
            service_uuid,
            characteristic_uuid,
        }
    }
}

impl fmt::Display for CommandTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_uuid, self.characteristic_uuid)
    }
}

/// Commands accepted by the session worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    StartScan,
    StopScan,
    RefreshScan,
    Connect(String),
    Disconnect,
    ListServices,
    ListCharacteristics(String),
    SelectService(String),
    SelectCharacteristic(String),
    SendVolume(VolumeDirection),
    SendRaw {
        service: String,
        characteristic: String,
        text: String,
    },
    Quit,
}

impl SessionCommand {
    /// Commands that cancel an in-flight connection attempt
    pub fn supersedes_connect(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Disconnect | Self::Quit)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::StartScan => "start_scan",
            Self::StopScan => "stop_scan",
            Self::RefreshScan => "refresh_scan",
            Self::Connect(_) => "connect",
            Self::Disconnect => "disconnect",
            Self::ListServices => "list_services",
            Self::ListCharacteristics(_) => "list_characteristics",
            Self::SelectService(_) => "select_service",
            Self::SelectCharacteristic(_) => "select_characteristic",
            Self::SendVolume(_) => "send_volume_directive",
            Self::SendRaw { .. } => "send_raw_payload",
            Self::Quit => "quit",
        }
    }
}

/// Events published to the presentation layer
#[derive(Debug, Clone)]
pub enum AppEvent {
    DevicesUpdated(Vec<PeripheralRef>),
    ScanState(bool),
    ScanFailed(SessionError),
    AdapterState(AdapterState),
    ConnectionState(ConnectionSnapshot),
    CatalogReady(GattCatalog),
    Services(Vec<Uuid>),
    Characteristics {
        service: Uuid,
        characteristics: Vec<CharacteristicEntry>,
    },
    OperationFailed {
        operation: &'static str,
        error: SessionError,
    },
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
