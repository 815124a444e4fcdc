//! BLE remote controller core: discovery, connection lifecycle, GATT
//! enumeration and command dispatch for speaker-style peripherals.

pub mod domain;
pub mod infrastructure;

pub use domain::error::{ErrorKind, SessionError, SessionResult};
pub use domain::models::{AppEvent, SessionCommand};
pub use infrastructure::bluetooth::{BleSession, SessionConfig, SessionWorker};
