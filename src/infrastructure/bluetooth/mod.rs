//! Bluetooth Module
//!
//! BLE session lifecycle and command dispatch for remote speakers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │            SessionWorker  ->  BleSession                 │
//! │  (command loop)      (public API for the application)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!      ┌────────────┬───┴────────┬─────────────┐
//!      ▼            ▼            ▼             ▼
//! ┌─────────┐  ┌──────────┐  ┌────────────┐  ┌────────────┐
//! │ Adapter │  │ Scanner  │  │ Connection │  │ Dispatcher │
//! └────┬────┘  └────┬─────┘  └─────┬──────┘  └─────┬──────┘
//!      └────────────┴──────┬───────┴───────────────┘
//!                          ▼
//!                ┌───────────────────┐
//!                │   BleTransport    │
//!                │ WinRT / btleplug  │
//!                │    / simulated    │
//!                └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Backend seam: radio, discovery and GATT links
//! - [`adapter`] - Adapter power-state gate
//! - [`scanner`] - Discovery sessions and the device registry
//! - [`connection`] - Connection state machine and GATT enumeration
//! - [`dispatcher`] - Acknowledged characteristic writes
//! - [`service`] - Session coordinator
//! - [`worker`] - Command loop with connect supersession

pub mod adapter;
pub mod connection;
pub mod dispatcher;
pub mod scanner;
pub mod service;
pub mod simulated;
pub mod transport;
pub mod worker;

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;
#[cfg(windows)]
pub mod winrt;

pub use service::{BleSession, SessionConfig};
pub use worker::SessionWorker;

use std::sync::Arc;
use transport::BleTransport;

/// Backend for the current platform
#[cfg(windows)]
pub async fn platform_transport() -> anyhow::Result<Arc<dyn BleTransport>> {
    Ok(Arc::new(winrt::WinRtTransport::new()))
}

/// Backend for the current platform
#[cfg(all(not(windows), feature = "btleplug"))]
pub async fn platform_transport() -> anyhow::Result<Arc<dyn BleTransport>> {
    use anyhow::Context;

    let transport = btleplug_backend::BtleplugTransport::new()
        .await
        .context("Failed to open btleplug manager")?;
    Ok(Arc::new(transport))
}

/// Backend for the current platform
#[cfg(all(not(windows), not(feature = "btleplug")))]
pub async fn platform_transport() -> anyhow::Result<Arc<dyn BleTransport>> {
    tracing::warn!("No BLE backend compiled in; using the simulated transport");
    Ok(Arc::new(simulated::SimulatedTransport::demo()))
}
