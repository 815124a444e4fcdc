//! Domain types shared by the BLE session core and its callers.

pub mod catalog;
pub mod command;
pub mod error;
pub mod models;
pub mod registry;
pub mod settings;
