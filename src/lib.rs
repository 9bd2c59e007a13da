//! mbt: production test station for Monoberry boards
//!
//! Drives one board at a time through a fixed sequence: UART connection,
//! label scanning, registration with the provisioning backend, optional
//! firmware flashing and boot prompt verification. The `core` module holds
//! the workflow engine; `protocol` holds the serial, HTTP and process
//! collaborators it coordinates.

#[doc(hidden)]
pub mod boot;
pub mod cli;
pub mod config;
pub mod console;
pub mod core;
pub mod protocol;

pub use config::StationConfig;
