//! Transport layer for the nametag fleet driver
//!
//! This crate owns the serial-attached Bluefruit adapter: a line-oriented
//! full-duplex channel multiplexing BLE scans, connections and GATT
//! traffic for every nearby device.
//!
//! - [`serial`]: the raw serial line channel (115 200 8N1)
//! - [`records`]: inbound logfmt record parsing and percent byte codec
//! - [`adapter`]: the adapter driver — device table, event dispatch,
//!   per-device completion futures, scoped connections
//! - [`discovery`]: USB serial-port discovery for adapter hot-plug
//!
//! Everything here is single-threaded cooperative: construct the adapter
//! inside a `tokio::task::LocalSet` and share it via `Rc`.

pub mod adapter;
pub mod discovery;
pub mod error;
pub mod records;
pub mod serial;

pub use adapter::{limits, Adapter, Connection, Device};
pub use discovery::{find_adapter_port, DEFAULT_PORT_PATTERN};
pub use error::TransportError;
pub use serial::SerialLine;
