//! Transport adapters
//!
//! This module defines the [`Transport`] trait the protocol engine talks to,
//! and its implementations:
//!
//! - [`LineTransport`]: delimiter-framed lines over any async byte stream
//! - [`serial_adapter`]: RS-232/USB-serial ports (feature `instrument_serial`)
//! - [`mock`]: an in-process controller simulator for tests and dry runs

/// Line framing over any async byte stream.
pub mod line_transport;
/// In-process simulated controller.
pub mod mock;
/// Serial port transport and controller discovery.
pub mod serial_adapter;

pub use line_transport::{LineTransport, Purge};
pub use mock::{SimulatedStage, SimulatorSettings};

use crate::error::TransportError;
use async_trait::async_trait;

/// A line-oriented, half-duplex link to the controller.
///
/// Implementations frame outgoing lines with the command terminator and split
/// incoming bytes on the response delimiter. They do no locking of their own;
/// the engine owns the only handle.
#[async_trait]
pub trait Transport: Send {
    /// Write one command line, appending the terminator.
    async fn write_line(&mut self, line: &str) -> Result<(), TransportError>;

    /// Read one reply line, without its delimiter.
    ///
    /// Must be cancel safe: if the future is dropped mid-line, the bytes read
    /// so far are kept for the next call.
    async fn read_line(&mut self) -> Result<String, TransportError>;

    /// Discard anything pending in either direction.
    async fn clear(&mut self) -> Result<(), TransportError>;

    /// Human-readable name for logs (port path, "simulator", ...).
    fn describe(&self) -> String;
}
