//! Serial port transport and controller discovery.
//!
//! The controller speaks 8N1 without flow control at 9600 baud out of the
//! box; the rate can be changed on the device, so discovery walks a list of
//! candidate rates on every port.

use super::{LineTransport, Transport};
use crate::error::StageResult;
use std::time::Duration;
#[cfg_attr(not(feature = "instrument_serial"), allow(unused_imports))]
use tracing::{debug, info};

#[cfg(feature = "instrument_serial")]
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Baud rates tried by [`discover_controller`], most likely first.
pub const DEFAULT_BAUD_RATES: [u32; 4] = [9600, 19200, 38400, 115200];

/// Line transport over an open serial port.
#[cfg(feature = "instrument_serial")]
pub type SerialTransport = LineTransport<SerialStream>;

/// Builder for [`SerialTransport`].
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use stage_scan::adapters::serial_adapter::SerialTransportBuilder;
///
/// let transport = SerialTransportBuilder::new("/dev/ttyUSB0", 9600)
///     .with_timeout(Duration::from_millis(500))
///     .open();
/// ```
#[derive(Debug, Clone)]
pub struct SerialTransportBuilder {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    line_terminator: String,
    response_delimiter: u8,
}

impl SerialTransportBuilder {
    /// Create a builder for `port_name` at `baud_rate`.
    ///
    /// Default configuration:
    /// * timeout: 1 second (driver-level; the engine applies its own per read)
    /// * line_terminator: "\r"
    /// * response_delimiter: b'\r'
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_secs(1),
            line_terminator: "\r".to_string(),
            response_delimiter: b'\r',
        }
    }

    /// Set the driver read timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the line terminator string for commands.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Set the response delimiter byte.
    pub fn with_response_delimiter(mut self, delimiter: u8) -> Self {
        self.response_delimiter = delimiter;
        self
    }

    /// Port path this builder opens.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Open the port.
    #[cfg(feature = "instrument_serial")]
    pub fn open(self) -> StageResult<SerialTransport> {
        let stream = tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(crate::error::TransportError::from)?;

        info!(
            "Serial port '{}' opened at {} baud",
            self.port_name, self.baud_rate
        );
        Ok(LineTransport::new(stream, self.port_name)
            .with_terminator(self.line_terminator)
            .with_delimiter(self.response_delimiter))
    }

    /// Without serial support there is nothing to open.
    #[cfg(not(feature = "instrument_serial"))]
    pub fn open(self) -> StageResult<LineTransport<tokio::io::DuplexStream>> {
        Err(crate::error::StageError::Config(format!(
            "cannot open '{}': built without the instrument_serial feature",
            self.port_name
        )))
    }
}

/// A port that answered the identification probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPort {
    pub port_name: String,
    pub baud_rate: u32,
    /// Raw reply to the probe (serial number, or `R` on older firmware).
    pub reply: String,
}

/// True when a reply to `SERIAL` came from the stage controller.
///
/// Current firmware answers with the serial number; older units only
/// acknowledge.
pub fn looks_like_controller(reply: &str) -> bool {
    let reply = reply.trim();
    reply == "R" || (!reply.is_empty() && reply.bytes().all(|b| b.is_ascii_digit()))
}

/// Probe one open transport. Any failure simply means "not our device".
pub async fn probe<T: Transport + ?Sized>(transport: &mut T, probe_timeout: Duration) -> Option<String> {
    transport.clear().await.ok()?;
    transport.write_line("SERIAL").await.ok()?;
    let reply = tokio::time::timeout(probe_timeout, transport.read_line())
        .await
        .ok()?
        .ok()?;
    looks_like_controller(&reply).then_some(reply)
}

/// Scan every serial port at each of `baud_rates` for a controller.
#[cfg(feature = "instrument_serial")]
pub async fn discover_controller(
    baud_rates: &[u32],
    probe_timeout: Duration,
) -> StageResult<Option<DiscoveredPort>> {
    let ports = tokio_serial::available_ports().map_err(crate::error::TransportError::from)?;
    info!("Probing {} serial port(s) for a stage controller", ports.len());

    for port in ports {
        for &baud_rate in baud_rates {
            let mut transport = match SerialTransportBuilder::new(&port.port_name, baud_rate)
                .with_timeout(probe_timeout)
                .open()
            {
                Ok(t) => t,
                Err(e) => {
                    debug!(port = %port.port_name, baud_rate, "skipping port: {}", e);
                    // A port that cannot be opened will not open at another rate either.
                    break;
                }
            };

            if let Some(reply) = probe(&mut transport, probe_timeout).await {
                info!(port = %port.port_name, baud_rate, "found controller (reply {:?})", reply);
                return Ok(Some(DiscoveredPort {
                    port_name: port.port_name,
                    baud_rate,
                    reply,
                }));
            }
            debug!(port = %port.port_name, baud_rate, "no controller reply");
        }
    }
    Ok(None)
}

/// Without serial support no ports can be probed.
#[cfg(not(feature = "instrument_serial"))]
pub async fn discover_controller(
    _baud_rates: &[u32],
    _probe_timeout: Duration,
) -> StageResult<Option<DiscoveredPort>> {
    Err(crate::error::StageError::Config(
        "port discovery requires the instrument_serial feature".to_string(),
    ))
}
