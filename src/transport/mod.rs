//! # Transport Layer
//!
//! Connection strategies for talking to the print head, one per physical
//! transport, behind the shared [`ConnectionStrategy`] capability set.
//!
//! ## Available Transports
//!
//! - [`usb`]: bulk endpoints via `rusb`
//! - [`serial`]: serial ports via `serialport`
//! - [`bluetooth`]: classic Bluetooth SPP through a bound RFCOMM TTY (Unix)
//! - [`mock`]: in-memory scripted device for tests
//!
//! [`StrategyFactory`] picks the strategy for a [`ConnectionParameters`]
//! value; [`discovery`] enumerates candidate devices.
//!
//! ## Semantics Shared by Every Strategy
//!
//! - `send` never truncates silently: a short write is `PartialWrite`
//! - `receive` distinguishes `ReceiveTimeout` (retry) from
//!   `ConnectionLost` (tear down)
//! - `open` acquires an exclusive OS handle; `close` is idempotent
//! - every call may block, so callers run them off the async executor

pub mod bluetooth;
pub mod discovery;
pub mod factory;
pub mod mock;
pub mod serial;
pub mod usb;

use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SdkError};

pub use bluetooth::RfcommStrategy;
pub use factory::StrategyFactory;
pub use mock::{MockDevice, MockStrategy};
pub use serial::SerialStrategy;
pub use usb::UsbStrategy;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default RFCOMM channel for SPP
pub const DEFAULT_RFCOMM_CHANNEL: u8 = 1;

/// Physical transport family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Usb,
    Serial,
    ClassicBluetooth,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Usb => write!(f, "USB"),
            TransportKind::Serial => write!(f, "Serial"),
            TransportKind::ClassicBluetooth => write!(f, "Classic Bluetooth"),
        }
    }
}

/// How to reach one device. Immutable once built.
///
/// Deserialises from JSON tagged by `transport`:
///
/// ```
/// use printlink::transport::ConnectionParameters;
///
/// let params: ConnectionParameters =
///     serde_json::from_str(r#"{"transport": "serial", "port": "/dev/ttyUSB0"}"#).unwrap();
/// assert_eq!(params, ConnectionParameters::serial("/dev/ttyUSB0", 115_200));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ConnectionParameters {
    Usb {
        vendor_id: u16,
        product_id: u16,
        /// Pick one device when several share VID:PID
        #[serde(default)]
        serial_number: Option<String>,
        #[serde(default)]
        interface: u8,
    },
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    ClassicBluetooth {
        /// MAC address, XX:XX:XX:XX:XX:XX
        address: String,
        /// RFCOMM TTY already bound to `address`; looked up when absent
        #[serde(default)]
        device: Option<String>,
        #[serde(default)]
        service_uuid: Option<Uuid>,
        #[serde(default = "default_rfcomm_channel")]
        channel: u8,
    },
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_rfcomm_channel() -> u8 {
    DEFAULT_RFCOMM_CHANNEL
}

impl ConnectionParameters {
    pub fn serial(port: impl Into<String>, baud_rate: u32) -> Self {
        Self::Serial {
            port: port.into(),
            baud_rate,
        }
    }

    pub fn usb(vendor_id: u16, product_id: u16) -> Self {
        Self::Usb {
            vendor_id,
            product_id,
            serial_number: None,
            interface: 0,
        }
    }

    pub fn bluetooth(address: impl Into<String>) -> Self {
        Self::ClassicBluetooth {
            address: address.into(),
            device: None,
            service_uuid: None,
            channel: DEFAULT_RFCOMM_CHANNEL,
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Usb { .. } => TransportKind::Usb,
            Self::Serial { .. } => TransportKind::Serial,
            Self::ClassicBluetooth { .. } => TransportKind::ClassicBluetooth,
        }
    }

    /// Reject values no transport could open.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Usb { .. } => Ok(()),
            Self::Serial { port, baud_rate } => {
                if port.trim().is_empty() {
                    return Err(SdkError::InvalidParameter("serial port name is empty".into()));
                }
                if *baud_rate == 0 {
                    return Err(SdkError::InvalidParameter("baud rate must be non-zero".into()));
                }
                Ok(())
            }
            Self::ClassicBluetooth { address, .. } => {
                if bluetooth::is_valid_mac(address) {
                    Ok(())
                } else {
                    Err(SdkError::InvalidParameter(format!(
                        "'{}' is not a Bluetooth MAC address",
                        address
                    )))
                }
            }
        }
    }
}

impl fmt::Display for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb {
                vendor_id,
                product_id,
                ..
            } => write!(f, "usb://{:04x}:{:04x}", vendor_id, product_id),
            Self::Serial { port, baud_rate } => write!(f, "serial://{}@{}", port, baud_rate),
            Self::ClassicBluetooth { address, .. } => write!(f, "bluetooth://{}", address),
        }
    }
}

/// Identity snapshot of a discovered or connected device.
///
/// Replaced, never mutated, when the device is seen again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub address: String,
    pub kind: TransportKind,
    /// RSSI in dBm where the transport reports one
    pub signal_strength: Option<i16>,
    pub discovered_at: DateTime<Utc>,
}

impl DeviceInfo {
    pub fn new(name: impl Into<String>, address: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            kind,
            signal_strength: None,
            discovered_at: Utc::now(),
        }
    }
}

/// Capability set every transport implements.
///
/// Calls may block on OS I/O.
pub trait ConnectionStrategy: Send + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Acquire the OS handle.
    fn open(&mut self) -> Result<DeviceInfo>;

    /// Release the OS handle. Safe in any state, any number of times.
    fn close(&mut self);

    /// Write all of `bytes`; returns the count written.
    ///
    /// A short write is `Err(PartialWrite)`, never `Ok(n < len)`.
    fn send(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Wait up to `timeout` for inbound bytes.
    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    fn is_connected(&self) -> bool;
}

/// Write through `writer` until `bytes` is exhausted or the writer stops
/// accepting data.
pub(crate) fn write_fully<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> Result<usize> {
    let mut written = 0;
    while written < bytes.len() {
        match writer.write(&bytes[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if written == 0 && e.kind() != io::ErrorKind::TimedOut => {
                return Err(SdkError::ConnectionLost(e.to_string()));
            }
            Err(_) => break,
        }
    }

    if written < bytes.len() {
        return Err(SdkError::PartialWrite {
            written,
            expected: bytes.len(),
        });
    }

    writer
        .flush()
        .map_err(|e| SdkError::ConnectionLost(format!("flush failed: {}", e)))?;
    Ok(written)
}

/// Map a read error: timeouts can be retried, anything else ends the link.
pub(crate) fn read_error(e: io::Error) -> SdkError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            SdkError::ReceiveTimeout
        }
        _ => SdkError::ConnectionLost(e.to_string()),
    }
}
