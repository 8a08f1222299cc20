//! # Serial Transport
//!
//! Print heads wired through a UART or a USB-CDC bridge. The port is opened
//! 8N1 without flow control; `serialport` takes an exclusive lock on Unix.

use std::io::Read;
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info};

use super::{ConnectionStrategy, DeviceInfo, TransportKind, read_error, write_fully};
use crate::error::{Result, SdkError};

/// Timeout applied to writes
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Read buffer size per receive call
const READ_BUFFER: usize = 1024;

/// Serial port connection
pub struct SerialStrategy {
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialStrategy {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| SdkError::ConnectionLost(format!("{} is not open", self.port_name)))
    }
}

impl std::fmt::Debug for SerialStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialStrategy")
            .field("port", &self.port_name)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl ConnectionStrategy for SerialStrategy {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn open(&mut self) -> Result<DeviceInfo> {
        self.close();

        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(WRITE_TIMEOUT)
            .open()
            .map_err(|e| SdkError::OpenFailed(format!("{}: {}", self.port_name, e)))?;

        info!(port = %self.port_name, baud = self.baud_rate, "serial port opened");
        let name = port.name().unwrap_or_else(|| self.port_name.clone());
        self.port = Some(port);

        Ok(DeviceInfo::new(name, self.port_name.clone(), TransportKind::Serial))
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "serial port closed");
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        let port = self.port()?;
        port.set_timeout(WRITE_TIMEOUT)
            .map_err(|e| SdkError::ConnectionLost(e.to_string()))?;
        write_fully(port.as_mut(), bytes)
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let port = self.port()?;
        port.set_timeout(timeout)
            .map_err(|e| SdkError::ConnectionLost(e.to_string()))?;

        let mut buf = vec![0u8; READ_BUFFER];
        match port.read(&mut buf) {
            Ok(0) => Err(SdkError::ConnectionLost("serial port returned EOF".into())),
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(e) => Err(read_error(e)),
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}
