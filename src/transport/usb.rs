//! # USB Transport
//!
//! Bulk-endpoint access through `rusb`. The strategy claims one interface,
//! detaching any kernel driver bound to it, and uses the first bulk IN and
//! bulk OUT endpoints it finds there.

use std::time::Duration;

use rusb::{DeviceHandle, Direction, GlobalContext, TransferType};
use tracing::{debug, info, warn};

use super::{ConnectionStrategy, DeviceInfo, TransportKind};
use crate::error::{Result, SdkError};

/// Timeout applied to bulk writes
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Read buffer size per receive call (a multiple of the 64-byte packet size)
const READ_BUFFER: usize = 1024;

/// An open, claimed interface.
struct Claimed {
    handle: DeviceHandle<GlobalContext>,
    interface: u8,
    endpoint_in: u8,
    endpoint_out: u8,
}

/// USB bulk connection
pub struct UsbStrategy {
    vendor_id: u16,
    product_id: u16,
    serial_number: Option<String>,
    interface: u8,
    claimed: Option<Claimed>,
}

impl UsbStrategy {
    pub fn new(
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<String>,
        interface: u8,
    ) -> Self {
        Self {
            vendor_id,
            product_id,
            serial_number,
            interface,
            claimed: None,
        }
    }

    fn address(&self) -> String {
        format!("{:04x}:{:04x}", self.vendor_id, self.product_id)
    }

    fn claimed(&self) -> Result<&Claimed> {
        self.claimed
            .as_ref()
            .ok_or_else(|| SdkError::ConnectionLost(format!("{} is not open", self.address())))
    }

    /// Find the matching device and claim its interface.
    fn claim(&self) -> Result<(Claimed, String)> {
        let devices = rusb::devices().map_err(open_failed)?;
        let candidates = devices.iter().filter_map(|device| {
            let desc = device.device_descriptor().ok()?;
            (desc.vendor_id() == self.vendor_id && desc.product_id() == self.product_id)
                .then_some((device, desc))
        });

        let found = first_openable(candidates, self.serial_number.is_some(), |(device, desc)| {
            let handle = device.open().map_err(open_failed)?;
            if let Some(wanted) = &self.serial_number {
                match handle.read_serial_number_string_ascii(&desc) {
                    Ok(actual) if &actual == wanted => {}
                    _ => return Ok(None),
                }
            }
            Ok(Some((device, desc, handle)))
        })?;

        let Some((device, desc, mut handle)) = found else {
            return Err(SdkError::OpenFailed(format!(
                "no USB device {} found",
                self.address()
            )));
        };
        let config = device.active_config_descriptor().map_err(open_failed)?;
        let mut endpoint_in = None;
        let mut endpoint_out = None;
        for iface in config.interfaces().filter(|i| i.number() == self.interface) {
            for setting in iface.descriptors() {
                for ep in setting.endpoint_descriptors() {
                    if ep.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match ep.direction() {
                        Direction::In => endpoint_in = endpoint_in.or(Some(ep.address())),
                        Direction::Out => endpoint_out = endpoint_out.or(Some(ep.address())),
                    }
                }
            }
        }
        let (Some(endpoint_in), Some(endpoint_out)) = (endpoint_in, endpoint_out) else {
            return Err(SdkError::OpenFailed(format!(
                "{} interface {} has no bulk endpoint pair",
                self.address(),
                self.interface
            )));
        };

        if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
            debug!(error = %e, "kernel driver auto-detach unavailable");
        }
        handle.claim_interface(self.interface).map_err(open_failed)?;

        let name = handle
            .read_product_string_ascii(&desc)
            .unwrap_or_else(|_| format!("USB {}", self.address()));

        Ok((
            Claimed {
                handle,
                interface: self.interface,
                endpoint_in,
                endpoint_out,
            },
            name,
        ))
    }
}

/// First candidate `open` accepts. `Ok(None)` from `open` means the device
/// is not the one wanted. When `filtered`, devices that fail to open are
/// skipped and the last failure is reported only if nothing matched.
fn first_openable<C, H>(
    candidates: impl IntoIterator<Item = C>,
    filtered: bool,
    mut open: impl FnMut(C) -> Result<Option<H>>,
) -> Result<Option<H>> {
    let mut last_error = None;
    for candidate in candidates {
        match open(candidate) {
            Ok(Some(found)) => return Ok(Some(found)),
            Ok(None) => {}
            Err(e) if filtered => {
                debug!(error = %e, "skipping USB device that failed to open");
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    last_error.map_or(Ok(None), Err)
}

fn open_failed(e: rusb::Error) -> SdkError {
    let reason = match e {
        rusb::Error::Access => "permission denied".to_string(),
        rusb::Error::Busy => "device busy".to_string(),
        rusb::Error::NotFound | rusb::Error::NoDevice => "not found".to_string(),
        other => other.to_string(),
    };
    SdkError::OpenFailed(reason)
}

fn link_error(e: rusb::Error) -> SdkError {
    SdkError::ConnectionLost(format!("USB: {}", e))
}

impl std::fmt::Debug for UsbStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbStrategy")
            .field("device", &self.address())
            .field("interface", &self.interface)
            .field("open", &self.claimed.is_some())
            .finish()
    }
}

impl ConnectionStrategy for UsbStrategy {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn open(&mut self) -> Result<DeviceInfo> {
        self.close();
        let (claimed, name) = self.claim()?;
        info!(
            device = %self.address(),
            endpoint_in = claimed.endpoint_in,
            endpoint_out = claimed.endpoint_out,
            "USB interface claimed"
        );
        self.claimed = Some(claimed);
        Ok(DeviceInfo::new(name, self.address(), TransportKind::Usb))
    }

    fn close(&mut self) {
        if let Some(mut claimed) = self.claimed.take() {
            if let Err(e) = claimed.handle.release_interface(claimed.interface) {
                warn!(error = %e, "failed to release USB interface");
            }
            debug!(device = %self.address(), "USB interface released");
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        let claimed = self.claimed()?;
        match claimed
            .handle
            .write_bulk(claimed.endpoint_out, bytes, WRITE_TIMEOUT)
        {
            Ok(n) if n == bytes.len() => Ok(n),
            Ok(n) => Err(SdkError::PartialWrite {
                written: n,
                expected: bytes.len(),
            }),
            Err(rusb::Error::Timeout) => Err(SdkError::PartialWrite {
                written: 0,
                expected: bytes.len(),
            }),
            Err(e) => Err(link_error(e)),
        }
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let claimed = self.claimed()?;
        let mut buf = vec![0u8; READ_BUFFER];
        match claimed.handle.read_bulk(claimed.endpoint_in, &mut buf, timeout) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            }
            Err(rusb::Error::Timeout) => Err(SdkError::ReceiveTimeout),
            Err(e) => Err(link_error(e)),
        }
    }

    fn is_connected(&self) -> bool {
        self.claimed.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_before_open_is_connection_lost() {
        let mut strategy = UsbStrategy::new(0x1234, 0x5678, None, 0);
        assert!(matches!(strategy.send(&[0]), Err(SdkError::ConnectionLost(_))));
        assert!(!strategy.is_connected());
        strategy.close();
    }

    #[test]
    fn test_serial_filter_skips_unopenable_devices() {
        let devices = [Err(rusb::Error::Access), Ok("wrong"), Ok("wanted")];
        let found = first_openable(devices, true, |d| match d {
            Ok(serial) => Ok((serial == "wanted").then_some(serial)),
            Err(e) => Err(open_failed(e)),
        });
        assert_eq!(found, Ok(Some("wanted")));
    }

    #[test]
    fn test_unfiltered_open_failure_is_final() {
        let devices = [Err(rusb::Error::Busy), Ok("other")];
        let found = first_openable(devices, false, |d| match d {
            Ok(serial) => Ok(Some(serial)),
            Err(e) => Err(open_failed(e)),
        });
        assert_eq!(found, Err(SdkError::OpenFailed("device busy".into())));
    }

    #[test]
    fn test_filtered_reports_last_failure_when_nothing_matches() {
        let devices: [std::result::Result<&str, rusb::Error>; 2] =
            [Err(rusb::Error::Access), Ok("wrong")];
        let found = first_openable(devices, true, |d| match d {
            Ok(serial) => Ok((serial == "wanted").then_some(serial)),
            Err(e) => Err(open_failed(e)),
        });
        assert_eq!(found, Err(SdkError::OpenFailed("permission denied".into())));
    }

    #[test]
    fn test_open_error_reasons() {
        assert_eq!(
            open_failed(rusb::Error::Busy),
            SdkError::OpenFailed("device busy".into())
        );
        assert_eq!(
            open_failed(rusb::Error::Access),
            SdkError::OpenFailed("permission denied".into())
        );
    }
}
