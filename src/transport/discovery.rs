//! # Device Discovery
//!
//! Enumerates candidate print heads on every transport. Each call returns
//! fresh [`DeviceInfo`] snapshots; nothing is cached.

use serialport::SerialPortType;
use tracing::{debug, warn};

use super::{DeviceInfo, TransportKind, bluetooth};
use crate::error::{Result, SdkError};

/// Serial ports visible to the OS.
pub fn discover_serial() -> Result<Vec<DeviceInfo>> {
    let ports = serialport::available_ports()
        .map_err(|e| SdkError::Io(format!("serial enumeration failed: {}", e)))?;

    Ok(ports
        .into_iter()
        .map(|port| {
            let name = match &port.port_type {
                SerialPortType::UsbPort(usb) => usb
                    .product
                    .clone()
                    .unwrap_or_else(|| format!("USB serial {:04x}:{:04x}", usb.vid, usb.pid)),
                SerialPortType::BluetoothPort => "Bluetooth serial".to_string(),
                SerialPortType::PciPort => "PCI serial".to_string(),
                SerialPortType::Unknown => port.port_name.clone(),
            };
            DeviceInfo::new(name, port.port_name, TransportKind::Serial)
        })
        .collect())
}

/// USB devices, optionally limited to one vendor/product pair.
pub fn discover_usb(filter: Option<(u16, u16)>) -> Result<Vec<DeviceInfo>> {
    let devices =
        rusb::devices().map_err(|e| SdkError::Io(format!("USB enumeration failed: {}", e)))?;

    let mut found = Vec::new();
    for device in devices.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        let ids = (desc.vendor_id(), desc.product_id());
        if filter.is_some_and(|wanted| wanted != ids) {
            continue;
        }

        let name = device
            .open()
            .ok()
            .and_then(|handle| handle.read_product_string_ascii(&desc).ok())
            .unwrap_or_else(|| format!("USB {:04x}:{:04x}", ids.0, ids.1));
        let address = format!(
            "{:04x}:{:04x}@{}.{}",
            ids.0,
            ids.1,
            device.bus_number(),
            device.address()
        );
        found.push(DeviceInfo::new(name, address, TransportKind::Usb));
    }

    Ok(found)
}

/// Bluetooth devices bound to an RFCOMM TTY.
pub fn discover_rfcomm() -> Result<Vec<DeviceInfo>> {
    Ok(bluetooth::rfcomm_bindings()?
        .into_iter()
        .map(|binding| {
            DeviceInfo::new(
                binding.device_path(),
                binding.address,
                TransportKind::ClassicBluetooth,
            )
        })
        .collect())
}

/// Everything every transport can see. A failing transport is logged and
/// skipped.
pub fn discover_all(usb_filter: Option<(u16, u16)>) -> Vec<DeviceInfo> {
    let mut all = Vec::new();
    for (kind, result) in [
        (TransportKind::Serial, discover_serial()),
        (TransportKind::Usb, discover_usb(usb_filter)),
        (TransportKind::ClassicBluetooth, discover_rfcomm()),
    ] {
        match result {
            Ok(devices) => {
                debug!(transport = %kind, count = devices.len(), "discovery finished");
                all.extend(devices);
            }
            Err(e) => warn!(transport = %kind, error = %e, "discovery failed"),
        }
    }
    all
}
