//! # Opcode Table
//!
//! The fixed catalogue of protocol command identifiers.
//!
//! ## Ranges
//!
//! | Range | Group |
//! |-------|-------|
//! | 0x0000–0x00FF | Print-head control |
//! | 0x0100–0x01FF | Image transfer |
//! | 0x0200–0x02FF | Maintenance / upgrade |
//! | 0x0300–0x03FF | Task control |
//! | 0x1000+ | Status notifications (device → host, unsolicited) |
//!
//! ## Ambiguous Code
//!
//! The device catalogue assigns 0x0203 to both "read Bluetooth connect state"
//! and "write printer connect state". Both names are kept as aliases of the
//! same value and [`lookup`] returns both entries; which one a given firmware
//! honours is not known.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A protocol command identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpCode(pub u16);

impl OpCode {
    // ===== Print-head control =====
    pub const PRINT_START: Self = Self(0x0001);
    pub const PRINT_STOP: Self = Self(0x0002);
    pub const PRINT_PAUSE: Self = Self(0x0003);
    pub const PRINT_RESUME: Self = Self(0x0004);
    pub const SET_DENSITY: Self = Self(0x0010);
    pub const SET_SPEED: Self = Self(0x0011);
    pub const SET_DIRECTION: Self = Self(0x0012);
    pub const HEAD_RESET: Self = Self(0x0020);

    // ===== Image transfer =====
    pub const IMAGE_BEGIN: Self = Self(0x0100);
    pub const IMAGE_ROW_DATA: Self = Self(0x0101);
    pub const IMAGE_END: Self = Self(0x0102);
    pub const LOGO_BEGIN: Self = Self(0x0110);
    pub const LOGO_DATA: Self = Self(0x0111);
    pub const LOGO_END: Self = Self(0x0112);

    // ===== Maintenance / upgrade =====
    pub const READ_DEVICE_INFO: Self = Self(0x0200);
    pub const READ_FIRMWARE_VERSION: Self = Self(0x0201);
    pub const READ_BATTERY: Self = Self(0x0202);
    pub const READ_BT_CONNECT_STATE: Self = Self(0x0203);
    pub const WRITE_PRINTER_CONNECT_STATE: Self = Self(0x0203);
    pub const UPGRADE_BEGIN: Self = Self(0x0210);
    pub const UPGRADE_DATA: Self = Self(0x0211);
    pub const UPGRADE_END: Self = Self(0x0212);
    pub const HEARTBEAT: Self = Self(0x0220);

    // ===== Task control =====
    pub const TASK_CREATE: Self = Self(0x0300);
    pub const TASK_CANCEL: Self = Self(0x0301);
    pub const TASK_QUERY: Self = Self(0x0302);

    // ===== Status notifications =====
    pub const STATUS_PRINT_COMPLETE: Self = Self(0x1000);
    pub const STATUS_ERROR: Self = Self(0x1001);
    pub const STATUS_BATTERY_LOW: Self = Self(0x1002);
    pub const STATUS_HEAD_TEMPERATURE: Self = Self(0x1003);
    pub const STATUS_KEY_PRESS: Self = Self(0x1004);

    #[inline]
    pub const fn code(self) -> u16 {
        self.0
    }

    /// Functional group by numeric range, `None` for codes outside every range.
    pub fn group(self) -> Option<OpCodeGroup> {
        match self.0 {
            0x0000..=0x00FF => Some(OpCodeGroup::PrintHead),
            0x0100..=0x01FF => Some(OpCodeGroup::ImageTransfer),
            0x0200..=0x02FF => Some(OpCodeGroup::Maintenance),
            0x0300..=0x03FF => Some(OpCodeGroup::TaskControl),
            0x1000.. => Some(OpCodeGroup::StatusNotification),
            _ => None,
        }
    }

    /// Device-initiated notification that never answers a request.
    #[inline]
    pub fn is_notification(self) -> bool {
        self.0 >= 0x1000
    }

    pub fn is_known(self) -> bool {
        is_known(self.0)
    }

    /// Catalogue name, or `"UNKNOWN"`.
    pub fn name(self) -> &'static str {
        lookup(self.0).next().map_or("UNKNOWN", |info| info.name)
    }
}

impl From<u16> for OpCode {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:04X})", self.name(), self.0)
    }
}

/// Functional ranges of the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCodeGroup {
    PrintHead,
    ImageTransfer,
    Maintenance,
    TaskControl,
    StatusNotification,
}

/// One catalogue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCodeInfo {
    pub code: OpCode,
    pub name: &'static str,
    pub description: &'static str,
}

impl OpCodeInfo {
    pub fn group(&self) -> Option<OpCodeGroup> {
        self.code.group()
    }
}

const fn entry(code: OpCode, name: &'static str, description: &'static str) -> OpCodeInfo {
    OpCodeInfo {
        code,
        name,
        description,
    }
}

/// Every opcode the SDK knows, ordered by code.
pub const OPCODE_TABLE: &[OpCodeInfo] = &[
    entry(OpCode::PRINT_START, "PRINT_START", "Begin printing the buffered job"),
    entry(OpCode::PRINT_STOP, "PRINT_STOP", "Abort printing and clear the buffer"),
    entry(OpCode::PRINT_PAUSE, "PRINT_PAUSE", "Hold the head after the current row"),
    entry(OpCode::PRINT_RESUME, "PRINT_RESUME", "Continue a paused job"),
    entry(OpCode::SET_DENSITY, "SET_DENSITY", "Set heating density (1 byte, 1-15)"),
    entry(OpCode::SET_SPEED, "SET_SPEED", "Set head travel speed (1 byte)"),
    entry(OpCode::SET_DIRECTION, "SET_DIRECTION", "Set print direction (0 = forward, 1 = reverse)"),
    entry(OpCode::HEAD_RESET, "HEAD_RESET", "Return the head to its home position"),
    entry(OpCode::IMAGE_BEGIN, "IMAGE_BEGIN", "Announce an image: width, wire columns, column height, flags"),
    entry(OpCode::IMAGE_ROW_DATA, "IMAGE_ROW_DATA", "Packed column data block"),
    entry(OpCode::IMAGE_END, "IMAGE_END", "Close the current image"),
    entry(OpCode::LOGO_BEGIN, "LOGO_BEGIN", "Announce a stored logo: width u16, packed length u32"),
    entry(OpCode::LOGO_DATA, "LOGO_DATA", "Logo data block, acknowledged per block"),
    entry(OpCode::LOGO_END, "LOGO_END", "Commit the logo to flash"),
    entry(OpCode::READ_DEVICE_INFO, "READ_DEVICE_INFO", "Read model and serial number"),
    entry(OpCode::READ_FIRMWARE_VERSION, "READ_FIRMWARE_VERSION", "Read firmware version string"),
    entry(OpCode::READ_BATTERY, "READ_BATTERY", "Read battery percentage"),
    entry(OpCode::READ_BT_CONNECT_STATE, "READ_BT_CONNECT_STATE", "Read Bluetooth connect state"),
    entry(
        OpCode::WRITE_PRINTER_CONNECT_STATE,
        "WRITE_PRINTER_CONNECT_STATE",
        "Write printer connect state",
    ),
    entry(OpCode::UPGRADE_BEGIN, "UPGRADE_BEGIN", "Start a firmware upgrade"),
    entry(OpCode::UPGRADE_DATA, "UPGRADE_DATA", "Firmware image block, acknowledged per block"),
    entry(OpCode::UPGRADE_END, "UPGRADE_END", "Verify and apply the firmware image"),
    entry(OpCode::HEARTBEAT, "HEARTBEAT", "Link keep-alive, echoed by the device"),
    entry(OpCode::TASK_CREATE, "TASK_CREATE", "Create a print task"),
    entry(OpCode::TASK_CANCEL, "TASK_CANCEL", "Cancel a print task"),
    entry(OpCode::TASK_QUERY, "TASK_QUERY", "Query task progress"),
    entry(OpCode::STATUS_PRINT_COMPLETE, "STATUS_PRINT_COMPLETE", "Job finished printing"),
    entry(OpCode::STATUS_ERROR, "STATUS_ERROR", "Device fault code"),
    entry(OpCode::STATUS_BATTERY_LOW, "STATUS_BATTERY_LOW", "Battery below threshold"),
    entry(OpCode::STATUS_HEAD_TEMPERATURE, "STATUS_HEAD_TEMPERATURE", "Head temperature report"),
    entry(OpCode::STATUS_KEY_PRESS, "STATUS_KEY_PRESS", "Physical button pressed"),
];

/// All catalogue entries for `code` (two for the ambiguous 0x0203).
pub fn lookup(code: u16) -> impl Iterator<Item = &'static OpCodeInfo> {
    OPCODE_TABLE.iter().filter(move |info| info.code.0 == code)
}

/// Whether `code` is in the catalogue.
pub fn is_known(code: u16) -> bool {
    lookup(code).next().is_some()
}
