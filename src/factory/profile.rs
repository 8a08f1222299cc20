//! # Print Head Profiles
//!
//! Hardware shape of a print head and how payloads are cut for it.
//!
//! ## Column Geometry
//!
//! ```text
//! dots      = column_bytes * 8
//! dots_per_mm = dpi / 25.4
//!
//! For the standard head:
//!   dots = 72 * 8 = 576
//!   576 / (203 / 25.4) ≈ 72mm print height per column
//! ```

use serde::{Deserialize, Serialize};

use crate::command::DataSendType;
use crate::protocol::HEADER_LEN;

/// Hardware characteristics and transfer policy of a print head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintHeadProfile {
    pub name: String,

    /// Bytes per column (dots / 8)
    pub column_bytes: usize,

    /// Resolution in dots per inch
    pub dpi: u16,

    /// Largest frame payload the device buffers in one piece
    pub chunk_payload: usize,

    /// Send image data with row packing
    pub compress: bool,

    /// Send mode for streamed images
    pub image_mode: DataSendType,

    /// Send mode for logo writes
    pub logo_mode: DataSendType,
}

impl PrintHeadProfile {
    /// The 576-dot, 203 DPI head.
    pub fn standard() -> Self {
        Self {
            name: "576-dot head".to_string(),
            column_bytes: 72,
            dpi: 203,
            chunk_payload: 512,
            compress: true,
            image_mode: DataSendType::OnceContinuous,
            logo_mode: DataSendType::CompleteOnceWaitNext,
        }
    }

    /// Dots per column
    #[inline]
    pub fn dots(&self) -> usize {
        self.column_bytes * 8
    }

    #[inline]
    pub fn dots_per_mm(&self) -> f32 {
        self.dpi as f32 / 25.4
    }

    /// Convert millimeters to dots
    #[inline]
    pub fn mm_to_dots(&self, mm: f32) -> usize {
        (mm * self.dots_per_mm()).round() as usize
    }

    /// Bytes per chunk frame on the wire, header included.
    pub fn chunk_wire_len(&self) -> usize {
        self.chunk_payload + HEADER_LEN
    }
}

impl Default for PrintHeadProfile {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_geometry() {
        let profile = PrintHeadProfile::standard();
        assert_eq!(profile.dots(), 576);
        assert!((profile.dots_per_mm() - 8.0).abs() < 0.1);
        assert_eq!(profile.mm_to_dots(10.0), 80);
    }

    #[test]
    fn test_profile_from_partial_json() {
        let profile: PrintHeadProfile =
            serde_json::from_str(r#"{"chunk_payload": 128, "logo_mode": "once_continuous"}"#)
                .unwrap();
        assert_eq!(profile.chunk_payload, 128);
        assert_eq!(profile.logo_mode, DataSendType::OnceContinuous);
        assert_eq!(profile.column_bytes, 72);
    }
}
