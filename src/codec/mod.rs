//! # Row Packing Codec
//!
//! Packs the print head's column bitmaps into the device's half-width
//! encoding and expands them back for preview.
//!
//! ## Layout
//!
//! A bitmap is stored column-major: each column is `column_bytes` bytes
//! (72 for the standard head, 576 vertical dots), MSB = topmost dot.
//!
//! ```text
//! column:   0      1      2      3      4
//!        ┌──────┬──────┬──────┬──────┬──────┐
//!        │ 72 B │ 72 B │ 72 B │ 72 B │ 72 B │
//!        └──┬───┴──┬───┘──┬───┴──┬───┘──┬───┘
//!           └─ OR ─┘      └─ OR ─┘      │
//! packed:     0             1           2  (odd tail passes through)
//! ```
//!
//! Packed column `c` is `column[2c] | column[2c + 1]`, byte by byte. Unpacking
//! writes each packed column back to both source positions, so two adjacent
//! columns become identical after a round trip. Adjacent columns are
//! physically redundant at the head's resolution.
//!
//! Both functions are pure and reentrant.

pub mod bitmap;

pub use bitmap::{ColumnBitmap, DEFAULT_COLUMN_BYTES};

use crate::error::{Result, SdkError};

/// Number of packed columns for a bitmap `width` columns wide.
#[inline]
pub fn compressed_width(width: usize) -> usize {
    width.div_ceil(2)
}

/// Pack a column-major bitmap into half-width form.
///
/// `columns.len()` must be a multiple of `column_bytes`. An empty input
/// yields an empty output.
///
/// ## Example
///
/// ```
/// use printlink::codec;
///
/// let packed = codec::compress(&[0xF0; 144], 72).unwrap();
/// assert_eq!(packed, vec![0xF0; 72]);
/// ```
pub fn compress(columns: &[u8], column_bytes: usize) -> Result<Vec<u8>> {
    let width = column_count(columns.len(), column_bytes)?;
    let mut packed = Vec::with_capacity(compressed_width(width) * column_bytes);

    for pair in columns.chunks(column_bytes * 2) {
        let (left, right) = pair.split_at(column_bytes.min(pair.len()));
        if right.is_empty() {
            packed.extend_from_slice(left);
        } else {
            packed.extend(left.iter().zip(right).map(|(a, b)| a | b));
        }
    }

    Ok(packed)
}

/// Expand a packed bitmap back to `original_width` columns.
///
/// Every packed column is broadcast to both of its source positions; when
/// `original_width` is odd the last packed column fills only the final
/// column.
pub fn decompress(packed: &[u8], column_bytes: usize, original_width: usize) -> Result<Vec<u8>> {
    let packed_width = column_count(packed.len(), column_bytes)?;
    if packed_width != compressed_width(original_width) {
        return Err(SdkError::InvalidParameter(format!(
            "packed data holds {} columns, width {} needs {}",
            packed_width,
            original_width,
            compressed_width(original_width)
        )));
    }

    let mut columns = Vec::with_capacity(original_width * column_bytes);
    for (c, column) in packed.chunks(column_bytes).enumerate() {
        columns.extend_from_slice(column);
        if 2 * c + 1 < original_width {
            columns.extend_from_slice(column);
        }
    }

    Ok(columns)
}

fn column_count(len: usize, column_bytes: usize) -> Result<usize> {
    if column_bytes == 0 {
        return Err(SdkError::InvalidParameter(
            "column height must be at least one byte".into(),
        ));
    }
    if len % column_bytes != 0 {
        return Err(SdkError::InvalidParameter(format!(
            "{} bytes is not a whole number of {}-byte columns",
            len, column_bytes
        )));
    }
    Ok(len / column_bytes)
}
