//! # Data Factories
//!
//! Turn bitmaps into ready-to-send [`DataObj`](crate::command::DataObj)
//! chunk runs.
//!
//! ## Factories
//!
//! | Factory | Opcodes | Default mode |
//! |---------|---------|--------------|
//! | [`MultiRowDataFactory`] | `IMAGE_BEGIN`, `IMAGE_ROW_DATA`…, `IMAGE_END` | once-continuous |
//! | [`LogoDataFactory`] | `LOGO_BEGIN`, `LOGO_DATA`…, `LOGO_END` | complete-once-wait-next |
//!
//! Both pack the bitmap with the row codec when the profile asks for it and
//! cut the result into chunks no larger than the profile's chunk payload.

pub mod logo;
pub mod multirow;
pub mod profile;

pub use logo::LogoDataFactory;
pub use multirow::MultiRowDataFactory;
pub use profile::PrintHeadProfile;

use crate::codec::{ColumnBitmap, compressed_width};
use crate::error::{Result, SdkError};

/// Column data as it goes on the wire, plus the column count it describes.
pub(crate) struct EncodedColumns {
    pub data: Vec<u8>,
    pub columns: usize,
    /// Column height as the one-byte header field carries it
    pub column_bytes: u8,
}

pub(crate) fn encode_columns(bitmap: &ColumnBitmap, profile: &PrintHeadProfile) -> Result<EncodedColumns> {
    if bitmap.column_bytes() != profile.column_bytes {
        return Err(SdkError::InvalidParameter(format!(
            "bitmap columns are {} bytes, {} expects {}",
            bitmap.column_bytes(),
            profile.name,
            profile.column_bytes
        )));
    }
    let column_bytes = u8::try_from(profile.column_bytes).map_err(|_| {
        SdkError::InvalidParameter(format!(
            "{} columns are {} bytes, headers carry at most {}",
            profile.name,
            profile.column_bytes,
            u8::MAX
        ))
    })?;
    if bitmap.width() > u16::MAX as usize {
        return Err(SdkError::InvalidParameter(format!(
            "bitmap is {} columns wide, at most {} fit a header",
            bitmap.width(),
            u16::MAX
        )));
    }

    if profile.compress {
        Ok(EncodedColumns {
            data: bitmap.pack()?,
            columns: compressed_width(bitmap.width()),
            column_bytes,
        })
    } else {
        Ok(EncodedColumns {
            data: bitmap.as_bytes().to_vec(),
            columns: bitmap.width(),
            column_bytes,
        })
    }
}
