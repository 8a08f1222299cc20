//! Streamed image transfers.
//!
//! ```text
//! IMAGE_BEGIN     [width u16][columns u16][column_bytes u8][flags u8]
//! IMAGE_ROW_DATA  [first column u16][column count u16][column data]   (repeated)
//! IMAGE_END       [columns u16]
//! ```
//!
//! `width` is the original bitmap width; `columns` is the number of columns
//! on the wire (half of `width`, rounded up, when packed). Flag bit 0 marks
//! packed data.

use image::GrayImage;

use super::{PrintHeadProfile, encode_columns};
use crate::codec::ColumnBitmap;
use crate::command::{DataObj, DataObjContext, DataSendType, DataSequence};
use crate::error::{Result, SdkError};
use crate::protocol::OpCode;

const FLAG_PACKED: u8 = 0x01;

/// Row-data header: first column and column count.
const ROW_HEADER_LEN: usize = 4;

/// Cuts a bitmap into an `IMAGE_*` chunk run.
#[derive(Debug, Clone)]
pub struct MultiRowDataFactory {
    profile: PrintHeadProfile,
    send_type: DataSendType,
}

impl MultiRowDataFactory {
    pub fn new(profile: PrintHeadProfile) -> Self {
        let send_type = profile.image_mode;
        Self { profile, send_type }
    }

    pub fn with_send_type(mut self, send_type: DataSendType) -> Self {
        self.send_type = send_type;
        self
    }

    pub fn profile(&self) -> &PrintHeadProfile {
        &self.profile
    }

    /// Whole columns per `IMAGE_ROW_DATA` chunk.
    pub fn columns_per_chunk(&self) -> Result<usize> {
        let room = self.profile.chunk_payload.saturating_sub(ROW_HEADER_LEN);
        match room.checked_div(self.profile.column_bytes).unwrap_or(0) {
            0 => Err(SdkError::InvalidParameter(format!(
                "chunk payload {} cannot hold one {}-byte column",
                self.profile.chunk_payload, self.profile.column_bytes
            ))),
            n => Ok(n.min(u16::MAX as usize)),
        }
    }

    pub fn build(&self, bitmap: &ColumnBitmap) -> Result<Vec<DataObj>> {
        let per_chunk = self.columns_per_chunk()?;
        let encoded = encode_columns(bitmap, &self.profile)?;
        let column_bytes = self.profile.column_bytes;
        let flags = if self.profile.compress { FLAG_PACKED } else { 0 };

        let mut begin = Vec::with_capacity(6);
        begin.extend_from_slice(&(bitmap.width() as u16).to_be_bytes());
        begin.extend_from_slice(&(encoded.columns as u16).to_be_bytes());
        begin.push(encoded.column_bytes);
        begin.push(flags);

        let mut chunks = vec![DataObj::new(OpCode::IMAGE_BEGIN, begin, self.send_type)?];

        for (i, block) in encoded.data.chunks(per_chunk * column_bytes).enumerate() {
            let first = i * per_chunk;
            let count = block.len() / column_bytes;
            let mut payload = Vec::with_capacity(ROW_HEADER_LEN + block.len());
            payload.extend_from_slice(&(first as u16).to_be_bytes());
            payload.extend_from_slice(&(count as u16).to_be_bytes());
            payload.extend_from_slice(block);
            chunks.push(DataObj::new(OpCode::IMAGE_ROW_DATA, payload, self.send_type)?);
        }

        chunks.push(DataObj::new(
            OpCode::IMAGE_END,
            (encoded.columns as u16).to_be_bytes().to_vec(),
            self.send_type,
        )?);
        Ok(chunks)
    }

    /// Threshold `image` and build. Taller images than the head are rejected.
    pub fn build_image(&self, image: &GrayImage, threshold: u8) -> Result<Vec<DataObj>> {
        let bitmap = ColumnBitmap::from_luma(image, self.profile.column_bytes, threshold)?;
        self.build(&bitmap)
    }

    pub fn sequence(&self, bitmap: &ColumnBitmap, context: DataObjContext) -> Result<DataSequence> {
        DataSequence::new(self.send_type, self.build(bitmap)?, context)
    }
}

impl Default for MultiRowDataFactory {
    fn default() -> Self {
        Self::new(PrintHeadProfile::standard())
    }
}
