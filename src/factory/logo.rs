//! Flow-controlled logo writes.
//!
//! ```text
//! LOGO_BEGIN  [width u16][data length u32][column_bytes u8][flags u8]
//! LOGO_DATA   [sequence u16][data]   (repeated, acknowledged one by one)
//! LOGO_END    [chunk count u16]
//! ```

use image::GrayImage;

use super::{PrintHeadProfile, encode_columns};
use crate::codec::ColumnBitmap;
use crate::command::{DataObj, DataObjContext, DataSendType, DataSequence};
use crate::error::{Result, SdkError};
use crate::protocol::OpCode;

const FLAG_PACKED: u8 = 0x01;
const SEQ_LEN: usize = 2;

/// Cuts a bitmap into a `LOGO_*` chunk run.
#[derive(Debug, Clone)]
pub struct LogoDataFactory {
    profile: PrintHeadProfile,
    send_type: DataSendType,
}

impl LogoDataFactory {
    pub fn new(profile: PrintHeadProfile) -> Self {
        let send_type = profile.logo_mode;
        Self { profile, send_type }
    }

    pub fn with_send_type(mut self, send_type: DataSendType) -> Self {
        self.send_type = send_type;
        self
    }

    pub fn profile(&self) -> &PrintHeadProfile {
        &self.profile
    }

    pub fn build(&self, bitmap: &ColumnBitmap) -> Result<Vec<DataObj>> {
        let room = self.profile.chunk_payload.saturating_sub(SEQ_LEN);
        if room == 0 {
            return Err(SdkError::InvalidParameter(format!(
                "chunk payload {} leaves no room for logo data",
                self.profile.chunk_payload
            )));
        }
        let encoded = encode_columns(bitmap, &self.profile)?;
        let pieces: Vec<&[u8]> = encoded.data.chunks(room).collect();
        if pieces.len() > u16::MAX as usize {
            return Err(SdkError::InvalidParameter(format!(
                "logo needs {} chunks, sequence numbers stop at {}",
                pieces.len(),
                u16::MAX
            )));
        }

        let mut begin = Vec::with_capacity(8);
        begin.extend_from_slice(&(bitmap.width() as u16).to_be_bytes());
        begin.extend_from_slice(&(encoded.data.len() as u32).to_be_bytes());
        begin.push(encoded.column_bytes);
        begin.push(if self.profile.compress { FLAG_PACKED } else { 0 });

        let mut chunks = Vec::with_capacity(pieces.len() + 2);
        chunks.push(DataObj::new(OpCode::LOGO_BEGIN, begin, self.send_type)?);
        for (seq, piece) in pieces.iter().enumerate() {
            let mut payload = Vec::with_capacity(SEQ_LEN + piece.len());
            payload.extend_from_slice(&(seq as u16).to_be_bytes());
            payload.extend_from_slice(piece);
            chunks.push(DataObj::new(OpCode::LOGO_DATA, payload, self.send_type)?);
        }
        chunks.push(DataObj::new(
            OpCode::LOGO_END,
            (pieces.len() as u16).to_be_bytes().to_vec(),
            self.send_type,
        )?);
        Ok(chunks)
    }

    pub fn build_image(&self, image: &GrayImage, threshold: u8) -> Result<Vec<DataObj>> {
        let bitmap = ColumnBitmap::from_luma(image, self.profile.column_bytes, threshold)?;
        self.build(&bitmap)
    }

    pub fn sequence(&self, bitmap: &ColumnBitmap, context: DataObjContext) -> Result<DataSequence> {
        DataSequence::new(self.send_type, self.build(bitmap)?, context)
    }
}

impl Default for LogoDataFactory {
    fn default() -> Self {
        Self::new(PrintHeadProfile::standard())
    }
}
