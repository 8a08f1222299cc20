//! # Wire Frames
//!
//! Every unit on the wire is a frame:
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────────────┐
//! │ opcode u16 BE│ length u16 BE│ payload (length B)  │
//! └──────────────┴──────────────┴─────────────────────┘
//! ```
//!
//! The device echoes the request opcode in its reply. Frames with an opcode
//! of 0x1000 or above are unsolicited notifications.
//!
//! ## Streaming Decode
//!
//! Transports deliver arbitrary slices, so [`FrameDecoder`] buffers partial
//! frames across reads. Bad input never poisons the stream:
//!
//! - length above the configured maximum: one byte is discarded and decoding
//!   resynchronises at the next offset
//! - complete frame with an unknown opcode: the whole frame is discarded
//!
//! Both cases surface as [`SdkError::ProtocolDecode`] so the caller can log
//! them.

use crate::error::{Result, SdkError};

use super::opcode::{self, OpCode};

/// Header size: opcode + length.
pub const HEADER_LEN: usize = 4;

/// Largest payload the length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// One decoded or to-be-encoded protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Serialise to wire bytes.
    ///
    /// ## Example
    ///
    /// ```
    /// use printlink::protocol::{Frame, OpCode};
    ///
    /// let bytes = Frame::new(OpCode::SET_DENSITY, vec![8]).encode().unwrap();
    /// assert_eq!(bytes, vec![0x00, 0x10, 0x00, 0x01, 0x08]);
    /// ```
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(SdkError::InvalidParameter(format!(
                "payload of {} bytes exceeds frame limit {}",
                self.payload.len(),
                MAX_PAYLOAD
            )));
        }
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.opcode.code().to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Total encoded size.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Incremental decoder over a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD)
    }
}

impl FrameDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_payload: max_payload.min(MAX_PAYLOAD),
        }
    }

    /// Append bytes read from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Next complete frame, a decode error for discarded input, or `None`
    /// when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }

        let code = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;

        if len > self.max_payload {
            self.buf.drain(..1);
            return Some(Err(SdkError::ProtocolDecode(format!(
                "length {} above limit {} (opcode 0x{:04X}), resyncing",
                len, self.max_payload, code
            ))));
        }

        if self.buf.len() < HEADER_LEN + len {
            return None;
        }

        let frame_bytes: Vec<u8> = self.buf.drain(..HEADER_LEN + len).collect();
        if !opcode::is_known(code) {
            return Some(Err(SdkError::ProtocolDecode(format!(
                "unknown opcode 0x{:04X}, dropped {} byte frame",
                code,
                frame_bytes.len()
            ))));
        }

        Some(Ok(Frame {
            opcode: OpCode(code),
            payload: frame_bytes[HEADER_LEN..].to_vec(),
        }))
    }

    /// Drain every complete frame currently buffered.
    pub fn decode_all(&mut self) -> Vec<Result<Frame>> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encode_header_is_big_endian() {
        let bytes = Frame::new(OpCode::LOGO_DATA, vec![0xAB; 3]).encode().unwrap();
        assert_eq!(bytes, vec![0x01, 0x11, 0x00, 0x03, 0xAB, 0xAB, 0xAB]);
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let frame = Frame::new(OpCode::IMAGE_ROW_DATA, vec![0; MAX_PAYLOAD + 1]);
        assert!(matches!(frame.encode(), Err(SdkError::InvalidParameter(_))));
    }

    #[test]
    fn test_decode_across_partial_reads() {
        let bytes = Frame::new(OpCode::READ_BATTERY, vec![87]).encode().unwrap();
        let mut decoder = FrameDecoder::default();

        decoder.push(&bytes[..2]);
        assert!(decoder.next_frame().is_none());
        decoder.push(&bytes[2..4]);
        assert!(decoder.next_frame().is_none());
        decoder.push(&bytes[4..]);

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame, Frame::new(OpCode::READ_BATTERY, vec![87]));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_two_frames_in_one_read() {
        let mut bytes = Frame::new(OpCode::HEARTBEAT, vec![]).encode().unwrap();
        bytes.extend(Frame::new(OpCode::STATUS_KEY_PRESS, vec![1]).encode().unwrap());

        let mut decoder = FrameDecoder::default();
        decoder.push(&bytes);
        let frames: Vec<_> = decoder.decode_all().into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].opcode, OpCode::HEARTBEAT);
        assert_eq!(frames[1].payload, vec![1]);
    }

    #[test]
    fn test_unknown_opcode_dropped_whole() {
        let mut bytes = vec![0x09, 0x99, 0x00, 0x02, 0xAA, 0xBB];
        bytes.extend(Frame::new(OpCode::PRINT_START, vec![]).encode().unwrap());

        let mut decoder = FrameDecoder::default();
        decoder.push(&bytes);
        let results = decoder.decode_all();

        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Err(SdkError::ProtocolDecode(_))));
        assert_eq!(results[1].as_ref().unwrap().opcode, OpCode::PRINT_START);
    }

    #[test]
    fn test_oversized_length_resyncs() {
        let mut bytes = vec![0xFF];
        bytes.extend(Frame::new(OpCode::PRINT_STOP, vec![]).encode().unwrap());

        // 0xFF 0x00 0x02 0x00 reads as a length of 0x0200 > 16
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&bytes);
        let results = decoder.decode_all();

        assert!(matches!(results[0], Err(SdkError::ProtocolDecode(_))));
        assert_eq!(
            results.last().unwrap().as_ref().unwrap().opcode,
            OpCode::PRINT_STOP
        );
    }
}
