//! # Commands and Data Objects
//!
//! The units a [`ManagedConnection`](crate::connection::ManagedConnection)
//! transmits, and the [`Context`] that ties each one to its callback.
//!
//! ## Units
//!
//! | Unit | Shape | Completion |
//! |------|-------|------------|
//! | [`Command`] | one frame, one response | response frame, `RequestTimeout`, or link error |
//! | [`DataSequence`] | many [`DataObj`] chunks | [`TransferReport`], `PartialTransfer`, or link error |
//!
//! ## Send Modes
//!
//! - [`DataSendType::OnceContinuous`]: chunks go out back to back; the
//!   sequence completes when the last write completes.
//! - [`DataSendType::CompleteOnceWaitNext`]: chunk *i+1* waits for the
//!   device to acknowledge chunk *i* (a frame echoing the chunk's opcode).
//!
//! ## Contexts
//!
//! A context's callback runs exactly once. [`Context::complete`] consumes
//! the context, so a second completion does not type-check.

mod context;

pub use context::{Callback, CommandContext, Context, CorrelationToken, DataObjContext};
pub(crate) use context::recv;

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SdkError};
use crate::protocol::{Frame, MAX_PAYLOAD, OpCode};

// ============================================================================
// Command
// ============================================================================

/// One request/response exchange.
pub struct Command {
    opcode: OpCode,
    params: Vec<u8>,
    context: CommandContext,
}

impl Command {
    /// Build a command. The opcode must be a known request opcode.
    pub fn new(opcode: OpCode, params: impl Into<Vec<u8>>, context: CommandContext) -> Result<Self> {
        let params = params.into();
        check_request_opcode(opcode)?;
        check_payload(params.len())?;
        Ok(Self {
            opcode,
            params,
            context,
        })
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    pub fn token(&self) -> CorrelationToken {
        self.context.token()
    }

    /// Per-command deadline, if the context overrides the connection default.
    pub fn timeout(&self) -> Option<Duration> {
        self.context.timeout()
    }

    /// The frame this command puts on the wire.
    pub fn frame(&self) -> Frame {
        Frame::new(self.opcode, self.params.clone())
    }

    pub(crate) fn into_parts(self) -> (Frame, CommandContext) {
        (Frame::new(self.opcode, self.params), self.context)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("opcode", &self.opcode)
            .field("params", &self.params.len())
            .field("token", &self.context.token())
            .finish()
    }
}

// ============================================================================
// Data objects
// ============================================================================

/// Flow control for a multi-chunk transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSendType {
    /// Stream every chunk without waiting for acknowledgments.
    OnceContinuous,
    /// Wait for the device to acknowledge each chunk before the next.
    CompleteOnceWaitNext,
}

impl fmt::Display for DataSendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSendType::OnceContinuous => write!(f, "once-continuous"),
            DataSendType::CompleteOnceWaitNext => write!(f, "complete-once-wait-next"),
        }
    }
}

/// One transmissible chunk of a larger data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataObj {
    opcode: OpCode,
    payload: Vec<u8>,
    send_type: DataSendType,
}

impl DataObj {
    pub fn new(opcode: OpCode, payload: impl Into<Vec<u8>>, send_type: DataSendType) -> Result<Self> {
        let payload = payload.into();
        check_request_opcode(opcode)?;
        check_payload(payload.len())?;
        Ok(Self {
            opcode,
            payload,
            send_type,
        })
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn send_type(&self) -> DataSendType {
        self.send_type
    }

    pub fn frame(&self) -> Frame {
        Frame::new(self.opcode, self.payload.clone())
    }
}

/// What a finished transfer put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferReport {
    pub chunks_sent: usize,
    pub bytes_sent: usize,
}

/// Progress callback: `(chunks_done, chunks_total)`.
pub type ProgressFn = Box<dyn FnMut(usize, usize) + Send + 'static>;

/// An ordered run of chunks sharing one send mode and one completion.
pub struct DataSequence {
    chunks: Vec<DataObj>,
    send_type: DataSendType,
    context: DataObjContext,
    chunk_timeout: Option<Duration>,
    progress: Option<ProgressFn>,
}

impl DataSequence {
    /// Every chunk must carry `send_type`.
    pub fn new(send_type: DataSendType, chunks: Vec<DataObj>, context: DataObjContext) -> Result<Self> {
        if chunks.is_empty() {
            return Err(SdkError::InvalidParameter(
                "data sequence has no chunks".to_string(),
            ));
        }
        if let Some(odd) = chunks.iter().find(|c| c.send_type != send_type) {
            return Err(SdkError::InvalidParameter(format!(
                "chunk {} is {} in a {} sequence",
                odd.opcode, odd.send_type, send_type
            )));
        }
        Ok(Self {
            chunks,
            send_type,
            context,
            chunk_timeout: None,
            progress: None,
        })
    }

    /// Override the connection's per-chunk acknowledgment deadline.
    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = Some(timeout);
        self
    }

    /// Called after each chunk is written (or acknowledged, when waiting).
    pub fn on_progress<F>(mut self, progress: F) -> Self
    where
        F: FnMut(usize, usize) + Send + 'static,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn send_type(&self) -> DataSendType {
        self.send_type
    }

    pub fn chunks(&self) -> &[DataObj] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn token(&self) -> CorrelationToken {
        self.context.token()
    }

    pub fn chunk_timeout(&self) -> Option<Duration> {
        self.chunk_timeout
    }

    pub fn total_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.payload.len()).sum()
    }

    pub(crate) fn into_parts(self) -> (Vec<DataObj>, DataObjContext, Option<ProgressFn>) {
        (self.chunks, self.context, self.progress)
    }
}

impl fmt::Debug for DataSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSequence")
            .field("send_type", &self.send_type)
            .field("chunks", &self.chunks.len())
            .field("bytes", &self.total_bytes())
            .field("token", &self.context.token())
            .finish()
    }
}

fn check_request_opcode(opcode: OpCode) -> Result<()> {
    if !opcode.is_known() {
        return Err(SdkError::InvalidParameter(format!(
            "unknown opcode 0x{:04X}",
            opcode.code()
        )));
    }
    if opcode.is_notification() {
        return Err(SdkError::InvalidParameter(format!(
            "{} is a device notification, not a request",
            opcode
        )));
    }
    Ok(())
}

fn check_payload(len: usize) -> Result<()> {
    if len > MAX_PAYLOAD {
        return Err(SdkError::InvalidParameter(format!(
            "payload of {} bytes exceeds frame limit {}",
            len, MAX_PAYLOAD
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx<T: Send + 'static>() -> Context<T> {
        Context::new(|_| {})
    }

    #[test]
    fn test_command_frame() {
        let cmd = Command::new(OpCode::SET_DENSITY, vec![3], ctx()).unwrap();
        assert_eq!(cmd.frame().encode().unwrap(), vec![0x00, 0x10, 0x00, 0x01, 0x03]);
        assert_eq!(cmd.params(), &[3]);
    }

    #[test]
    fn test_command_rejects_unknown_and_notification_opcodes() {
        assert!(matches!(
            Command::new(OpCode(0x0999), vec![], ctx()),
            Err(SdkError::InvalidParameter(_))
        ));
        assert!(matches!(
            Command::new(OpCode::STATUS_PRINT_COMPLETE, vec![], ctx()),
            Err(SdkError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_command_rejects_oversized_params() {
        let params = vec![0u8; MAX_PAYLOAD + 1];
        assert!(Command::new(OpCode::LOGO_DATA, params, ctx()).is_err());
    }

    #[test]
    fn test_command_tokens_are_unique() {
        let a = Command::new(OpCode::HEARTBEAT, vec![], ctx()).unwrap();
        let b = Command::new(OpCode::HEARTBEAT, vec![], ctx()).unwrap();
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn test_sequence_requires_consistent_send_type() {
        let a = DataObj::new(OpCode::LOGO_DATA, vec![1], DataSendType::CompleteOnceWaitNext).unwrap();
        let b = DataObj::new(OpCode::LOGO_DATA, vec![2], DataSendType::OnceContinuous).unwrap();
        assert!(DataSequence::new(DataSendType::CompleteOnceWaitNext, vec![a, b], ctx()).is_err());
    }

    #[test]
    fn test_sequence_rejects_empty() {
        assert!(DataSequence::new(DataSendType::OnceContinuous, vec![], ctx()).is_err());
    }

    #[test]
    fn test_sequence_totals() {
        let chunks = vec![
            DataObj::new(OpCode::IMAGE_ROW_DATA, vec![0; 10], DataSendType::OnceContinuous).unwrap(),
            DataObj::new(OpCode::IMAGE_ROW_DATA, vec![0; 6], DataSendType::OnceContinuous).unwrap(),
        ];
        let seq = DataSequence::new(DataSendType::OnceContinuous, chunks, ctx())
            .unwrap()
            .with_chunk_timeout(Duration::from_millis(50));
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.total_bytes(), 16);
        assert_eq!(seq.chunk_timeout(), Some(Duration::from_millis(50)));
    }
}
