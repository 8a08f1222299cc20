//! # Print Head Protocol
//!
//! The opcode-addressed binary protocol spoken by the print head.
//!
//! ## Module Structure
//!
//! - [`opcode`]: the command catalogue and its numeric ranges
//! - [`frame`]: frame encoding and the streaming decoder
//!
//! ## Usage Example
//!
//! ```
//! use printlink::protocol::{Frame, FrameDecoder, OpCode};
//!
//! let bytes = Frame::new(OpCode::SET_SPEED, vec![3]).encode().unwrap();
//!
//! let mut decoder = FrameDecoder::default();
//! decoder.push(&bytes);
//! let frame = decoder.next_frame().unwrap().unwrap();
//! assert_eq!(frame.opcode, OpCode::SET_SPEED);
//! ```

pub mod frame;
pub mod opcode;

pub use frame::{Frame, FrameDecoder, HEADER_LEN, MAX_PAYLOAD};
pub use opcode::{OPCODE_TABLE, OpCode, OpCodeGroup, OpCodeInfo};
