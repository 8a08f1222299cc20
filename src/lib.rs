//! # Printlink - Portable Printer Device SDK
//!
//! Printlink talks to portable print heads over USB, serial ports and
//! classic Bluetooth. It provides:
//!
//! - **Transports**: interchangeable connection strategies behind one trait
//! - **Managed connections**: request/response correlation, chunked
//!   transfers with flow control, heartbeat and reconnect with backoff
//! - **Row packing**: the device's half-width bitmap encoding
//! - **Data factories**: logo and multi-row image chunking
//!
//! ## Quick Start
//!
//! ```no_run
//! use printlink::{
//!     connection::{ConnectionConfig, ManagedConnection},
//!     factory::MultiRowDataFactory,
//!     protocol::OpCode,
//!     transport::ConnectionParameters,
//! };
//!
//! # async fn demo() -> printlink::Result<()> {
//! let conn = ManagedConnection::new(
//!     ConnectionParameters::serial("/dev/ttyUSB0", 115_200),
//!     ConnectionConfig::default(),
//! )?;
//! conn.connect().await?;
//!
//! // Single request
//! conn.request(OpCode::SET_DENSITY, vec![8]).await?;
//!
//! // Streamed image
//! let image = image::open("label.png").unwrap().to_luma8();
//! let chunks = MultiRowDataFactory::default().build_image(&image, 128)?;
//! let report = conn.transfer(chunks).await?;
//! println!("sent {} chunks", report.chunks_sent);
//!
//! conn.disconnect();
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Overview
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`transport`] | Connection strategies, factory, discovery |
//! | [`connection`] | Managed connection lifecycle |
//! | [`command`] | Commands, data objects, contexts |
//! | [`protocol`] | Opcode table and wire frames |
//! | [`codec`] | Row packing and column bitmaps |
//! | [`factory`] | Logo and multi-row data factories |
//! | [`timer`] | Cancellable timer lanes |
//! | [`error`] | Error types |

pub mod codec;
pub mod command;
pub mod connection;
pub mod error;
pub mod factory;
pub mod protocol;
pub mod timer;
pub mod transport;

// Re-exports for convenience
pub use connection::{ConnectionConfig, ConnectionStatus, ManagedConnection};
pub use error::{Result, SdkError};
pub use transport::ConnectionParameters;
