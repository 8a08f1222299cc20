//! Blocking I/O loop that owns the open strategy.
//!
//! Runs on tokio's blocking pool. Each pass drains the outbound queue, then
//! waits up to one poll interval for inbound bytes. The loop ends when the
//! manager drops the outbound sender (orderly close) or when the strategy
//! reports anything other than a receive timeout (link lost).

use std::time::Duration;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use super::Event;
use crate::error::{Result, SdkError};
use crate::transport::ConnectionStrategy;

/// Bytes queued for the wire.
pub(crate) struct Outbound {
    pub bytes: Vec<u8>,
    /// Told how many bytes the strategy accepted, or why it failed.
    pub done: Option<oneshot::Sender<Result<usize>>>,
}

impl Outbound {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, done: None }
    }

    pub fn tracked(bytes: Vec<u8>) -> (Self, oneshot::Receiver<Result<usize>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                bytes,
                done: Some(tx),
            },
            rx,
        )
    }
}

pub(crate) fn run(
    mut strategy: Box<dyn ConnectionStrategy>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<Event>,
    generation: u64,
    poll_interval: Duration,
) {
    debug!(generation, transport = %strategy.kind(), "link loop started");

    let failure: SdkError = 'link: loop {
        loop {
            match outbound.try_recv() {
                Ok(out) => {
                    let result = strategy.send(&out.bytes);
                    trace!(generation, bytes = out.bytes.len(), ok = result.is_ok(), "frame written");
                    let failed = result.as_ref().err().cloned();
                    if let Some(done) = out.done {
                        let _ = done.send(result);
                    }
                    if let Some(e) = failed {
                        break 'link e;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    strategy.close();
                    debug!(generation, "link loop closed");
                    return;
                }
            }
        }

        match strategy.receive(poll_interval) {
            Ok(bytes) if bytes.is_empty() => {}
            Ok(bytes) => {
                trace!(generation, bytes = bytes.len(), "bytes received");
                if events.send(Event::Inbound { generation, bytes }).is_err() {
                    strategy.close();
                    return;
                }
            }
            Err(SdkError::ReceiveTimeout) => {}
            Err(e) => break 'link e,
        }
    };

    strategy.close();
    debug!(generation, error = %failure, "link loop ended");
    let _ = events.send(Event::LinkDown {
        generation,
        error: failure,
    });
}
