//! # Mock Transport
//!
//! An in-memory print head for tests and offline development. A
//! [`MockDevice`] is the scripted "hardware"; every [`MockStrategy`] built
//! from it talks to the same device, so a connection manager can reconnect
//! to it after a simulated drop.
//!
//! ```
//! use printlink::protocol::{Frame, OpCode};
//! use printlink::transport::{ConnectionStrategy, MockDevice};
//! use std::time::Duration;
//!
//! let device = MockDevice::new();
//! device.respond_with_echo();
//!
//! let mut strategy = device.strategy();
//! strategy.open().unwrap();
//! strategy.send(&Frame::new(OpCode::HEARTBEAT, vec![]).encode().unwrap()).unwrap();
//! let reply = strategy.receive(Duration::from_millis(50)).unwrap();
//! assert_eq!(reply, vec![0x02, 0x20, 0x00, 0x00]);
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{ConnectionStrategy, DeviceInfo, TransportKind};
use crate::error::{Result, SdkError};
use crate::protocol::{Frame, FrameDecoder};

/// Computes the device's replies to one frame written by the host.
pub type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

#[derive(Default)]
struct MockState {
    inbound: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    frames: Vec<Frame>,
    decoder: FrameDecoder,
    responder: Option<Responder>,
    /// Opens that will fail before one succeeds; `usize::MAX` = never succeed
    failing_opens: usize,
    opens: usize,
    /// Bumped on every simulated drop; strategies opened earlier see a dead link
    generation: u64,
    short_write: Option<usize>,
    read_chunk: Option<usize>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<MockState>,
    readable: Condvar,
}

/// Scripted device shared by any number of strategies.
#[derive(Clone, Default)]
pub struct MockDevice {
    shared: Arc<Shared>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new strategy connected to this device.
    pub fn strategy(&self) -> MockStrategy {
        MockStrategy {
            device: self.clone(),
            opened_generation: None,
        }
    }

    /// Reply to every frame through `responder`.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&Frame) -> Vec<Frame> + Send + 'static,
    {
        self.shared.state.lock().responder = Some(Box::new(responder));
    }

    /// Echo every frame back with the same opcode and payload.
    pub fn respond_with_echo(&self) {
        self.set_responder(|frame| vec![frame.clone()]);
    }

    /// Stop replying.
    pub fn silence(&self) {
        self.shared.state.lock().responder = None;
    }

    /// Make the next `count` opens fail; `usize::MAX` fails them all.
    pub fn fail_opens(&self, count: usize) {
        self.shared.state.lock().failing_opens = count;
    }

    /// Simulate the link dropping under every open strategy.
    pub fn drop_link(&self) {
        let mut state = self.shared.state.lock();
        state.generation += 1;
        state.inbound.clear();
        self.shared.readable.notify_all();
    }

    /// Accept only `written` bytes of the next send.
    pub fn short_write_next(&self, written: usize) {
        self.shared.state.lock().short_write = Some(written);
    }

    /// Deliver at most `bytes` per receive, to exercise partial reads.
    pub fn set_read_chunk(&self, bytes: usize) {
        self.shared.state.lock().read_chunk = Some(bytes.max(1));
    }

    /// Queue a device-originated frame.
    pub fn inject(&self, frame: &Frame) {
        if let Ok(bytes) = frame.encode() {
            self.inject_raw(&bytes);
        }
    }

    /// Queue raw bytes, well-formed or not.
    pub fn inject_raw(&self, bytes: &[u8]) {
        let mut state = self.shared.state.lock();
        state.inbound.extend(bytes);
        self.shared.readable.notify_all();
    }

    /// Frames the host has written, decoded, in order.
    pub fn frames(&self) -> Vec<Frame> {
        self.shared.state.lock().frames.clone()
    }

    /// Raw byte slices passed to each successful `send`.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.state.lock().writes.clone()
    }

    /// Number of `open` calls, successful or not.
    pub fn open_count(&self) -> usize {
        self.shared.state.lock().opens
    }
}

impl std::fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MockDevice")
            .field("opens", &state.opens)
            .field("frames", &state.frames.len())
            .field("generation", &state.generation)
            .finish()
    }
}

/// Strategy half of the mock.
#[derive(Debug)]
pub struct MockStrategy {
    device: MockDevice,
    opened_generation: Option<u64>,
}

impl MockStrategy {
    fn check_link(&self, state: &MockState) -> Result<()> {
        match self.opened_generation {
            Some(generation) if generation == state.generation => Ok(()),
            Some(_) => Err(SdkError::ConnectionLost("mock link dropped".into())),
            None => Err(SdkError::ConnectionLost("mock link not open".into())),
        }
    }
}

impl ConnectionStrategy for MockStrategy {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn open(&mut self) -> Result<DeviceInfo> {
        let mut state = self.device.shared.state.lock();
        state.opens += 1;
        if state.failing_opens > 0 {
            if state.failing_opens != usize::MAX {
                state.failing_opens -= 1;
            }
            return Err(SdkError::OpenFailed("mock device unavailable".into()));
        }
        self.opened_generation = Some(state.generation);
        Ok(DeviceInfo::new("Mock Print Head", "mock://0", TransportKind::Serial))
    }

    fn close(&mut self) {
        self.opened_generation = None;
    }

    fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        let mut state = self.device.shared.state.lock();
        self.check_link(&state)?;

        if let Some(accepted) = state.short_write.take() {
            if accepted < bytes.len() {
                return Err(SdkError::PartialWrite {
                    written: accepted,
                    expected: bytes.len(),
                });
            }
        }

        state.writes.push(bytes.to_vec());
        state.decoder.push(bytes);
        let decoded: Vec<Frame> = state.decoder.decode_all().into_iter().flatten().collect();

        for frame in decoded {
            let replies = match state.responder.as_mut() {
                Some(responder) => responder(&frame),
                None => Vec::new(),
            };
            state.frames.push(frame);
            for reply in replies {
                if let Ok(encoded) = reply.encode() {
                    state.inbound.extend(encoded);
                }
            }
        }
        self.device.shared.readable.notify_all();

        Ok(bytes.len())
    }

    fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.device.shared.state.lock();

        loop {
            self.check_link(&state)?;
            if !state.inbound.is_empty() {
                let n = state
                    .read_chunk
                    .unwrap_or(usize::MAX)
                    .min(state.inbound.len());
                return Ok(state.inbound.drain(..n).collect());
            }
            if self
                .device
                .shared
                .readable
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                self.check_link(&state)?;
                if state.inbound.is_empty() {
                    return Err(SdkError::ReceiveTimeout);
                }
            }
        }
    }

    fn is_connected(&self) -> bool {
        let state = self.device.shared.state.lock();
        self.check_link(&state).is_ok()
    }
}
