//! Pending-response table.
//!
//! Every in-flight context has exactly one entry here, keyed by its
//! correlation token. Responses carry no token on the wire, so entries that
//! expect a response are also queued per opcode and matched FIFO.
//!
//! Removal is the only way to get at a completion, and removal happens under
//! the table lock, so whichever of response, deadline or teardown gets there
//! first is the only one that runs the callback.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::command::CorrelationToken;
use crate::error::Result;
use crate::protocol::{Frame, OpCode};
use crate::timer::TimerHandle;

pub(crate) type Completion = Box<dyn FnOnce(Result<Frame>) + Send + 'static>;

pub(crate) struct PendingEntry {
    pub deadline: Option<TimerHandle>,
    pub completion: Completion,
}

struct Slot {
    opcode: Option<OpCode>,
    entry: PendingEntry,
}

#[derive(Default)]
struct Table {
    slots: HashMap<CorrelationToken, Slot>,
    by_opcode: HashMap<OpCode, VecDeque<CorrelationToken>>,
}

#[derive(Clone, Default)]
pub(crate) struct PendingTable {
    inner: Arc<Mutex<Table>>,
}

impl PendingTable {
    /// Register a context. `opcode` is the response it waits for; `None`
    /// for entries that only need teardown (whole transfers).
    pub fn insert(&self, token: CorrelationToken, opcode: Option<OpCode>, completion: Completion) {
        let mut table = self.inner.lock();
        if let Some(op) = opcode {
            table.by_opcode.entry(op).or_default().push_back(token);
        }
        table.slots.insert(
            token,
            Slot {
                opcode,
                entry: PendingEntry {
                    deadline: None,
                    completion,
                },
            },
        );
    }

    /// Attach a deadline timer. Returns `false` if the entry is already
    /// gone, in which case the caller cancels the timer.
    pub fn set_deadline(&self, token: CorrelationToken, handle: TimerHandle) -> bool {
        match self.inner.lock().slots.get_mut(&token) {
            Some(slot) => {
                slot.entry.deadline = Some(handle);
                true
            }
            None => false,
        }
    }

    pub fn take(&self, token: CorrelationToken) -> Option<PendingEntry> {
        let mut table = self.inner.lock();
        let slot = table.slots.remove(&token)?;
        if let Some(op) = slot.opcode {
            if let Some(queue) = table.by_opcode.get_mut(&op) {
                queue.retain(|t| *t != token);
                if queue.is_empty() {
                    table.by_opcode.remove(&op);
                }
            }
        }
        Some(slot.entry)
    }

    /// Oldest entry waiting for `opcode`.
    pub fn match_response(&self, opcode: OpCode) -> Option<(CorrelationToken, PendingEntry)> {
        let mut table = self.inner.lock();
        let queue = table.by_opcode.get_mut(&opcode)?;
        let token = queue.pop_front()?;
        if queue.is_empty() {
            table.by_opcode.remove(&opcode);
        }
        let slot = table.slots.remove(&token)?;
        Some((token, slot.entry))
    }

    /// Remove everything, oldest token first.
    pub fn drain(&self) -> Vec<PendingEntry> {
        let mut table = self.inner.lock();
        table.by_opcode.clear();
        let mut slots: Vec<_> = table.slots.drain().collect();
        slots.sort_by_key(|(token, _)| *token);
        slots.into_iter().map(|(_, slot)| slot.entry).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn contains(&self, token: CorrelationToken) -> bool {
        self.inner.lock().slots.contains_key(&token)
    }
}
