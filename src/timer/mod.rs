//! # Timer Service
//!
//! Cooperative, cancellable one-shot and repeating timers grouped into
//! named queues ("lanes").
//!
//! ## Lanes
//!
//! Each queue is served by one tokio task holding a deadline-ordered heap.
//! Timers on the same queue therefore fire in scheduled order and never
//! overlap; timers on different queues are independent.
//!
//! ```text
//! schedule_once("deadline", 2s, task) ──┐
//! schedule_repeating("heartbeat", 5s) ──┼──► lane task ──► heap ──► fire
//! cancel(handle) ───────────────────────┘       (one per queue)
//! ```
//!
//! ## Cancellation
//!
//! [`TimerService::cancel`] takes the lane's entry lock, so once it returns
//! the task is never started again. A firing that already took the task out
//! of its entry finishes, but a repeating timer is not re-armed afterwards.
//! Cancelling twice is the same as cancelling once.
//!
//! ## Clock
//!
//! Deadlines use `tokio::time::Instant` (monotonic). Tests pause tokio's
//! clock and advance it deterministically. Intervals are "at least": a
//! repeating timer is re-armed from the end of its previous firing.
//!
//! ## Tasks
//!
//! Tasks are plain closures executed on the lane. They must not block; work
//! that touches a transport is handed off (typically by sending on a
//! channel).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, trace};

use crate::error::{Result, SdkError};

/// Work run when a timer fires.
pub type TimerTask = Box<dyn FnMut() + Send + 'static>;

/// Opaque reference to a scheduled timer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    id: u64,
    queue: Arc<str>,
}

impl TimerHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

struct Entry {
    /// `None` while the task is executing on the lane.
    task: Option<TimerTask>,
    interval: Option<Duration>,
    cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    at: Instant,
    seq: u64,
    id: u64,
}

type Entries = Arc<Mutex<HashMap<u64, Entry>>>;

struct Lane {
    name: Arc<str>,
    entries: Entries,
    tx: mpsc::UnboundedSender<Scheduled>,
    worker: JoinHandle<()>,
}

/// Owner of a set of timer lanes.
///
/// One instance belongs to each managed connection; dropping it stops every
/// lane.
pub struct TimerService {
    runtime: Handle,
    lanes: Mutex<HashMap<String, Lane>>,
    next_id: AtomicU64,
    next_seq: Arc<AtomicU64>,
}

impl TimerService {
    /// Create a service bound to the current tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            SdkError::InvalidParameter(format!("timer service needs a tokio runtime: {}", e))
        })?;
        Ok(Self {
            runtime,
            lanes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Run `task` once after `delay`.
    pub fn schedule_once<F>(&self, queue: &str, delay: Duration, task: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = Some(task);
        self.schedule(
            queue,
            delay,
            None,
            Box::new(move || {
                if let Some(task) = task.take() {
                    task();
                }
            }),
        )
    }

    /// Run `task` every `interval`, first firing one interval from now.
    pub fn schedule_repeating<F>(&self, queue: &str, interval: Duration, task: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule(queue, interval, Some(interval), Box::new(task))
    }

    fn schedule(
        &self,
        queue: &str,
        delay: Duration,
        interval: Option<Duration>,
        task: TimerTask,
    ) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut lanes = self.lanes.lock();
        let lane = lanes
            .entry(queue.to_string())
            .or_insert_with(|| self.spawn_lane(queue));

        lane.entries.lock().insert(
            id,
            Entry {
                task: Some(task),
                interval,
                cancelled: false,
            },
        );
        let scheduled = Scheduled {
            at: deadline_after(delay),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            id,
        };
        if lane.tx.send(scheduled).is_err() {
            lane.entries.lock().remove(&id);
            error!(queue, "timer lane stopped, timer dropped");
        }
        trace!(queue, id, ?delay, repeating = interval.is_some(), "timer scheduled");

        TimerHandle {
            id,
            queue: lane.name.clone(),
        }
    }

    fn spawn_lane(&self, queue: &str) -> Lane {
        let name: Arc<str> = Arc::from(queue);
        let entries: Entries = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = self.runtime.spawn(run_lane(
            name.clone(),
            entries.clone(),
            rx,
            self.next_seq.clone(),
        ));
        debug!(queue, "timer lane started");
        Lane {
            name,
            entries,
            tx,
            worker,
        }
    }

    /// Cancel a timer. Returns `true` if it was still live.
    pub fn cancel(&self, handle: &TimerHandle) -> bool {
        let lanes = self.lanes.lock();
        let Some(lane) = lanes.get(handle.queue()) else {
            return false;
        };
        let mut entries = lane.entries.lock();
        cancel_entry(&mut entries, handle.id)
    }

    /// Cancel every timer on `queue`.
    pub fn cancel_queue(&self, queue: &str) -> usize {
        let lanes = self.lanes.lock();
        lanes.get(queue).map_or(0, |lane| cancel_lane(&lane.entries))
    }

    /// Cancel every timer on every queue. The lanes stay usable.
    pub fn cancel_all(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes.values().map(|lane| cancel_lane(&lane.entries)).sum()
    }

    /// Whether `handle` is still scheduled (or repeating).
    pub fn is_active(&self, handle: &TimerHandle) -> bool {
        let lanes = self.lanes.lock();
        lanes.get(handle.queue()).is_some_and(|lane| {
            lane.entries
                .lock()
                .get(&handle.id)
                .is_some_and(|e| !e.cancelled)
        })
    }

    /// Number of live timers across all queues.
    pub fn active_count(&self) -> usize {
        let lanes = self.lanes.lock();
        lanes
            .values()
            .map(|lane| lane.entries.lock().values().filter(|e| !e.cancelled).count())
            .sum()
    }

    /// Cancel everything and stop the lane tasks.
    pub fn shutdown(&self) {
        let mut lanes = self.lanes.lock();
        for (_, lane) in lanes.drain() {
            cancel_lane(&lane.entries);
            lane.worker.abort();
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("queues", &self.lanes.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}

/// Furthest a timer is ever armed; longer delays are clamped to it.
const MAX_DELAY: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay.min(MAX_DELAY))
        .unwrap_or_else(|| now + Duration::from_secs(86_400))
}

fn cancel_entry(entries: &mut HashMap<u64, Entry>, id: u64) -> bool {
    match entries.get_mut(&id) {
        Some(entry) if entry.cancelled => false,
        Some(entry) if entry.task.is_none() => {
            // Firing right now; the lane drops it afterwards.
            entry.cancelled = true;
            true
        }
        Some(_) => {
            entries.remove(&id);
            true
        }
        None => false,
    }
}

fn cancel_lane(entries: &Entries) -> usize {
    let mut entries = entries.lock();
    let ids: Vec<u64> = entries.keys().copied().collect();
    ids.into_iter()
        .filter(|id| cancel_entry(&mut entries, *id))
        .count()
}

async fn run_lane(
    name: Arc<str>,
    entries: Entries,
    mut rx: mpsc::UnboundedReceiver<Scheduled>,
    seq: Arc<AtomicU64>,
) {
    let mut heap: BinaryHeap<Reverse<Scheduled>> = BinaryHeap::new();

    loop {
        let next = heap.peek().map(|Reverse(s)| s.at);
        let far = deadline_after(Duration::from_secs(3600));

        tokio::select! {
            msg = rx.recv() => match msg {
                Some(scheduled) => heap.push(Reverse(scheduled)),
                None => break,
            },
            _ = sleep_until(next.unwrap_or(far)), if next.is_some() => {
                if let Some(Reverse(due)) = heap.pop() {
                    if let Some(rearm) = fire(&name, &entries, due.id) {
                        heap.push(Reverse(Scheduled {
                            at: deadline_after(rearm),
                            seq: seq.fetch_add(1, Ordering::Relaxed),
                            id: due.id,
                        }));
                    }
                }
            }
        }
    }

    debug!(queue = %name, "timer lane stopped");
}

/// Run one due timer. Returns the interval if it must be re-armed.
fn fire(queue: &str, entries: &Entries, id: u64) -> Option<Duration> {
    let mut task = {
        let mut guard = entries.lock();
        match guard.get_mut(&id) {
            Some(entry) if !entry.cancelled => entry.task.take()?,
            _ => return None,
        }
    };

    trace!(queue, id, "timer fired");
    if catch_unwind(AssertUnwindSafe(&mut task)).is_err() {
        error!(queue, id, "timer task panicked");
    }

    let mut guard = entries.lock();
    let rearm = match guard.get_mut(&id) {
        Some(entry) if !entry.cancelled => entry.interval,
        _ => None,
    };
    match rearm {
        Some(interval) => {
            if let Some(entry) = guard.get_mut(&id) {
                entry.task = Some(task);
            }
            Some(interval)
        }
        None => {
            guard.remove(&id);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn counter() -> (Arc<AtomicUsize>, impl FnMut() + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_once_fires_after_delay() {
        let timers = TimerService::new().unwrap();
        let (count, mut task) = counter();
        let handle = timers.schedule_once("q", Duration::from_millis(100), move || task());

        sleep(Duration::from_millis(99)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timers.is_active(&handle));

        sleep(Duration::from_millis(2)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timers.is_active(&handle));
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_until_cancelled() {
        let timers = TimerService::new().unwrap();
        let (count, task) = counter();
        let handle = timers.schedule_repeating("q", Duration::from_millis(10), task);

        sleep(Duration::from_millis(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        assert!(timers.cancel(&handle));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_delay_is_clamped() {
        let timers = TimerService::new().unwrap();
        let (count, mut task) = counter();
        let handle = timers.schedule_once("q", Duration::MAX, move || task());

        sleep(Duration::from_secs(86_400)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(timers.is_active(&handle));
        assert!(timers.cancel(&handle));
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let timers = TimerService::new().unwrap();
        let (count, mut task) = counter();
        let handle = timers.schedule_once("q", Duration::from_millis(10), move || task());

        assert!(timers.cancel(&handle));
        assert!(!timers.cancel(&handle));

        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_queue_fires_in_deadline_order() {
        let timers = TimerService::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for delay in [30u64, 10, 20] {
            let order = order.clone();
            timers.schedule_once("lane", Duration::from_millis(delay), move || {
                order.lock().push(delay)
            });
        }

        sleep(Duration::from_millis(40)).await;
        assert_eq!(*order.lock(), vec![10, 20, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_queue_never_overlaps() {
        let timers = TimerService::new().unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = running.clone();
            let overlaps = overlaps.clone();
            timers.schedule_once("lane", Duration::from_millis(5), move || {
                if running.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        sleep(Duration::from_millis(10)).await;
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_can_cancel_itself() {
        let timers = Arc::new(TimerService::new().unwrap());
        let slot: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));
        let (count, mut bump) = counter();

        let handle = {
            let timers_in_task = timers.clone();
            let slot = slot.clone();
            timers.schedule_repeating("q", Duration::from_millis(10), move || {
                bump();
                if let Some(handle) = slot.lock().as_ref() {
                    timers_in_task.cancel(handle);
                }
            })
        };
        *slot.lock() = Some(handle.clone());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!timers.is_active(&handle));
        assert_eq!(timers.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_and_reuse() {
        let timers = TimerService::new().unwrap();
        let (count, task) = counter();
        timers.schedule_repeating("a", Duration::from_millis(10), task);
        let (other, mut task) = counter();
        timers.schedule_once("b", Duration::from_millis(10), move || task());

        assert_eq!(timers.cancel_all(), 2);
        sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(other.load(Ordering::SeqCst), 0);

        let (again, mut task) = counter();
        timers.schedule_once("a", Duration::from_millis(10), move || task());
        sleep(Duration::from_millis(20)).await;
        assert_eq!(again.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_task_does_not_kill_lane() {
        let timers = TimerService::new().unwrap();
        timers.schedule_once("q", Duration::from_millis(5), || panic!("boom"));
        let (count, mut task) = counter();
        timers.schedule_once("q", Duration::from_millis(10), move || task());

        sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert!(matches!(
            TimerService::new(),
            Err(SdkError::InvalidParameter(_))
        ));
    }
}
