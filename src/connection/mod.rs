//! # Managed Connection
//!
//! Lifecycle supervision for one print-head link: connect, request/response
//! correlation, chunked transfers, heartbeat and reconnect.
//!
//! ## State Machine
//!
//! ```text
//! Disconnected ──connect()──► Connecting ──open ok──► Connected
//!                                 │                    │  ▲
//!                              open err     link lost  │  │ open ok
//!                                 ▼                    ▼  │
//!                               Failed ◄──exhausted── Reconnecting
//!
//! any state ──disconnect()──► Disconnected
//! ```
//!
//! A failed initial `connect()` is not retried; only a drop of an
//! established link enters `Reconnecting`. Entering `Reconnecting` fails
//! every pending context with `ConnectionLost` at once.
//!
//! ## Tasks
//!
//! | Task | Runs on | Owns |
//! |------|---------|------|
//! | link loop | blocking pool | the open strategy |
//! | supervisor | tokio | frame decoder, event handling |
//! | transfers | tokio, one per sequence | the sequence's context |
//! | timers | [`TimerService`] lanes | deadline, heartbeat and reconnect tasks |
//!
//! Submission (`send_command`, `send_data`) checks the link and registers
//! the context under one lock, so units reach the wire in submission order
//! and teardown never misses an entry.
//!
//! ## Response Matching
//!
//! Responses echo the request opcode and carry no token, so each response
//! completes the oldest pending context for its opcode. Notifications
//! (opcode 0x1000 and above) go to [`ManagedConnection::subscribe_notifications`].
//! Unmatched frames and decode errors are logged and dropped.

mod backoff;
pub mod config;
mod link;
mod pending;

pub use backoff::ReconnectBackoff;
pub use config::{BackoffConfig, ConnectionConfig};

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::command::{
    self, Command, CommandContext, CorrelationToken, DataObj, DataObjContext, DataSendType,
    DataSequence, ProgressFn, TransferReport,
};
use crate::error::{Result, SdkError};
use crate::protocol::{Frame, FrameDecoder, OpCode};
use crate::timer::{TimerHandle, TimerService};
use crate::transport::{ConnectionParameters, ConnectionStrategy, DeviceInfo, StrategyFactory};

use link::Outbound;
use pending::{Completion, PendingTable};

const DEADLINE_QUEUE: &str = "deadline";
const HEARTBEAT_QUEUE: &str = "heartbeat";
const RECONNECT_QUEUE: &str = "reconnect";

/// Capacity of the notification broadcast; slow subscribers see `Lagged`.
const NOTIFICATION_CAPACITY: usize = 64;

/// Lifecycle state of a managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Messages into the supervisor.
pub(crate) enum Event {
    Inbound { generation: u64, bytes: Vec<u8> },
    LinkDown { generation: u64, error: SdkError },
    ReconnectDue,
    Heartbeat,
    HeartbeatResult { generation: u64, ok: bool },
}

// ============================================================================
// Shared state
// ============================================================================

struct Core {
    status: ConnectionStatus,
    /// Bumped whenever a link is attached or abandoned; events from older
    /// links are ignored.
    generation: u64,
    link: Option<mpsc::UnboundedSender<Outbound>>,
    link_task: Option<JoinHandle<()>>,
    device: Option<DeviceInfo>,
    backoff: ReconnectBackoff,
    heartbeat: Option<TimerHandle>,
    heartbeat_misses: u32,
}

impl Core {
    fn connected_link(&self) -> Option<mpsc::UnboundedSender<Outbound>> {
        match self.status {
            ConnectionStatus::Connected => self.link.clone(),
            _ => None,
        }
    }
}

struct Shared {
    params: ConnectionParameters,
    config: ConnectionConfig,
    factory: StrategyFactory,
    timers: TimerService,
    pending: PendingTable,
    core: Mutex<Core>,
    status_tx: watch::Sender<ConnectionStatus>,
    notify_tx: broadcast::Sender<Frame>,
    events: mpsc::UnboundedSender<Event>,
}

struct TransferRun {
    token: CorrelationToken,
    send_type: DataSendType,
    total: usize,
    chunk_timeout: Duration,
    state: Arc<TransferState>,
}

enum TransferPlan {
    /// Every chunk already queued; one write result per chunk.
    Continuous(Vec<oneshot::Receiver<Result<usize>>>),
    /// First chunk queued and awaiting its acknowledgment.
    WaitNext {
        first: PendingChunk,
        rest: VecDeque<(OpCode, Vec<u8>)>,
    },
}

struct PendingChunk {
    token: CorrelationToken,
    wire_len: usize,
    ack: oneshot::Receiver<Result<Frame>>,
}

/// Progress of a running transfer, readable after it is aborted.
#[derive(Default)]
struct TransferState {
    confirmed: AtomicUsize,
    in_flight: Mutex<Option<CorrelationToken>>,
}

fn not_connected(status: ConnectionStatus) -> SdkError {
    SdkError::ConnectionLost(format!("not connected ({})", status))
}

impl Shared {
    fn set_status(&self, core: &mut Core, status: ConnectionStatus) {
        if core.status != status {
            info!(from = %core.status, to = %status, params = %self.params, "connection status changed");
        }
        core.status = status;
        self.status_tx.send_replace(status);
    }

    fn fail_all(&self, entries: Vec<pending::PendingEntry>, error: &SdkError) {
        if !entries.is_empty() {
            debug!(count = entries.len(), error = %error, "failing pending contexts");
        }
        for entry in entries {
            if let Some(deadline) = &entry.deadline {
                self.timers.cancel(deadline);
            }
            (entry.completion)(Err(error.clone()));
        }
    }

    fn finish(&self, entry: pending::PendingEntry, result: Result<Frame>) {
        if let Some(deadline) = &entry.deadline {
            self.timers.cancel(deadline);
        }
        (entry.completion)(result);
    }

    fn arm_deadline(&self, token: CorrelationToken, timeout: Duration) {
        let pending = self.pending.clone();
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let handle = self.timers.schedule_once(DEADLINE_QUEUE, timeout, move || {
            if let Some(entry) = pending.take(token) {
                warn!(%token, timeout_ms = ms, "request timed out");
                (entry.completion)(Err(SdkError::RequestTimeout(ms)));
            }
        });
        if !self.pending.set_deadline(token, handle.clone()) {
            self.timers.cancel(&handle);
        }
    }

    // ------------------------------------------------------------------------
    // Link management
    // ------------------------------------------------------------------------

    async fn open_link(&self) -> Result<(Box<dyn ConnectionStrategy>, DeviceInfo)> {
        let mut strategy = self.factory.create(&self.params)?;
        tokio::task::spawn_blocking(move || -> Result<_> {
            let info = strategy.open()?;
            Ok((strategy, info))
        })
        .await
        .map_err(|e| SdkError::OpenFailed(format!("open task failed: {}", e)))?
    }

    fn attach(&self, core: &mut Core, strategy: Box<dyn ConnectionStrategy>, device: DeviceInfo) {
        core.generation += 1;
        let generation = core.generation;
        let (tx, rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        let poll = self.config.poll_interval();
        core.link_task = Some(tokio::task::spawn_blocking(move || {
            link::run(strategy, rx, events, generation, poll)
        }));
        core.link = Some(tx);
        info!(device = %device.name, address = %device.address, generation, "link established");
        core.device = Some(device);
        core.backoff.reset();
        core.heartbeat_misses = 0;
        self.set_status(core, ConnectionStatus::Connected);

        if let Some(interval) = self.config.heartbeat_interval() {
            let events = self.events.clone();
            core.heartbeat = Some(self.timers.schedule_repeating(
                HEARTBEAT_QUEUE,
                interval,
                move || {
                    let _ = events.send(Event::Heartbeat);
                },
            ));
        }
    }

    /// Abandon the current link. Returns the pending contexts to fail once
    /// the lock is released.
    fn detach(&self, core: &mut Core) -> Vec<pending::PendingEntry> {
        core.generation += 1;
        core.link = None;
        core.device = None;
        if let Some(heartbeat) = core.heartbeat.take() {
            self.timers.cancel(&heartbeat);
        }
        self.pending.drain()
    }

    fn link_lost(&self, core: &mut Core, reason: &SdkError) -> Vec<pending::PendingEntry> {
        warn!(error = %reason, params = %self.params, "link lost");
        let drained = self.detach(core);
        self.set_status(core, ConnectionStatus::Reconnecting);
        self.schedule_reconnect(core);
        drained
    }

    fn schedule_reconnect(&self, core: &mut Core) {
        match core.backoff.next_delay() {
            Some(delay) => {
                info!(attempt = core.backoff.attempt(), ?delay, "reconnect scheduled");
                let events = self.events.clone();
                self.timers.schedule_once(RECONNECT_QUEUE, delay, move || {
                    let _ = events.send(Event::ReconnectDue);
                });
            }
            None => {
                error!(attempts = core.backoff.attempt(), params = %self.params, "giving up on reconnect");
                self.set_status(core, ConnectionStatus::Failed);
            }
        }
    }

    async fn reconnect(&self) {
        let previous = {
            let mut core = self.core.lock();
            if core.status != ConnectionStatus::Reconnecting {
                return;
            }
            core.link_task.take()
        };
        if let Some(task) = previous {
            let _ = task.await;
        }

        let result = self.open_link().await;

        let mut core = self.core.lock();
        if core.status != ConnectionStatus::Reconnecting {
            if let Ok((mut strategy, _)) = result {
                strategy.close();
            }
            return;
        }
        match result {
            Ok((strategy, device)) => self.attach(&mut core, strategy, device),
            Err(e) => {
                warn!(attempt = core.backoff.attempt(), error = %e, "reconnect attempt failed");
                self.schedule_reconnect(&mut core);
            }
        }
    }

    fn teardown(&self, reason: &str) {
        let drained = {
            let mut core = self.core.lock();
            let drained = self.detach(&mut core);
            self.set_status(&mut core, ConnectionStatus::Disconnected);
            drained
        };
        self.timers.cancel_all();
        self.fail_all(drained, &SdkError::ConnectionLost(reason.to_string()));
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    fn send_command(&self, command: Command) -> CorrelationToken {
        let (frame, context) = command.into_parts();
        let (token, timeout, callback) = context.into_parts();
        let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());

        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                callback(Err(e));
                return token;
            }
        };

        let core = self.core.lock();
        let Some(link) = core.connected_link() else {
            let status = core.status;
            drop(core);
            callback(Err(not_connected(status)));
            return token;
        };
        self.pending.insert(token, Some(frame.opcode), callback);
        let queued = link.send(Outbound::new(bytes)).is_ok();
        drop(core);

        if !queued {
            if let Some(entry) = self.pending.take(token) {
                self.finish(entry, Err(SdkError::ConnectionLost("link closed".to_string())));
            }
            return token;
        }
        debug!(%token, opcode = %frame.opcode, "command queued");
        self.arm_deadline(token, timeout);
        token
    }

    /// Register an acknowledged chunk and queue it. Caller holds the core
    /// lock and arms the deadline afterwards.
    fn queue_ack_chunk(
        &self,
        link: &mpsc::UnboundedSender<Outbound>,
        opcode: OpCode,
        bytes: Vec<u8>,
    ) -> (CorrelationToken, PendingChunk) {
        let token = CorrelationToken::next();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            token,
            Some(opcode),
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        let wire_len = bytes.len();
        // A closed link is reported through the drain that follows.
        let _ = link.send(Outbound::new(bytes));
        (
            token,
            PendingChunk {
                token,
                wire_len,
                ack: rx,
            },
        )
    }

    fn submit_ack_chunk(&self, opcode: OpCode, bytes: Vec<u8>, timeout: Duration) -> Result<PendingChunk> {
        let core = self.core.lock();
        let link = core
            .connected_link()
            .ok_or_else(|| not_connected(core.status))?;
        let (token, chunk) = self.queue_ack_chunk(&link, opcode, bytes);
        drop(core);
        self.arm_deadline(token, timeout);
        Ok(chunk)
    }

    fn send_data(self: &Arc<Self>, sequence: DataSequence) -> CorrelationToken {
        let token = sequence.token();
        let send_type = sequence.send_type();
        let chunk_timeout = sequence
            .chunk_timeout()
            .unwrap_or_else(|| self.config.chunk_timeout());
        let (chunks, context, progress) = sequence.into_parts();
        let deadline = context.timeout();
        let total = chunks.len();
        let state = Arc::new(TransferState::default());

        let encoded: Result<VecDeque<(OpCode, Vec<u8>)>> = chunks
            .iter()
            .map(|chunk| Ok((chunk.opcode(), chunk.frame().encode()?)))
            .collect();
        let mut encoded = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                context.complete(Err(e));
                return token;
            }
        };

        let (abort_tx, abort_rx) = oneshot::channel::<SdkError>();
        let abort: Completion = Box::new(move |result| {
            if let Err(e) = result {
                let _ = abort_tx.send(e);
            }
        });

        let core = self.core.lock();
        let Some(link) = core.connected_link() else {
            let status = core.status;
            drop(core);
            context.complete(Err(not_connected(status)));
            return token;
        };
        self.pending.insert(token, None, abort);

        let mut first_ack = None;
        let plan = match send_type {
            DataSendType::OnceContinuous => TransferPlan::Continuous(
                encoded
                    .into_iter()
                    .map(|(_, bytes)| {
                        let (out, written) = Outbound::tracked(bytes);
                        let _ = link.send(out);
                        written
                    })
                    .collect(),
            ),
            DataSendType::CompleteOnceWaitNext => match encoded.pop_front() {
                Some((opcode, bytes)) => {
                    let (chunk_token, first) = self.queue_ack_chunk(&link, opcode, bytes);
                    first_ack = Some(chunk_token);
                    *state.in_flight.lock() = Some(chunk_token);
                    TransferPlan::WaitNext {
                        first,
                        rest: encoded,
                    }
                }
                None => TransferPlan::Continuous(Vec::new()),
            },
        };
        drop(core);

        if let Some(timeout) = deadline {
            self.arm_deadline(token, timeout);
        }
        if let Some(chunk_token) = first_ack {
            self.arm_deadline(chunk_token, chunk_timeout);
        }
        debug!(%token, mode = %send_type, chunks = total, ?deadline, "transfer started");

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let run = TransferRun {
                token,
                send_type,
                total,
                chunk_timeout,
                state,
            };
            shared.run_transfer(run, plan, context, progress, abort_rx).await
        });
        token
    }

    async fn run_transfer(
        &self,
        run: TransferRun,
        plan: TransferPlan,
        context: DataObjContext,
        progress: Option<ProgressFn>,
        abort: oneshot::Receiver<SdkError>,
    ) {
        let token = run.token;
        let result = tokio::select! {
            result = self.drive(plan, progress, run.chunk_timeout, &run.state) => result,
            aborted = abort => Err(self.aborted(&run, aborted.unwrap_or_else(|_| {
                SdkError::ConnectionLost("transfer abandoned".to_string())
            }))),
        };
        if let Some(entry) = self.pending.take(token) {
            if let Some(deadline) = &entry.deadline {
                self.timers.cancel(deadline);
            }
        }

        match &result {
            Ok(report) => debug!(%token, chunks = report.chunks_sent, bytes = report.bytes_sent, "transfer complete"),
            Err(e) => warn!(%token, error = %e, "transfer failed"),
        }
        context.complete(result);
    }

    /// Release the chunk still awaiting its ack and shape the error an
    /// aborted transfer reports.
    fn aborted(&self, run: &TransferRun, error: SdkError) -> SdkError {
        let in_flight = run.state.in_flight.lock().take();
        if let Some(chunk) = in_flight {
            if let Some(entry) = self.pending.take(chunk) {
                self.finish(entry, Err(error.clone()));
            }
        }
        match run.send_type {
            DataSendType::CompleteOnceWaitNext if error.is_timeout() => SdkError::PartialTransfer {
                chunks_confirmed: run.state.confirmed.load(Ordering::SeqCst),
                chunks_total: run.total,
                reason: error.to_string(),
            },
            _ => error,
        }
    }

    async fn drive(
        &self,
        plan: TransferPlan,
        mut progress: Option<ProgressFn>,
        chunk_timeout: Duration,
        state: &TransferState,
    ) -> Result<TransferReport> {
        let mut report = TransferReport::default();
        let mut tick = |done: usize, total: usize| {
            if let Some(progress) = progress.as_mut() {
                progress(done, total);
            }
        };

        match plan {
            TransferPlan::Continuous(writes) => {
                let total = writes.len();
                for written in writes {
                    let bytes = written.await.unwrap_or_else(|_| {
                        Err(SdkError::ConnectionLost("link closed mid-transfer".to_string()))
                    })?;
                    report.chunks_sent += 1;
                    report.bytes_sent += bytes;
                    tick(report.chunks_sent, total);
                }
            }
            TransferPlan::WaitNext { first, mut rest } => {
                let total = rest.len() + 1;
                let mut current = first;
                loop {
                    let ack = current.ack.await.unwrap_or_else(|_| {
                        Err(SdkError::ConnectionLost("link closed mid-transfer".to_string()))
                    });
                    match ack {
                        Ok(_) => {}
                        Err(e) if e.is_timeout() => {
                            return Err(SdkError::PartialTransfer {
                                chunks_confirmed: report.chunks_sent,
                                chunks_total: total,
                                reason: e.to_string(),
                            });
                        }
                        Err(e) => return Err(e),
                    }
                    report.chunks_sent += 1;
                    report.bytes_sent += current.wire_len;
                    state.confirmed.store(report.chunks_sent, Ordering::SeqCst);
                    tick(report.chunks_sent, total);
                    trace!(chunk = report.chunks_sent, total, "chunk acknowledged");

                    let Some((opcode, bytes)) = rest.pop_front() else {
                        break;
                    };
                    current = self.submit_ack_chunk(opcode, bytes, chunk_timeout)?;
                    *state.in_flight.lock() = Some(current.token);
                }
            }
        }
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    fn dispatch(&self, frame: Frame) {
        if frame.opcode.is_notification() {
            debug!(opcode = %frame.opcode, len = frame.payload.len(), "notification");
            let _ = self.notify_tx.send(frame);
            return;
        }
        match self.pending.match_response(frame.opcode) {
            Some((token, entry)) => {
                trace!(%token, opcode = %frame.opcode, "response matched");
                self.finish(entry, Ok(frame));
            }
            None => warn!(opcode = %frame.opcode, "unmatched response dropped"),
        }
    }

    fn heartbeat(&self) {
        let generation = {
            let core = self.core.lock();
            if core.status != ConnectionStatus::Connected {
                return;
            }
            core.generation
        };
        let events = self.events.clone();
        let context = CommandContext::new(move |result: Result<Frame>| {
            let _ = events.send(Event::HeartbeatResult {
                generation,
                ok: result.is_ok(),
            });
        })
        .with_timeout(self.config.heartbeat_timeout());
        match Command::new(OpCode::HEARTBEAT, Vec::new(), context) {
            Ok(command) => {
                self.send_command(command);
            }
            Err(e) => error!(error = %e, "heartbeat command rejected"),
        }
    }

    fn heartbeat_result(&self, generation: u64, ok: bool) {
        let drained = {
            let mut core = self.core.lock();
            if core.generation != generation || core.status != ConnectionStatus::Connected {
                return;
            }
            if ok {
                core.heartbeat_misses = 0;
                return;
            }
            core.heartbeat_misses += 1;
            warn!(misses = core.heartbeat_misses, "heartbeat missed");
            if core.heartbeat_misses <= self.config.max_heartbeat_misses {
                return;
            }
            self.link_lost(&mut core, &SdkError::RequestTimeout(self.config.heartbeat_timeout_ms))
        };
        self.fail_all(
            drained,
            &SdkError::ConnectionLost("heartbeat missed".to_string()),
        );
    }

    fn link_down(&self, generation: u64, error: SdkError) {
        let drained = {
            let mut core = self.core.lock();
            if core.generation != generation || core.status != ConnectionStatus::Connected {
                return;
            }
            self.link_lost(&mut core, &error)
        };
        self.fail_all(drained, &SdkError::ConnectionLost(error.to_string()));
    }
}

async fn supervise(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<Event>) {
    let mut decoder = FrameDecoder::new(shared.config.max_frame_payload);
    let mut decoding = 0u64;

    while let Some(event) = events.recv().await {
        match event {
            Event::Inbound { generation, bytes } => {
                if shared.core.lock().generation != generation {
                    continue;
                }
                if decoding != generation {
                    decoder.clear();
                    decoding = generation;
                }
                decoder.push(&bytes);
                while let Some(frame) = decoder.next_frame() {
                    match frame {
                        Ok(frame) => shared.dispatch(frame),
                        Err(e) => warn!(error = %e, "inbound frame dropped"),
                    }
                }
            }
            Event::LinkDown { generation, error } => shared.link_down(generation, error),
            Event::ReconnectDue => shared.reconnect().await,
            Event::Heartbeat => shared.heartbeat(),
            Event::HeartbeatResult { generation, ok } => shared.heartbeat_result(generation, ok),
        }
    }
}

// ============================================================================
// Public handle
// ============================================================================

/// A supervised connection to one print head.
///
/// Must be created inside a tokio runtime. Every unit submitted with
/// [`send_command`](Self::send_command) or [`send_data`](Self::send_data)
/// reports exactly once through its context callback, including when the
/// connection is not up.
///
/// ```no_run
/// use printlink::connection::{ConnectionConfig, ManagedConnection};
/// use printlink::protocol::OpCode;
/// use printlink::transport::ConnectionParameters;
///
/// # async fn demo() -> printlink::Result<()> {
/// let conn = ManagedConnection::new(
///     ConnectionParameters::serial("/dev/ttyUSB0", 115_200),
///     ConnectionConfig::default(),
/// )?;
/// conn.connect().await?;
/// let battery = conn.request(OpCode::READ_BATTERY, Vec::new()).await?;
/// println!("battery: {:?}", battery.payload);
/// conn.disconnect();
/// # Ok(())
/// # }
/// ```
pub struct ManagedConnection {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

impl ManagedConnection {
    /// Connection using the platform's default transports.
    pub fn new(params: ConnectionParameters, config: ConnectionConfig) -> Result<Self> {
        Self::with_factory(params, config, StrategyFactory::default())
    }

    pub fn with_factory(
        params: ConnectionParameters,
        config: ConnectionConfig,
        factory: StrategyFactory,
    ) -> Result<Self> {
        params.validate()?;
        config.validate()?;
        if !factory.supports(params.kind()) {
            return Err(SdkError::UnsupportedTransport(params.kind()));
        }

        let timers = TimerService::new()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                status: ConnectionStatus::Disconnected,
                generation: 0,
                link: None,
                link_task: None,
                device: None,
                backoff: ReconnectBackoff::new(&config.reconnect),
                heartbeat: None,
                heartbeat_misses: 0,
            }),
            params,
            config,
            factory,
            timers,
            pending: PendingTable::default(),
            status_tx,
            notify_tx,
            events: events_tx,
        });
        let supervisor = tokio::spawn(supervise(shared.clone(), events_rx));

        Ok(Self { shared, supervisor })
    }

    /// Open the link. A failure leaves the connection `Failed`; call again
    /// to retry.
    pub async fn connect(&self) -> Result<DeviceInfo> {
        let previous = {
            let mut core = self.shared.core.lock();
            match core.status {
                ConnectionStatus::Connected => {
                    if let Some(device) = &core.device {
                        return Ok(device.clone());
                    }
                }
                ConnectionStatus::Connecting | ConnectionStatus::Reconnecting => {
                    return Err(SdkError::InvalidParameter(format!(
                        "connection is already {}",
                        core.status
                    )));
                }
                ConnectionStatus::Disconnected | ConnectionStatus::Failed => {}
            }
            core.backoff.reset();
            self.shared.set_status(&mut core, ConnectionStatus::Connecting);
            core.link_task.take()
        };
        if let Some(task) = previous {
            let _ = task.await;
        }

        let result = self.shared.open_link().await;

        let mut core = self.shared.core.lock();
        if core.status != ConnectionStatus::Connecting {
            if let Ok((mut strategy, _)) = result {
                strategy.close();
            }
            return Err(SdkError::ConnectionLost(
                "disconnected while connecting".to_string(),
            ));
        }
        match result {
            Ok((strategy, device)) => {
                self.shared.attach(&mut core, strategy, device.clone());
                Ok(device)
            }
            Err(e) => {
                warn!(error = %e, params = %self.shared.params, "connect failed");
                self.shared.set_status(&mut core, ConnectionStatus::Failed);
                Err(e)
            }
        }
    }

    /// Drop the link, cancel every timer and fail every pending context
    /// with `ConnectionLost`. The connection can be connected again.
    pub fn disconnect(&self) {
        self.shared.teardown("disconnected");
    }

    /// Submit a command. The result arrives through its context.
    pub fn send_command(&self, command: Command) -> CorrelationToken {
        self.shared.send_command(command)
    }

    /// Submit a multi-chunk transfer. The result arrives through its context.
    pub fn send_data(&self, sequence: DataSequence) -> CorrelationToken {
        self.shared.send_data(sequence)
    }

    /// Send one command and await its response.
    pub async fn request(&self, opcode: OpCode, params: Vec<u8>) -> Result<Frame> {
        let (context, rx) = CommandContext::channel();
        self.send_command(Command::new(opcode, params, context)?);
        command::recv(rx).await
    }

    /// Send `chunks` as one sequence and await its report. The send mode
    /// comes from the chunks.
    pub async fn transfer(&self, chunks: Vec<DataObj>) -> Result<TransferReport> {
        let send_type = chunks
            .first()
            .map(DataObj::send_type)
            .ok_or_else(|| SdkError::InvalidParameter("nothing to transfer".to_string()))?;
        let (context, rx) = DataObjContext::channel();
        self.send_data(DataSequence::new(send_type, chunks, context)?);
        command::recv(rx).await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.core.lock().status
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Unsolicited device notifications (opcode 0x1000 and above).
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Frame> {
        self.shared.notify_tx.subscribe()
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.shared.core.lock().device.clone()
    }

    pub fn params(&self) -> &ConnectionParameters {
        &self.shared.params
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Contexts waiting for a response, acknowledgment or transfer end.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_pending(&self, token: CorrelationToken) -> bool {
        self.shared.pending.contains(token)
    }

    /// Live timers (deadlines, heartbeat, reconnect).
    pub fn active_timers(&self) -> usize {
        self.shared.timers.active_count()
    }
}

impl Drop for ManagedConnection {
    fn drop(&mut self) {
        self.supervisor.abort();
        self.shared.teardown("connection dropped");
        self.shared.timers.shutdown();
    }
}

impl fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("params", &self.shared.params)
            .field("status", &self.status())
            .field("pending", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockDevice, TransportKind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quiet_config() -> ConnectionConfig {
        ConnectionConfig {
            request_timeout_ms: 200,
            chunk_timeout_ms: 200,
            heartbeat_interval_ms: None,
            poll_interval_ms: 2,
            reconnect: BackoffConfig {
                initial_delay_ms: 10,
                max_delay_ms: 40,
                max_attempts: 3,
            },
            ..ConnectionConfig::default()
        }
    }

    fn mock_connection(device: &MockDevice, config: ConnectionConfig) -> ManagedConnection {
        let device = device.clone();
        let factory = StrategyFactory::empty()
            .register(TransportKind::Serial, move |_| Ok(Box::new(device.strategy())));
        ManagedConnection::with_factory(ConnectionParameters::serial("mock", 9600), config, factory)
            .unwrap()
    }

    #[tokio::test]
    async fn test_unsupported_transport_rejected_up_front() {
        let err = ManagedConnection::with_factory(
            ConnectionParameters::usb(1, 2),
            quiet_config(),
            StrategyFactory::empty(),
        )
        .unwrap_err();
        assert_eq!(err, SdkError::UnsupportedTransport(TransportKind::Usb));
    }

    #[tokio::test]
    async fn test_send_before_connect_reports_through_callback() {
        let device = MockDevice::new();
        let conn = mock_connection(&device, quiet_config());

        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let ctx = CommandContext::new(move |r: Result<Frame>| {
            assert!(matches!(r, Err(SdkError::ConnectionLost(_))));
            seen.fetch_add(1, Ordering::SeqCst);
        });
        conn.send_command(Command::new(OpCode::HEARTBEAT, vec![], ctx).unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_response() {
        let device = MockDevice::new();
        device.respond_with_echo();
        let conn = mock_connection(&device, quiet_config());

        conn.connect().await.unwrap();
        assert_eq!(conn.status(), ConnectionStatus::Connected);

        let reply = conn.request(OpCode::READ_BATTERY, vec![1, 2]).await.unwrap();
        assert_eq!(reply.opcode, OpCode::READ_BATTERY);
        assert_eq!(reply.payload, vec![1, 2]);
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.active_timers(), 0);
    }

    #[tokio::test]
    async fn test_connect_twice_returns_same_device() {
        let device = MockDevice::new();
        let conn = mock_connection(&device, quiet_config());
        let first = conn.connect().await.unwrap();
        let second = conn.connect().await.unwrap();
        assert_eq!(first.address, second.address);
        assert_eq!(device.open_count(), 1);
    }

    #[tokio::test]
    async fn test_notifications_are_broadcast() {
        let device = MockDevice::new();
        let conn = mock_connection(&device, quiet_config());
        let mut notes = conn.subscribe_notifications();
        conn.connect().await.unwrap();

        device.inject(&Frame::new(OpCode::STATUS_BATTERY_LOW, vec![9]));
        let frame = tokio::time::timeout(Duration::from_secs(2), notes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.opcode, OpCode::STATUS_BATTERY_LOW);
        assert_eq!(frame.payload, vec![9]);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_and_clears_timers() {
        let device = MockDevice::new();
        device.silence();
        let conn = mock_connection(&device, ConnectionConfig {
            request_timeout_ms: 60_000,
            ..quiet_config()
        });
        conn.connect().await.unwrap();

        let (ctx, rx) = CommandContext::channel();
        let token = conn.send_command(Command::new(OpCode::READ_DEVICE_INFO, vec![], ctx).unwrap());
        assert!(conn.is_pending(token));
        assert_eq!(conn.active_timers(), 1);

        conn.disconnect();
        assert!(matches!(rx.await.unwrap(), Err(SdkError::ConnectionLost(_))));
        assert_eq!(conn.status(), ConnectionStatus::Disconnected);
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(conn.active_timers(), 0);
    }
}
