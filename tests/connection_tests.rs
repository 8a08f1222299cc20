//! # Connection Tests
//!
//! End-to-end behaviour of [`ManagedConnection`] against the in-memory
//! mock device: correlation, deadlines, send modes, teardown and reconnect.
//!
//! These run on tokio's real clock; the link loop lives on the blocking
//! pool, which a paused clock does not account for.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use printlink::command::{
    Command, CommandContext, DataObj, DataObjContext, DataSendType, DataSequence, TransferReport,
};
use printlink::connection::{BackoffConfig, ConnectionConfig, ConnectionStatus, ManagedConnection};
use printlink::protocol::{Frame, OpCode};
use printlink::transport::{ConnectionParameters, MockDevice, StrategyFactory, TransportKind};
use printlink::{Result, SdkError};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        request_timeout_ms: 500,
        chunk_timeout_ms: 500,
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
    ManagedConnection::with_factory(ConnectionParameters::serial("mock", 115_200), config, factory)
        .unwrap()
}

/// Poll `cond` until it holds or `limit` passes.
async fn wait_until(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

fn chunks(opcode: OpCode, send_type: DataSendType, count: u8) -> Vec<DataObj> {
    (0..count)
        .map(|i| DataObj::new(opcode, vec![i; 4], send_type).unwrap())
        .collect()
}

// ============================================================================
// CONNECT
// ============================================================================

#[tokio::test]
async fn test_missing_serial_port_fails_without_connecting() {
    let conn = ManagedConnection::new(
        ConnectionParameters::serial("COM-X", 9600),
        test_config(),
    )
    .unwrap();

    let mut status = conn.subscribe_status();
    let history = Arc::new(Mutex::new(Vec::new()));
    let recorder = history.clone();
    let watcher = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            recorder.lock().push(*status.borrow_and_update());
        }
    });

    let err = conn.connect().await.unwrap_err();
    assert!(matches!(err, SdkError::OpenFailed(_)), "got {:?}", err);
    assert_eq!(conn.status(), ConnectionStatus::Failed);
    assert!(conn.device_info().is_none());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!history.lock().contains(&ConnectionStatus::Connected));
    assert_eq!(history.lock().last(), Some(&ConnectionStatus::Failed));
    watcher.abort();
}

#[tokio::test]
async fn test_connect_after_failure_retries() {
    let device = MockDevice::new();
    device.fail_opens(1);
    let conn = mock_connection(&device, test_config());

    assert!(conn.connect().await.is_err());
    assert_eq!(conn.status(), ConnectionStatus::Failed);

    let info = conn.connect().await.unwrap();
    assert_eq!(info.kind, TransportKind::Serial);
    assert_eq!(conn.status(), ConnectionStatus::Connected);
    assert_eq!(device.open_count(), 2);
}

// ============================================================================
// COMMANDS
// ============================================================================

#[tokio::test]
async fn test_silent_device_times_out_request() {
    let device = MockDevice::new();
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let started = Instant::now();
    let context = CommandContext::new(move |result: Result<Frame>| {
        let _ = tx.send((result, started.elapsed()));
    })
    .with_timeout(Duration::from_secs(2));
    let token = conn.send_command(Command::new(OpCode::READ_DEVICE_INFO, vec![], context).unwrap());
    assert!(conn.is_pending(token));

    let (result, elapsed) = rx.await.unwrap();
    assert_eq!(result, Err(SdkError::RequestTimeout(2000)));
    assert!(elapsed >= Duration::from_secs(2), "fired after {:?}", elapsed);
    assert!(!conn.is_pending(token));
    assert_eq!(conn.pending_count(), 0);
    assert_eq!(device.frames().len(), 1);
}

#[tokio::test]
async fn test_unbounded_request_timeout_waits_for_teardown() {
    let device = MockDevice::new();
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();
    let context = CommandContext::new(move |result: Result<Frame>| seen.lock().push(result))
        .with_timeout(Duration::MAX);
    let token = conn.send_command(Command::new(OpCode::READ_BATTERY, vec![], context).unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(conn.is_pending(token));
    assert_eq!(conn.active_timers(), 1);
    assert!(calls.lock().is_empty());

    conn.disconnect();
    let calls = calls.lock();
    assert_eq!(calls.len(), 1);
    assert!(matches!(calls[0], Err(SdkError::ConnectionLost(_))));
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn test_concurrent_commands_complete_exactly_once() {
    let device = MockDevice::new();
    // Battery reads are answered, task queries never are.
    device.set_responder(|frame| {
        if frame.opcode == OpCode::READ_BATTERY {
            vec![frame.clone()]
        } else {
            Vec::new()
        }
    });
    let conn = Arc::new(mock_connection(
        &device,
        ConnectionConfig {
            request_timeout_ms: 150,
            ..test_config()
        },
    ));
    conn.connect().await.unwrap();

    let calls: Arc<Mutex<HashMap<(u8, u8), usize>>> = Arc::new(Mutex::new(HashMap::new()));
    let outcomes = Arc::new(Mutex::new((0usize, 0usize)));

    let mut submitters = Vec::new();
    for worker in 0..4u8 {
        let conn = conn.clone();
        let calls = calls.clone();
        let outcomes = outcomes.clone();
        submitters.push(tokio::spawn(async move {
            for i in 0..10u8 {
                let opcode = if (worker + i) % 2 == 0 {
                    OpCode::READ_BATTERY
                } else {
                    OpCode::TASK_QUERY
                };
                let calls = calls.clone();
                let outcomes = outcomes.clone();
                let context = CommandContext::new(move |result: Result<Frame>| {
                    *calls.lock().entry((worker, i)).or_default() += 1;
                    let mut outcomes = outcomes.lock();
                    match result {
                        Ok(_) => outcomes.0 += 1,
                        Err(SdkError::RequestTimeout(_)) => outcomes.1 += 1,
                        Err(_) => {}
                    }
                });
                conn.send_command(Command::new(opcode, vec![worker, i], context).unwrap());
            }
        }));
    }
    for submitter in submitters {
        submitter.await.unwrap();
    }

    assert!(wait_until(Duration::from_secs(3), || calls.lock().len() == 40).await);
    // Give late duplicates a chance to show up.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(calls.lock().values().all(|&n| n == 1));
    assert_eq!(*outcomes.lock(), (20, 20));
    assert_eq!(conn.pending_count(), 0);
    assert_eq!(conn.active_timers(), 0);
}

#[tokio::test]
async fn test_responses_match_fifo_per_opcode() {
    let device = MockDevice::new();
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    let (first, first_rx) = CommandContext::channel();
    let (second, second_rx) = CommandContext::channel();
    conn.send_command(Command::new(OpCode::READ_BATTERY, vec![], first).unwrap());
    conn.send_command(Command::new(OpCode::READ_BATTERY, vec![], second).unwrap());
    assert!(wait_until(Duration::from_secs(1), || device.frames().len() == 2).await);

    device.inject(&Frame::new(OpCode::READ_BATTERY, vec![80]));
    device.inject(&Frame::new(OpCode::READ_BATTERY, vec![79]));

    assert_eq!(first_rx.await.unwrap().unwrap().payload, vec![80]);
    assert_eq!(second_rx.await.unwrap().unwrap().payload, vec![79]);
}

#[tokio::test]
async fn test_garbage_and_unmatched_frames_are_dropped() {
    let device = MockDevice::new();
    device.respond_with_echo();
    device.set_read_chunk(3);
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    // Unknown opcode, then a response nobody asked for.
    device.inject_raw(&[0x0F, 0xFF, 0x00, 0x01, 0xAA]);
    device.inject(&Frame::new(OpCode::READ_FIRMWARE_VERSION, b"1.0".to_vec()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let reply = conn.request(OpCode::SET_SPEED, vec![2]).await.unwrap();
    assert_eq!(reply.payload, vec![2]);
    assert_eq!(conn.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn test_commands_reach_the_wire_in_submission_order() {
    let device = MockDevice::new();
    device.respond_with_echo();
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    let opcodes = [
        OpCode::SET_DENSITY,
        OpCode::SET_SPEED,
        OpCode::SET_DIRECTION,
        OpCode::PRINT_START,
    ];
    let mut receivers = Vec::new();
    for opcode in opcodes {
        let (context, rx) = CommandContext::channel();
        conn.send_command(Command::new(opcode, vec![], context).unwrap());
        receivers.push(rx);
    }
    for rx in receivers {
        rx.await.unwrap().unwrap();
    }

    let sent: Vec<OpCode> = device.frames().iter().map(|f| f.opcode).collect();
    assert_eq!(sent, opcodes.to_vec());
}

// ============================================================================
// DATA TRANSFERS
// ============================================================================

#[tokio::test]
async fn test_once_continuous_streams_without_acks() {
    let device = MockDevice::new();
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    let progress = Arc::new(Mutex::new(Vec::new()));
    let seen = progress.clone();
    let (context, rx) = DataObjContext::channel();
    let sequence = DataSequence::new(
        DataSendType::OnceContinuous,
        chunks(OpCode::IMAGE_ROW_DATA, DataSendType::OnceContinuous, 5),
        context,
    )
    .unwrap()
    .on_progress(move |done, total| seen.lock().push((done, total)));
    conn.send_data(sequence);

    let report = rx.await.unwrap().unwrap();
    assert_eq!(
        report,
        TransferReport {
            chunks_sent: 5,
            bytes_sent: 5 * 8,
        }
    );
    assert_eq!(device.frames().len(), 5);
    assert_eq!(progress.lock().last(), Some(&(5, 5)));
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn test_wait_next_holds_each_chunk_until_acknowledged() {
    let device = MockDevice::new();
    let conn = mock_connection(
        &device,
        ConnectionConfig {
            chunk_timeout_ms: 5_000,
            ..test_config()
        },
    );
    conn.connect().await.unwrap();

    let (context, rx) = DataObjContext::channel();
    conn.send_data(
        DataSequence::new(
            DataSendType::CompleteOnceWaitNext,
            chunks(OpCode::LOGO_DATA, DataSendType::CompleteOnceWaitNext, 3),
            context,
        )
        .unwrap(),
    );

    for sent in 1..=3 {
        assert!(wait_until(Duration::from_secs(1), || device.frames().len() == sent).await);
        // Nothing more goes out while the ack is withheld.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(device.frames().len(), sent);
        device.inject(&Frame::new(OpCode::LOGO_DATA, vec![]));
    }

    let report = rx.await.unwrap().unwrap();
    assert_eq!(report.chunks_sent, 3);
    let payloads: Vec<Vec<u8>> = device.frames().into_iter().map(|f| f.payload).collect();
    assert_eq!(payloads, vec![vec![0; 4], vec![1; 4], vec![2; 4]]);
}

#[tokio::test]
async fn test_wait_next_timeout_reports_confirmed_chunks() {
    let device = MockDevice::new();
    let acked = Arc::new(AtomicUsize::new(0));
    let counter = acked.clone();
    // Acknowledge only the first chunk.
    device.set_responder(move |frame| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            vec![Frame::new(frame.opcode, vec![])]
        } else {
            Vec::new()
        }
    });
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    let (context, rx) = DataObjContext::channel();
    conn.send_data(
        DataSequence::new(
            DataSendType::CompleteOnceWaitNext,
            chunks(OpCode::LOGO_DATA, DataSendType::CompleteOnceWaitNext, 4),
            context,
        )
        .unwrap()
        .with_chunk_timeout(Duration::from_millis(100)),
    );

    let err = rx.await.unwrap().unwrap_err();
    match err {
        SdkError::PartialTransfer {
            chunks_confirmed,
            chunks_total,
            ..
        } => {
            assert_eq!(chunks_confirmed, 1);
            assert_eq!(chunks_total, 4);
        }
        other => panic!("expected PartialTransfer, got {:?}", other),
    }
    // The third chunk never went out.
    assert_eq!(device.frames().len(), 2);
    assert_eq!(conn.pending_count(), 0);
}

#[tokio::test]
async fn test_transfer_deadline_cuts_chunk_wait_short() {
    let device = MockDevice::new();
    let acked = Arc::new(AtomicUsize::new(0));
    let counter = acked.clone();
    device.set_responder(move |frame| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            vec![Frame::new(frame.opcode, vec![])]
        } else {
            Vec::new()
        }
    });
    let conn = mock_connection(
        &device,
        ConnectionConfig {
            chunk_timeout_ms: 1_500,
            ..test_config()
        },
    );
    conn.connect().await.unwrap();

    let (context, rx) = DataObjContext::channel();
    let started = Instant::now();
    conn.send_data(
        DataSequence::new(
            DataSendType::CompleteOnceWaitNext,
            chunks(OpCode::LOGO_DATA, DataSendType::CompleteOnceWaitNext, 3),
            context.with_timeout(Duration::from_millis(200)),
        )
        .unwrap(),
    );

    let err = rx.await.unwrap().unwrap_err();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(1_000), "took {:?}", elapsed);
    match err {
        SdkError::PartialTransfer {
            chunks_confirmed,
            chunks_total,
            ..
        } => {
            assert_eq!(chunks_confirmed, 1);
            assert_eq!(chunks_total, 3);
        }
        other => panic!("expected PartialTransfer, got {:?}", other),
    }
    assert_eq!(device.frames().len(), 2);
    assert_eq!(conn.pending_count(), 0);
    assert!(wait_until(Duration::from_millis(500), || conn.active_timers() == 0).await);
}

#[tokio::test]
async fn test_transfer_deadline_cancelled_on_completion() {
    let device = MockDevice::new();
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    let (context, rx) = DataObjContext::channel();
    conn.send_data(
        DataSequence::new(
            DataSendType::OnceContinuous,
            chunks(OpCode::IMAGE_ROW_DATA, DataSendType::OnceContinuous, 3),
            context.with_timeout(Duration::from_secs(30)),
        )
        .unwrap(),
    );

    let report = rx.await.unwrap().unwrap();
    assert_eq!(report.chunks_sent, 3);
    assert_eq!(conn.pending_count(), 0);
    assert_eq!(conn.active_timers(), 0);
}

// ============================================================================
// TEARDOWN AND RECONNECT
// ============================================================================

#[tokio::test]
async fn test_disconnect_fails_pending_transfer() {
    let device = MockDevice::new();
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    let (context, rx) = DataObjContext::channel();
    conn.send_data(
        DataSequence::new(
            DataSendType::CompleteOnceWaitNext,
            chunks(OpCode::UPGRADE_DATA, DataSendType::CompleteOnceWaitNext, 3),
            context,
        )
        .unwrap(),
    );
    assert!(wait_until(Duration::from_secs(1), || device.frames().len() == 1).await);

    conn.disconnect();
    assert!(matches!(rx.await.unwrap(), Err(SdkError::ConnectionLost(_))));
    assert_eq!(conn.status(), ConnectionStatus::Disconnected);
    assert_eq!(conn.active_timers(), 0);
}

#[tokio::test]
async fn test_link_drop_fails_pending_then_reconnects() {
    let device = MockDevice::new();
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    let (context, rx) = CommandContext::channel();
    conn.send_command(
        Command::new(OpCode::TASK_QUERY, vec![], context.with_timeout(Duration::from_secs(30)))
            .unwrap(),
    );
    assert!(wait_until(Duration::from_secs(1), || device.frames().len() == 1).await);

    device.drop_link();
    assert!(matches!(rx.await.unwrap(), Err(SdkError::ConnectionLost(_))));

    assert!(
        wait_until(Duration::from_secs(2), || conn.status() == ConnectionStatus::Connected
            && device.open_count() == 2)
        .await
    );
    device.respond_with_echo();
    assert!(conn.request(OpCode::HEARTBEAT, vec![]).await.is_ok());
}

#[tokio::test]
async fn test_partial_write_counts_as_link_loss() {
    let device = MockDevice::new();
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    device.short_write_next(2);
    let result = conn.request(OpCode::SET_DENSITY, vec![5]).await;
    assert!(matches!(result, Err(SdkError::ConnectionLost(_))), "got {:?}", result);

    assert!(wait_until(Duration::from_secs(2), || conn.status() == ConnectionStatus::Connected).await);
    assert_eq!(device.open_count(), 2);
}

#[tokio::test]
async fn test_reconnect_storm_settles_at_failed() {
    let device = MockDevice::new();
    let conn = mock_connection(&device, test_config());
    conn.connect().await.unwrap();

    device.fail_opens(usize::MAX);
    device.drop_link();

    assert!(wait_until(Duration::from_secs(3), || conn.status() == ConnectionStatus::Failed).await);
    // One initial open plus every reconnect attempt.
    assert_eq!(device.open_count(), 1 + 3);
    assert_eq!(conn.active_timers(), 0);

    // Nothing keeps firing afterwards.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(device.open_count(), 4);
    assert_eq!(conn.status(), ConnectionStatus::Failed);
}

#[tokio::test]
async fn test_missed_heartbeats_trigger_reconnect() {
    let device = MockDevice::new();
    let conn = mock_connection(
        &device,
        ConnectionConfig {
            heartbeat_interval_ms: Some(30),
            heartbeat_timeout_ms: 30,
            max_heartbeat_misses: 1,
            ..test_config()
        },
    );
    conn.connect().await.unwrap();

    assert!(wait_until(Duration::from_secs(3), || device.open_count() >= 2).await);
    let heartbeats = device
        .frames()
        .iter()
        .filter(|f| f.opcode == OpCode::HEARTBEAT)
        .count();
    assert!(heartbeats >= 2);
}

#[tokio::test]
async fn test_answered_heartbeats_keep_link() {
    let device = MockDevice::new();
    device.respond_with_echo();
    let conn = mock_connection(
        &device,
        ConnectionConfig {
            heartbeat_interval_ms: Some(20),
            heartbeat_timeout_ms: 100,
            max_heartbeat_misses: 0,
            ..test_config()
        },
    );
    conn.connect().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(device.open_count(), 1);
    assert_eq!(conn.status(), ConnectionStatus::Connected);
    assert!(device.frames().len() >= 3);
}

#[tokio::test]
async fn test_notifications_never_complete_requests() {
    let device = MockDevice::new();
    let conn = mock_connection(&device, test_config());
    let mut notifications = conn.subscribe_notifications();
    conn.connect().await.unwrap();

    let (context, rx) = CommandContext::channel();
    conn.send_command(Command::new(OpCode::TASK_CREATE, vec![], context).unwrap());
    device.inject(&Frame::new(OpCode::STATUS_PRINT_COMPLETE, vec![1]));
    device.inject(&Frame::new(OpCode::TASK_CREATE, vec![7]));

    let note = notifications.recv().await.unwrap();
    assert_eq!(note.opcode, OpCode::STATUS_PRINT_COMPLETE);
    assert_eq!(rx.await.unwrap().unwrap().payload, vec![7]);
}
