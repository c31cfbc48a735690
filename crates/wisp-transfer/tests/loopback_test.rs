/// Integration tests: run a sender and a receiver session against each other
/// over the in-process rendezvous and verify what arrives.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use wisp_transfer::flow::FlowConfig;
use wisp_transfer::logging::{TransferEvent, TransferLog, TransferLogger};
use wisp_transfer::memory::TapRecord;
use wisp_transfer::{
    ConnectionEvent, ErrorKind, FileSource, Frame, MemoryFile, MemoryOptions, MemoryRendezvous, MemorySink, NullLogger, ReceiveHandle,
    ReceiveOptions, Rendezvous, RendezvousError, SendHandle, SendOptions, SessionEvent, SessionOutcome, TransferError,
    generate_code, start_receive, start_send,
};
use wisp_types::{ProtocolMessage, Side};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| ((i % 251) as u8).wrapping_add(seed)).collect()
}

fn quiet_send() -> SendOptions {
    SendOptions {
        logger: Arc::new(NullLogger),
        ..SendOptions::default()
    }
}

fn quiet_receive() -> ReceiveOptions {
    ReceiveOptions {
        logger: Arc::new(NullLogger),
        ..ReceiveOptions::default()
    }
}

/// Read sender events until the code is issued. Returns the code and the
/// events consumed on the way.
async fn wait_for_code(events: &mut UnboundedReceiver<SessionEvent>) -> (String, Vec<SessionEvent>) {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        if let SessionEvent::CodeIssued { code } = &event {
            let code = code.clone();
            seen.push(event);
            return (code, seen);
        }
        seen.push(event);
    }
    panic!("sender ended without issuing a code: {seen:?}");
}

/// Everything up to and including `Closed`.
async fn collect(events: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let closed = matches!(event, SessionEvent::Closed);
        seen.push(event);
        if closed {
            break;
        }
    }
    seen
}

async fn wait_for(events: &mut UnboundedReceiver<SessionEvent>, pred: impl Fn(&SessionEvent) -> bool) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let hit = pred(&event);
        seen.push(event);
        if hit {
            return seen;
        }
    }
    panic!("event stream ended before the expected event: {seen:?}");
}

fn count(events: &[SessionEvent], pred: impl Fn(&SessionEvent) -> bool) -> usize {
    events.iter().filter(|e| pred(e)).count()
}

fn tapped(tap: &mut UnboundedReceiver<TapRecord>) -> Vec<TapRecord> {
    let mut records = Vec::new();
    while let Ok(record) = tap.try_recv() {
        records.push(record);
    }
    records
}

fn control(record: &TapRecord) -> Option<ProtocolMessage> {
    match &record.frame {
        Frame::Text(text) => Some(ProtocolMessage::decode(text).unwrap()),
        Frame::Binary(_) => None,
    }
}

struct Session {
    sender: SendHandle,
    sender_events: UnboundedReceiver<SessionEvent>,
    receiver: ReceiveHandle,
    receiver_events: UnboundedReceiver<SessionEvent>,
}

async fn start_pair(
    hub: &MemoryRendezvous,
    files: Vec<Arc<dyn FileSource>>,
    send_options: SendOptions,
    receive_options: ReceiveOptions,
    sink: &MemorySink,
) -> Session {
    let (sender, mut sender_events) = start_send(files, Arc::new(hub.clone()), generate_code, send_options).unwrap();
    let (code, _) = wait_for_code(&mut sender_events).await;
    let (receiver, receiver_events) =
        start_receive(&code, Arc::new(hub.clone()), Box::new(sink.clone()), receive_options).unwrap();
    Session {
        sender,
        sender_events,
        receiver,
        receiver_events,
    }
}

#[tokio::test]
async fn single_ten_mib_file() {
    let _ = tracing_subscriber::fmt::try_init();
    let data = pattern(10 * 1024 * 1024, 0);
    let hub = MemoryRendezvous::new();
    let sink = MemorySink::new();
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("big.bin", data.clone()))];

    let mut s = start_pair(&hub, files, quiet_send(), quiet_receive(), &sink).await;
    let sender_events = collect(&mut s.sender_events).await;
    let receiver_events = collect(&mut s.receiver_events).await;

    let SessionOutcome::Completed(sent) = s.sender.join().await else {
        panic!("sender did not complete: {sender_events:?}");
    };
    let SessionOutcome::Completed(received) = s.receiver.join().await else {
        panic!("receiver did not complete: {receiver_events:?}");
    };
    assert_eq!(sent.bytes, 10_485_760);
    assert_eq!(received.bytes, 10_485_760);
    assert_eq!(sent.chunks, 160);
    assert_eq!(received.chunks, 160);
    assert!(sent.peak_in_flight <= 32);

    let files = sink.files();
    assert_eq!(files.len(), 1);
    assert!(files[0].finished);
    assert_eq!(files[0].descriptor.name, "big.bin");
    assert!(files[0].data[..] == data[..], "received bytes differ");

    for events in [&sender_events, &receiver_events] {
        assert_eq!(count(events, |e| matches!(e, SessionEvent::Completed(_))), 1);
        assert_eq!(count(events, |e| matches!(e, SessionEvent::Failed(_))), 0);
        assert!(matches!(events.last(), Some(SessionEvent::Closed)));
    }
    let last_progress = receiver_events
        .iter()
        .rev()
        .find_map(|e| match e {
            SessionEvent::Progress(p) => Some(*p),
            _ => None,
        })
        .unwrap();
    assert_eq!(last_progress.processed_bytes, 10_485_760);
    assert_eq!(last_progress.percent, 100.0);
}

#[tokio::test]
async fn three_files_are_bracketed_by_file_end_acks() {
    let hub = MemoryRendezvous::new();
    let mut tap = hub.tap();
    let sink = MemorySink::new();
    let contents = [pattern(1000, 1), pattern(2000, 2), pattern(3000, 3)];
    let files: Vec<Arc<dyn FileSource>> = contents
        .iter()
        .enumerate()
        .map(|(i, data)| Arc::new(MemoryFile::new(format!("part-{i}.bin"), data.clone())) as Arc<dyn FileSource>)
        .collect();

    let mut s = start_pair(&hub, files, quiet_send(), quiet_receive(), &sink).await;
    let receiver_events = collect(&mut s.receiver_events).await;
    collect(&mut s.sender_events).await;

    let SessionOutcome::Completed(sent) = s.sender.join().await else {
        panic!("sender did not complete");
    };
    assert!(s.receiver.join().await.is_success());
    assert_eq!(sent.files, 3);
    assert_eq!(sent.bytes, 6000);

    let offered = receiver_events
        .iter()
        .find_map(|e| match e {
            SessionEvent::FileOffered { manifest, total_size, .. } => Some((manifest.len(), *total_size)),
            _ => None,
        })
        .unwrap();
    assert_eq!(offered, (3, 6000));

    let acks: Vec<ProtocolMessage> = tapped(&mut tap)
        .iter()
        .filter(|r| r.from == Side::Receiver)
        .filter_map(control)
        .filter(|m| matches!(m, ProtocolMessage::FileEndAck { .. } | ProtocolMessage::EndAck { .. }))
        .collect();
    assert!(acks.len() >= 4, "{acks:?}");
    for (i, size) in [1000u64, 2000, 3000].into_iter().enumerate() {
        assert_eq!(
            acks[i],
            ProtocolMessage::FileEndAck {
                file_index: i as u32,
                received: size,
                size,
            }
        );
    }
    for ack in &acks[3..] {
        assert_eq!(
            *ack,
            ProtocolMessage::EndAck {
                received: 6000,
                total: 6000
            }
        );
    }

    let received = sink.files();
    assert_eq!(received.len(), 3);
    for (file, data) in received.iter().zip(&contents) {
        assert!(file.finished);
        assert_eq!(&file.data[..], &data[..]);
    }
}

/// Keeps every structured log event a session emits.
#[derive(Default)]
struct RecordingLogger {
    events: Mutex<Vec<TransferEvent>>,
}

impl TransferLogger for RecordingLogger {
    fn log(&self, entry: TransferLog) {
        self.events.lock().unwrap().push(entry.event);
    }
}

#[tokio::test]
async fn polled_backpressure_and_heartbeats_during_transfer() {
    let hub = MemoryRendezvous::with_options(MemoryOptions {
        latency: Duration::from_millis(2),
        drain_notification: false,
    });
    let mut tap = hub.tap();
    let sink = MemorySink::new();
    let data = pattern(128 * 1024, 5);
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("slow.bin", data.clone()))];
    let logger = Arc::new(RecordingLogger::default());
    let options = SendOptions {
        chunk_size: 1024,
        flow: FlowConfig {
            high_water: 4096,
            low_water: 1024,
            ..FlowConfig::default()
        },
        heartbeat_interval: Duration::from_millis(20),
        logger: logger.clone(),
        ..SendOptions::default()
    };

    let mut s = start_pair(&hub, files, options, quiet_receive(), &sink).await;
    collect(&mut s.sender_events).await;
    collect(&mut s.receiver_events).await;

    let SessionOutcome::Completed(summary) = s.sender.join().await else {
        panic!("sender did not complete");
    };
    assert!(s.receiver.join().await.is_success());
    assert_eq!(summary.bytes, 128 * 1024);
    assert_eq!(&sink.files()[0].data[..], &data[..]);

    let stalls: Vec<usize> = logger
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            TransferEvent::BufferStall { buffered } => Some(*buffered),
            _ => None,
        })
        .collect();
    assert!(!stalls.is_empty(), "sender never paused for the transport buffer");
    assert!(stalls.iter().all(|&b| b > 4096), "{stalls:?}");

    let records = tapped(&mut tap);
    let pings: Vec<i64> = records
        .iter()
        .filter(|r| r.from == Side::Sender)
        .filter_map(control)
        .filter_map(|m| match m {
            ProtocolMessage::Ping { timestamp } => Some(timestamp),
            _ => None,
        })
        .collect();
    let pongs: Vec<i64> = records
        .iter()
        .filter(|r| r.from == Side::Receiver)
        .filter_map(control)
        .filter_map(|m| match m {
            ProtocolMessage::Pong { timestamp } => Some(timestamp),
            _ => None,
        })
        .collect();
    assert!(!pings.is_empty(), "no heartbeat during the transfer");
    assert!(!pongs.is_empty(), "receiver never answered a ping");
    assert!(pongs.iter().all(|t| pings.contains(t)), "pong echoes an unknown timestamp");
}

#[tokio::test]
async fn window_bounds_unacknowledged_chunks() {
    let hub = MemoryRendezvous::with_options(MemoryOptions {
        latency: Duration::from_millis(5),
        ..MemoryOptions::default()
    });
    let mut tap = hub.tap();
    let sink = MemorySink::new().with_write_delay(Duration::from_millis(1));
    let data = pattern(64 * 1024, 9);
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("w.bin", data.clone()))];
    let options = SendOptions {
        chunk_size: 1024,
        flow: FlowConfig {
            window: 4,
            ..FlowConfig::default()
        },
        ..quiet_send()
    };

    let mut s = start_pair(&hub, files, options, quiet_receive(), &sink).await;
    collect(&mut s.sender_events).await;
    collect(&mut s.receiver_events).await;

    let SessionOutcome::Completed(summary) = s.sender.join().await else {
        panic!("sender did not complete");
    };
    assert!(s.receiver.join().await.is_success());
    assert_eq!(summary.chunks, 64);
    assert!(summary.peak_in_flight <= 4, "peak {}", summary.peak_in_flight);
    assert!(summary.peak_in_flight >= 1);

    // In delivery order, headers delivered minus acks delivered never exceeds the window.
    let mut outstanding: i64 = 0;
    let mut worst = 0;
    for record in tapped(&mut tap) {
        match (record.from, control(&record)) {
            (Side::Sender, Some(ProtocolMessage::Chunk { .. })) => outstanding += 1,
            (Side::Receiver, Some(ProtocolMessage::ChunkAck { .. })) => outstanding -= 1,
            _ => {}
        }
        worst = worst.max(outstanding);
    }
    assert!(worst <= 4, "{worst} chunks outstanding");
    assert_eq!(&sink.files()[0].data[..], &data[..]);
}

#[tokio::test]
async fn sender_stop_mid_transfer_cancels_both_sides() {
    let hub = MemoryRendezvous::new();
    let mut tap = hub.tap();
    let sink = MemorySink::new().with_write_delay(Duration::from_millis(3));
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("slow.bin", pattern(256 * 1024, 4)))];
    let options = SendOptions {
        chunk_size: 1024,
        flow: FlowConfig {
            window: 4,
            ..FlowConfig::default()
        },
        ..quiet_send()
    };

    let mut s = start_pair(&hub, files, options, quiet_receive(), &sink).await;
    wait_for(&mut s.sender_events, |e| matches!(e, SessionEvent::Progress(_))).await;
    s.sender.stop();
    s.sender.stop();

    let sender_events = collect(&mut s.sender_events).await;
    let receiver_events = collect(&mut s.receiver_events).await;
    assert!(matches!(s.sender.join().await, SessionOutcome::Cancelled(Side::Sender)));
    assert!(matches!(s.receiver.join().await, SessionOutcome::Cancelled(Side::Sender)));

    assert_eq!(count(&sender_events, |e| matches!(e, SessionEvent::Cancelled { by: Side::Sender })), 1);
    assert_eq!(count(&receiver_events, |e| matches!(e, SessionEvent::Cancelled { by: Side::Sender })), 1);
    for events in [&sender_events, &receiver_events] {
        assert_eq!(count(events, |e| matches!(e, SessionEvent::Failed(_))), 0);
        assert_eq!(count(events, |e| matches!(e, SessionEvent::Completed(_))), 0);
    }

    // Nothing chunk-related follows the sender's `cancelled`.
    let from_sender: Vec<TapRecord> = tapped(&mut tap).into_iter().filter(|r| r.from == Side::Sender).collect();
    let cancelled_at = from_sender
        .iter()
        .position(|r| matches!(control(r), Some(ProtocolMessage::Cancelled { .. })))
        .expect("sender sent cancelled");
    for record in &from_sender[cancelled_at + 1..] {
        assert!(
            !matches!(record.frame, Frame::Binary(_)) && !matches!(control(record), Some(ProtocolMessage::Chunk { .. })),
            "chunk traffic after cancellation"
        );
    }
    assert!(!sink.files()[0].finished);
}

#[tokio::test]
async fn receiver_stop_mid_transfer_is_attributed_to_receiver() {
    let hub = MemoryRendezvous::new();
    let sink = MemorySink::new().with_write_delay(Duration::from_millis(3));
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("slow.bin", pattern(256 * 1024, 5)))];
    let options = SendOptions {
        chunk_size: 1024,
        ..quiet_send()
    };

    let mut s = start_pair(&hub, files, options, quiet_receive(), &sink).await;
    wait_for(&mut s.receiver_events, |e| matches!(e, SessionEvent::Progress(_))).await;
    s.receiver.stop();

    collect(&mut s.sender_events).await;
    collect(&mut s.receiver_events).await;
    assert!(matches!(s.receiver.join().await, SessionOutcome::Cancelled(Side::Receiver)));
    assert!(matches!(s.sender.join().await, SessionOutcome::Cancelled(Side::Receiver)));
}

#[tokio::test]
async fn confirmation_gates_the_transfer() {
    let hub = MemoryRendezvous::new();
    let sink = MemorySink::new();
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::with_mime("note.txt", "text/plain", "hello"))];
    let receive_options = ReceiveOptions {
        require_confirmation: true,
        ..quiet_receive()
    };

    let mut s = start_pair(&hub, files, quiet_send(), receive_options, &sink).await;
    let seen = wait_for(&mut s.receiver_events, |e| matches!(e, SessionEvent::FileOffered { .. })).await;
    let Some(SessionEvent::FileOffered {
        file,
        awaiting_confirmation,
        ..
    }) = seen.last()
    else {
        unreachable!()
    };
    assert!(*awaiting_confirmation);
    assert_eq!(file.name, "note.txt");
    assert_eq!(file.mime, "text/plain");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sink.files().is_empty(), "data moved before accept");
    assert!(!s.sender.is_finished());

    s.receiver.accept();
    collect(&mut s.receiver_events).await;
    collect(&mut s.sender_events).await;
    assert!(s.sender.join().await.is_success());
    assert!(s.receiver.join().await.is_success());
    assert_eq!(&sink.files()[0].data[..], b"hello");
}

#[tokio::test]
async fn sender_keeps_listening_after_receiver_leaves_early() {
    let hub = MemoryRendezvous::new();
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("a.bin", pattern(4096, 6)))];
    let (sender, mut sender_events) = start_send(files, Arc::new(hub.clone()), generate_code, quiet_send()).unwrap();
    let (code, _) = wait_for_code(&mut sender_events).await;

    // First receiver walks away while deciding.
    let first_sink = MemorySink::new();
    let (first, mut first_events) = start_receive(
        &code,
        Arc::new(hub.clone()),
        Box::new(first_sink.clone()),
        ReceiveOptions {
            require_confirmation: true,
            ..quiet_receive()
        },
    )
    .unwrap();
    wait_for(&mut first_events, |e| matches!(e, SessionEvent::FileOffered { .. })).await;
    first.stop();
    assert!(matches!(first.join().await, SessionOutcome::Cancelled(Side::Receiver)));
    wait_for(&mut sender_events, |e| matches!(e, SessionEvent::Disconnected)).await;

    // Second receiver completes on the same code.
    let second_sink = MemorySink::new();
    let (second, _second_events) =
        start_receive(&code, Arc::new(hub.clone()), Box::new(second_sink.clone()), quiet_receive()).unwrap();
    assert!(second.join().await.is_success());
    assert!(sender.join().await.is_success());
    assert!(first_sink.files().is_empty());
    assert_eq!(second_sink.files()[0].data.len(), 4096);
}

#[tokio::test]
async fn busy_session_rejects_another_receiver() {
    let hub = MemoryRendezvous::new();
    let sink = MemorySink::new().with_write_delay(Duration::from_millis(2));
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("busy.bin", pattern(128 * 1024, 7)))];
    let options = SendOptions {
        chunk_size: 1024,
        ..quiet_send()
    };
    let (sender, mut sender_events) = start_send(files, Arc::new(hub.clone()), generate_code, options).unwrap();
    let (code, _) = wait_for_code(&mut sender_events).await;
    let (receiver, mut receiver_events) =
        start_receive(&code, Arc::new(hub.clone()), Box::new(sink.clone()), quiet_receive()).unwrap();
    wait_for(&mut receiver_events, |e| matches!(e, SessionEvent::Progress(_))).await;

    let mut intruder = hub.connect(&code).await.unwrap();
    let first = intruder.events.recv().await.unwrap();
    let ConnectionEvent::Frame(Frame::Text(text)) = first else {
        panic!("expected an error frame, got {first:?}");
    };
    assert!(matches!(ProtocolMessage::decode(&text).unwrap(), ProtocolMessage::Error { .. }));
    assert_eq!(intruder.events.recv().await, Some(ConnectionEvent::Closed));

    assert!(sender.join().await.is_success());
    assert!(receiver.join().await.is_success());
}

#[tokio::test]
async fn stop_while_listening_closes_quietly() {
    let hub = MemoryRendezvous::new();
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("a.bin", vec![1u8; 10]))];
    let (sender, mut events) = start_send(files, Arc::new(hub.clone()), generate_code, quiet_send()).unwrap();
    let (code, _) = wait_for_code(&mut events).await;
    assert!(hub.is_reserved(&code));

    sender.stop();
    sender.stop();
    let rest = collect(&mut events).await;
    assert!(matches!(sender.join().await, SessionOutcome::Closed));
    assert_eq!(count(&rest, |e| matches!(e, SessionEvent::Cancelled { .. })), 0);
    assert_eq!(count(&rest, |e| matches!(e, SessionEvent::Closed)), 1);
    assert!(!hub.is_reserved(&code));
}

#[tokio::test]
async fn stop_after_completion_is_a_no_op() {
    let hub = MemoryRendezvous::new();
    let sink = MemorySink::new();
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("a.bin", pattern(3000, 8)))];
    let mut s = start_pair(&hub, files, quiet_send(), quiet_receive(), &sink).await;
    collect(&mut s.sender_events).await;
    collect(&mut s.receiver_events).await;

    s.sender.stop();
    s.sender.stop();
    s.receiver.stop();
    assert!(s.sender.join().await.is_success());
    assert!(s.receiver.join().await.is_success());
    assert!(s.sender_events.try_recv().is_err());
    assert!(s.receiver_events.try_recv().is_err());
}

#[tokio::test]
async fn code_collision_retries_with_fresh_code() {
    let hub = MemoryRendezvous::new();
    let _held = hub.reserve("AAAA-0000").await.unwrap();
    let mut candidates = vec!["BBBB-1111".to_string(), "AAAA-0000".to_string()];
    let generator = move || candidates.pop().unwrap_or_else(generate_code);

    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("a.bin", vec![0u8; 1]))];
    let (sender, mut events) = start_send(files, Arc::new(hub.clone()), generator, quiet_send()).unwrap();
    let (code, seen) = wait_for_code(&mut events).await;
    assert_eq!(code, "BBBB-1111");
    let attempts: Vec<&str> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::CodeAttempt { code } => Some(code.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, ["AAAA-0000", "BBBB-1111"]);
    sender.stop();
    assert!(matches!(sender.join().await, SessionOutcome::Closed));
}

#[tokio::test]
async fn exhausted_code_attempts_fail() {
    let hub = MemoryRendezvous::new();
    let _held = hub.reserve("AAAA-0000").await.unwrap();
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("a.bin", vec![0u8; 1]))];
    let options = SendOptions {
        max_code_attempts: 2,
        ..quiet_send()
    };
    let (sender, _events) = start_send(files, Arc::new(hub.clone()), || "AAAA-0000".to_string(), options).unwrap();
    match sender.join().await {
        SessionOutcome::Failed(err) => {
            assert!(matches!(err, TransferError::Rendezvous(RendezvousError::CodeTaken(_))));
            assert_eq!(err.kind(), ErrorKind::Network);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn invalid_input_is_rejected_before_network_activity() {
    let hub = MemoryRendezvous::new();
    let err = start_receive("QXBT4821", Arc::new(hub.clone()), Box::new(MemorySink::new()), quiet_receive())
        .err()
        .unwrap();
    assert!(matches!(err, TransferError::InvalidCode(_)));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(!err.is_alarming());

    let err = start_send(Vec::new(), Arc::new(hub.clone()), generate_code, quiet_send())
        .err()
        .unwrap();
    assert!(matches!(err, TransferError::NoFiles));

    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("a.bin", vec![0u8; 1]))];
    let options = SendOptions {
        code: Some("nope".into()),
        ..quiet_send()
    };
    let err = start_send(files, Arc::new(hub.clone()), generate_code, options).err().unwrap();
    assert!(matches!(err, TransferError::InvalidCode(_)));
}

#[tokio::test]
async fn empty_file_completes() {
    let hub = MemoryRendezvous::new();
    let sink = MemorySink::new();
    let files: Vec<Arc<dyn FileSource>> = vec![Arc::new(MemoryFile::new("empty", Vec::<u8>::new()))];
    let mut s = start_pair(&hub, files, quiet_send(), quiet_receive(), &sink).await;
    collect(&mut s.sender_events).await;
    assert!(s.sender.join().await.is_success());
    assert!(s.receiver.join().await.is_success());
    let files = sink.files();
    assert!(files[0].finished);
    assert!(files[0].data.is_empty());
}
