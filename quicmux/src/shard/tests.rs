use super::event_loop::{classify, Route};
use super::*;
use crate::clock::{ManualClock, Timestamp};
use crate::dispatcher::Dispatcher;
use crate::engine::{
    encode_frame, EchoSessionFactory, Engine, InboundPacket, LoopbackConfig, LoopbackEngine,
    HANDSHAKE_STREAM, LOOPBACK_PROOF_VERSION, LOOPBACK_SERVER_CONFIG,
};
use crate::proof::ProofService;
use crate::routing::ParsedHeader;
use crate::scheduler::{AlarmId, AlarmState, AlarmToken};
use bytes::Bytes;
use parking_lot::Mutex;
use quicmux_x::{Command, ConnectionId, SessionId, StreamId};
use std::collections::HashMap;

type Sent = Arc<Mutex<Vec<(SocketAddr, Bytes)>>>;

#[derive(Clone, Default)]
struct RecordingWriter {
    sent: Sent,
    blocked: Arc<Mutex<bool>>,
}

impl PacketWriter for RecordingWriter {
    fn write_packet(&mut self, peer: SocketAddr, data: Bytes) -> WriteStatus {
        if *self.blocked.lock() {
            return WriteStatus::Blocked;
        }
        self.sent.lock().push((peer, data));
        WriteStatus::Queued
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Alarm(u64),
    Packet(Option<SessionId>, SocketAddr),
    Write(SessionId, StreamId, Vec<u8>, bool),
    SessionClose(SessionId),
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Set(AlarmId, i64),
    Destroy(AlarmId),
    RewindClock(i64),
}

/// Records every callback and runs scripted actions when an alarm fires.
#[derive(Default)]
struct ScriptedEngine {
    seen: Vec<Seen>,
    on_fire: HashMap<u64, Vec<Action>>,
    clock: Option<ManualClock>,
}

impl Engine for ScriptedEngine {
    fn process_packet(&mut self, _ctx: &mut ShardContext, packet: InboundPacket) {
        self.seen.push(Seen::Packet(packet.session, packet.peer));
    }

    fn on_alarm(&mut self, ctx: &mut ShardContext, _alarm: AlarmId, token: AlarmToken) {
        self.seen.push(Seen::Alarm(token.0));
        for action in self.on_fire.remove(&token.0).unwrap_or_default() {
            match action {
                Action::Set(alarm, at) => ctx.set_alarm(alarm, Timestamp::from_micros(at)),
                Action::Destroy(alarm) => ctx.destroy_alarm(alarm),
                Action::RewindClock(at) => {
                    if let Some(clock) = &self.clock {
                        clock.set(Timestamp::from_micros(at));
                    }
                }
            }
        }
    }

    fn on_stream_write(
        &mut self,
        _ctx: &mut ShardContext,
        session: SessionId,
        stream: StreamId,
        data: Bytes,
        fin: bool,
    ) {
        self.seen.push(Seen::Write(session, stream, data.to_vec(), fin));
    }

    fn on_session_close(&mut self, _ctx: &mut ShardContext, session: SessionId) {
        self.seen.push(Seen::SessionClose(session));
    }
}

impl ScriptedEngine {
    fn fired(&self) -> Vec<u64> {
        self.seen
            .iter()
            .filter_map(|s| match s {
                Seen::Alarm(t) => Some(*t),
                _ => None,
            })
            .collect()
    }
}

struct Harness {
    ctx: ShardContext,
    clock: ManualClock,
    writer: RecordingWriter,
    commands: mpsc::Receiver<Command>,
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn harness_with(scheduler: SchedulerConfig) -> Harness {
    let clock = ManualClock::new(Timestamp::ZERO);
    let writer = RecordingWriter::default();
    let (command_tx, commands) = mpsc::channel(64);
    let (proof_tx, _proof_rx) = mpsc::channel(4);
    let dispatcher = Dispatcher::new(0, Arc::new(EchoSessionFactory), command_tx);
    let proofs = ProofService::new(SignerRegistry::new(), None, proof_tx, None);
    let ctx = ShardContext::new(
        0,
        addr(4433),
        Box::new(clock.clone()),
        &scheduler,
        dispatcher,
        Box::new(writer.clone()),
        proofs,
    );
    Harness {
        ctx,
        clock,
        writer,
        commands,
    }
}

fn harness() -> Harness {
    harness_with(SchedulerConfig::default())
}

fn at(micros: i64) -> Timestamp {
    Timestamp::from_micros(micros)
}

#[test]
fn test_due_alarms_fire_in_deadline_order() {
    let mut h = harness();
    let mut engine = ScriptedEngine::default();

    let a = h.ctx.create_alarm(AlarmToken(1));
    let b = h.ctx.create_alarm(AlarmToken(2));
    let c = h.ctx.create_alarm(AlarmToken(3));
    h.ctx.set_alarm(a, at(300));
    h.ctx.set_alarm(b, at(100));
    h.ctx.set_alarm(c, at(200));
    assert_eq!(h.ctx.timer().deadline, at(100));

    h.clock.set(at(250));
    assert_eq!(h.ctx.do_tasks(&mut engine), 2);
    assert_eq!(engine.fired(), vec![2, 3]);
    assert_eq!(h.ctx.timer().deadline, at(300));
    assert_eq!(h.ctx.alarm_state(b), AlarmState::Idle);
    assert!(h.ctx.is_alarm_set(a));

    h.clock.set(at(300));
    h.ctx.do_tasks(&mut engine);
    assert_eq!(engine.fired(), vec![2, 3, 1]);
}

#[test]
fn test_canceled_alarm_does_not_fire() {
    let mut h = harness();
    let mut engine = ScriptedEngine::default();

    let a = h.ctx.create_alarm(AlarmToken(1));
    h.ctx.set_alarm(a, at(100));
    h.ctx.cancel_alarm(a);
    h.ctx.cancel_alarm(a);
    assert!(!h.ctx.is_alarm_set(a));

    h.clock.set(at(1000));
    assert_eq!(h.ctx.do_tasks(&mut engine), 0);
    assert!(engine.fired().is_empty());
}

#[test]
fn test_callback_rearming_a_popped_alarm_defers_it() {
    let mut h = harness();
    let mut engine = ScriptedEngine::default();

    let a = h.ctx.create_alarm(AlarmToken(1));
    let b = h.ctx.create_alarm(AlarmToken(2));
    h.ctx.set_alarm(a, at(100));
    h.ctx.set_alarm(b, at(100));
    // `a` fires first and pushes `b` out, after `b` was already popped.
    engine.on_fire.insert(1, vec![Action::Set(b, 500), Action::Set(a, 200)]);

    h.clock.set(at(100));
    assert_eq!(h.ctx.do_tasks(&mut engine), 1);
    assert_eq!(engine.fired(), vec![1]);
    assert_eq!(h.ctx.timer().deadline, at(200));

    h.clock.set(at(200));
    h.ctx.do_tasks(&mut engine);
    assert_eq!(engine.fired(), vec![1, 1]);

    h.clock.set(at(500));
    h.ctx.do_tasks(&mut engine);
    assert_eq!(engine.fired(), vec![1, 1, 2]);
}

#[test]
fn test_early_wakeup_rearms_then_fires() {
    let mut h = harness();
    let clock = h.clock.clone();
    let mut engine = ScriptedEngine {
        clock: Some(clock),
        ..Default::default()
    };

    let a = h.ctx.create_alarm(AlarmToken(1));
    let b = h.ctx.create_alarm(AlarmToken(2));
    h.ctx.set_alarm(a, at(100));
    h.ctx.set_alarm(b, at(100));
    engine.on_fire.insert(1, vec![Action::RewindClock(50)]);

    h.clock.set(at(100));
    assert_eq!(h.ctx.do_tasks(&mut engine), 1);
    assert!(h.ctx.is_alarm_set(b));
    assert_eq!(h.ctx.task_runner().scheduled_deadline(b), Some(at(100)));

    h.clock.set(at(100));
    h.ctx.do_tasks(&mut engine);
    assert_eq!(engine.fired(), vec![1, 2]);
}

#[test]
fn test_early_wakeup_without_rearm_budget_fires_anyway() {
    let mut h = harness_with(SchedulerConfig {
        max_premature_rearms: 0,
        ..Default::default()
    });
    let mut engine = ScriptedEngine {
        clock: Some(h.clock.clone()),
        ..Default::default()
    };

    let a = h.ctx.create_alarm(AlarmToken(1));
    let b = h.ctx.create_alarm(AlarmToken(2));
    h.ctx.set_alarm(a, at(100));
    h.ctx.set_alarm(b, at(100));
    engine.on_fire.insert(1, vec![Action::RewindClock(50)]);

    h.clock.set(at(100));
    assert_eq!(h.ctx.do_tasks(&mut engine), 2);
    assert_eq!(engine.fired(), vec![1, 2]);
}

#[test]
fn test_coalescing_window_fires_near_alarms_together() {
    let mut h = harness_with(SchedulerConfig {
        coalesce_window_us: 50,
        ..Default::default()
    });
    let mut engine = ScriptedEngine::default();

    let a = h.ctx.create_alarm(AlarmToken(1));
    let b = h.ctx.create_alarm(AlarmToken(2));
    h.ctx.set_alarm(a, at(100));
    h.ctx.set_alarm(b, at(140));

    h.clock.set(at(100));
    assert_eq!(h.ctx.do_tasks(&mut engine), 2);
}

#[test]
fn test_destroyed_alarm_ignores_later_calls() {
    let mut h = harness();
    let mut engine = ScriptedEngine::default();

    let a = h.ctx.create_alarm(AlarmToken(1));
    h.ctx.set_alarm(a, at(100));
    h.ctx.destroy_alarm(a);
    assert_eq!(h.ctx.alarm_state(a), AlarmState::Destroyed);
    assert_eq!(h.ctx.alarm_count(), 0);
    assert_eq!(h.ctx.task_runner().registered_len(), 0);

    h.ctx.set_alarm(a, at(200));
    h.ctx.cancel_alarm(a);
    h.ctx.destroy_alarm(a);

    h.clock.set(at(1000));
    assert_eq!(h.ctx.do_tasks(&mut engine), 0);
}

#[test]
fn test_alarm_destroyed_by_earlier_callback_is_skipped() {
    let mut h = harness();
    let mut engine = ScriptedEngine::default();

    let a = h.ctx.create_alarm(AlarmToken(1));
    let b = h.ctx.create_alarm(AlarmToken(2));
    h.ctx.set_alarm(a, at(10));
    h.ctx.set_alarm(b, at(20));
    engine.on_fire.insert(1, vec![Action::Destroy(b), Action::Destroy(a)]);

    h.clock.set(at(30));
    assert_eq!(h.ctx.do_tasks(&mut engine), 1);
    assert_eq!(engine.fired(), vec![1]);
    assert_eq!(h.ctx.task_runner().scheduled_len(), 0);
}

#[test]
#[should_panic(expected = "never created")]
fn test_set_on_unknown_alarm_panics() {
    let mut h = harness();
    h.ctx.set_alarm(AlarmId::from_raw(42), at(1));
}

#[test]
fn test_send_to_session_tracks_stats() {
    let mut h = harness();
    let session = h
        .ctx
        .create_session(ConnectionId(7), addr(4433), addr(9000))
        .unwrap();

    let status = h
        .ctx
        .send_to_session(session, Bytes::from_static(b"hello"))
        .unwrap();
    assert_eq!(status, WriteStatus::Queued);
    assert_eq!(h.writer.sent.lock()[0].0, addr(9000));

    *h.writer.blocked.lock() = true;
    let status = h
        .ctx
        .send_to_session(session, Bytes::from_static(b"again"))
        .unwrap();
    assert_eq!(status, WriteStatus::Blocked);

    let stats = h.ctx.dispatcher().session(session).unwrap().stats();
    assert_eq!(stats.packets_out, 1);
    assert_eq!(stats.bytes_out, 5);
    assert_eq!(stats.write_errors, 1);

    assert!(h
        .ctx
        .send_to_session(SessionId(999), Bytes::from_static(b"x"))
        .is_err());
}

#[test]
fn test_commands_reach_engine() {
    let mut h = harness();
    let mut engine = ScriptedEngine::default();

    h.ctx.handle_command(
        &mut engine,
        Command::WriteStreamData {
            session: SessionId(1),
            stream_id: StreamId(3),
            data: Bytes::from_static(b"abc"),
            fin: true,
        },
    );
    h.ctx.handle_command(&mut engine, Command::CloseSession { session: SessionId(1) });

    assert_eq!(
        engine.seen,
        vec![
            Seen::Write(SessionId(1), StreamId(3), b"abc".to_vec(), true),
            Seen::SessionClose(SessionId(1)),
        ]
    );
}

#[test]
fn test_process_parsed_routes_and_tracks_peer() {
    let mut h = harness();
    let mut engine = ScriptedEngine::default();
    let session = h
        .ctx
        .create_session(ConnectionId(7), addr(4433), addr(9000))
        .unwrap();

    let header = ParsedHeader {
        conn_id: ConnectionId(7),
        header_len: 9,
    };
    h.ctx
        .process_parsed(&mut engine, addr(9001), header, Bytes::from_static(&[0u8; 12]));

    let unknown = ParsedHeader {
        conn_id: ConnectionId(8),
        header_len: 9,
    };
    h.ctx
        .process_parsed(&mut engine, addr(9002), unknown, Bytes::from_static(&[0u8; 12]));

    assert_eq!(
        engine.seen,
        vec![
            Seen::Packet(Some(session), addr(9001)),
            Seen::Packet(None, addr(9002)),
        ]
    );
    assert_eq!(
        h.ctx.dispatcher().session(session).unwrap().peer_addr(),
        addr(9001)
    );
}

#[test]
fn test_classify_by_owner_shard() {
    let mut datagram = vec![0x08];
    datagram.extend_from_slice(&10u64.to_le_bytes());

    assert!(matches!(classify(&datagram, 2, 4), Route::Local(h) if h.conn_id == ConnectionId(10)));
    assert!(matches!(classify(&datagram, 0, 4), Route::Forward(2, _)));
    assert!(matches!(classify(&datagram[..4], 0, 4), Route::Malformed(_)));
    assert!(matches!(classify(&[], 0, 4), Route::Malformed(_)));

    // Zero-width ids all belong to shard 0.
    assert!(matches!(classify(&[0x00, 1, 2], 0, 4), Route::Local(h) if h.conn_id == ConnectionId(0)));
}

#[test]
fn test_loopback_echo_and_idle_teardown() {
    let mut h = harness();
    let mut engine = LoopbackEngine::new(0, &LoopbackConfig { idle_timeout_ms: 10 });
    let conn_id = ConnectionId(0xAB);
    let peer = addr(7000);

    let datagram = encode_frame(conn_id, StreamId(0), true, b"ping").unwrap();
    let header = crate::routing::parse_connection_id(&datagram).unwrap();
    h.ctx.process_parsed(&mut engine, peer, header, datagram);

    let session = h.ctx.dispatcher().route(conn_id).unwrap();
    assert_eq!(engine.session_count(), 1);

    // The echo sink answered through the command queue.
    let command = h.commands.try_recv().unwrap();
    h.ctx.handle_command(&mut engine, command);

    let sent = h.writer.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, peer);
    assert_eq!(sent[0].1, encode_frame(conn_id, StreamId(0), true, b"ping").unwrap());

    // Both directions finished, so the stream is gone.
    assert_eq!(h.ctx.dispatcher().session(session).unwrap().stream_count(), 0);

    h.clock.advance(std::time::Duration::from_millis(10));
    assert_eq!(h.ctx.do_tasks(&mut engine), 1);
    assert!(h.ctx.dispatcher().route(conn_id).is_none());
    assert_eq!(engine.session_count(), 0);
    assert_eq!(h.ctx.alarm_count(), 0);
}

#[test]
fn test_loopback_drops_write_for_unframeable_stream() {
    let mut h = harness();
    let mut engine = LoopbackEngine::new(0, &LoopbackConfig::default());
    let conn_id = ConnectionId(0xCD);

    let datagram = encode_frame(conn_id, StreamId(0), false, b"open").unwrap();
    let header = crate::routing::parse_connection_id(&datagram).unwrap();
    h.ctx.process_parsed(&mut engine, addr(7001), header, datagram);
    let session = h.ctx.dispatcher().route(conn_id).unwrap();
    while h.commands.try_recv().is_ok() {}

    let wide = StreamId(1 << 32);
    h.ctx.create_incoming_stream(session, wide).unwrap();
    h.ctx.handle_command(
        &mut engine,
        Command::WriteStreamData {
            session,
            stream_id: wide,
            data: Bytes::from_static(b"lost"),
            fin: false,
        },
    );

    assert!(h.writer.sent.lock().iter().all(|(_, d)| !d.ends_with(b"lost")));
    assert!(h.ctx.dispatcher().route(conn_id).is_some());
}

#[test]
fn test_loopback_insecure_hello_gets_empty_reply() {
    let mut h = harness();
    let mut engine = LoopbackEngine::new(0, &LoopbackConfig::default());
    let conn_id = ConnectionId(0x11);
    let peer = addr(7002);

    let hello = encode_frame(conn_id, HANDSHAKE_STREAM, true, &[7u8; 32]).unwrap();
    let header = crate::routing::parse_connection_id(&hello).unwrap();
    h.ctx.process_parsed(&mut engine, peer, header, hello);

    let session = h.ctx.dispatcher().route(conn_id).unwrap();
    assert_eq!(h.ctx.dispatcher().session(session).unwrap().stream_count(), 0);
    let sent = h.writer.sent.lock().clone();
    assert_eq!(sent, vec![(peer, encode_frame(conn_id, HANDSHAKE_STREAM, true, &[]).unwrap())]);
}

#[test]
fn test_loopback_secure_hello_answered_with_proof() {
    use crate::proof::{proof_payload, ProofSigner, ProofSource, ProofVerifier};
    use boring::pkey::PKey;
    use boring::rsa::Rsa;

    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
    let registry = SignerRegistry::new();
    let signer: Arc<dyn ProofSigner> = Arc::new(ProofSource::from_key(key.clone()).unwrap());
    let handle = registry.insert(signer).unwrap();

    let writer = RecordingWriter::default();
    let (command_tx, _commands) = mpsc::channel(8);
    let (proof_tx, mut proof_rx) = mpsc::channel(4);
    let mut ctx = ShardContext::new(
        0,
        addr(4433),
        Box::new(ManualClock::new(Timestamp::ZERO)),
        &SchedulerConfig::default(),
        Dispatcher::new(0, Arc::new(EchoSessionFactory), command_tx),
        Box::new(writer.clone()),
        ProofService::new(registry, Some(handle), proof_tx, None),
    );
    let mut engine = LoopbackEngine::new(0, &LoopbackConfig::default());
    let conn_id = ConnectionId(0x22);
    let chlo_hash = [9u8; 32];

    let hello = encode_frame(conn_id, HANDSHAKE_STREAM, true, &chlo_hash).unwrap();
    let header = crate::routing::parse_connection_id(&hello).unwrap();
    ctx.process_parsed(&mut engine, addr(7003), header, hello);
    assert!(writer.sent.lock().is_empty());

    let completion = proof_rx.try_recv().unwrap();
    engine.on_proof_ready(&mut ctx, completion);

    let sent = writer.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    let header = crate::routing::parse_connection_id(&sent[0].1).unwrap();
    let frame = crate::engine::decode_frame(sent[0].1.slice(header.header_len..)).unwrap();
    assert_eq!(frame.stream_id, HANDSHAKE_STREAM);
    assert!(frame.fin);

    let payload = proof_payload(LOOPBACK_PROOF_VERSION, LOOPBACK_SERVER_CONFIG, &chlo_hash);
    let verifier = ProofVerifier::from_key(&key).unwrap();
    assert_eq!(verifier.verify(&payload, &frame.payload), Ok(()));
}

#[test]
fn test_loopback_rejects_short_frame() {
    let mut h = harness();
    let mut engine = LoopbackEngine::new(0, &LoopbackConfig::default());

    let mut datagram = vec![0x08];
    datagram.extend_from_slice(&5u64.to_le_bytes());
    datagram.push(1);
    let datagram = Bytes::from(datagram);
    let header = crate::routing::parse_connection_id(&datagram).unwrap();
    h.ctx.process_parsed(&mut engine, addr(7000), header, datagram);

    assert_eq!(h.ctx.dispatcher().session_count(), 0);
    assert_eq!(engine.session_count(), 0);
}
