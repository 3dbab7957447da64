use super::*;
use parking_lot::Mutex;
use quicmux_x::{PendingData, StreamFactory, StreamSink};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Session(SessionId),
    Data(StreamId, Vec<u8>, bool),
    Closed(StreamId),
}

type Log = Arc<Mutex<Vec<Event>>>;

struct RecordingFactory {
    log: Log,
    /// Leave this many bytes unconsumed on every delivery.
    keep: usize,
}

impl SessionFactory for RecordingFactory {
    fn new_session(&self, info: &SessionInfo) -> Box<dyn StreamFactory> {
        self.log.lock().push(Event::Session(info.session));
        Box::new(RecordingStreams {
            log: Arc::clone(&self.log),
            keep: self.keep,
        })
    }
}

struct RecordingStreams {
    log: Log,
    keep: usize,
}

impl StreamFactory for RecordingStreams {
    fn create_incoming_stream(&mut self, handle: StreamHandle) -> Box<dyn StreamSink> {
        self.create_outgoing_stream(handle)
    }

    fn create_outgoing_stream(&mut self, handle: StreamHandle) -> Box<dyn StreamSink> {
        Box::new(RecordingSink {
            id: handle.stream_id(),
            log: Arc::clone(&self.log),
            keep: self.keep,
        })
    }
}

struct RecordingSink {
    id: StreamId,
    log: Log,
    keep: usize,
}

impl StreamSink for RecordingSink {
    fn on_data_available(&mut self, pending: &mut PendingData, fin: bool) {
        if pending.len() <= self.keep {
            return;
        }
        let data = pending.take_all();
        self.log.lock().push(Event::Data(self.id, data.to_vec(), fin));
    }

    fn on_close(&mut self) {
        self.log.lock().push(Event::Closed(self.id));
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn dispatcher(keep: usize) -> (Dispatcher, Log, mpsc::Receiver<Command>) {
    let log: Log = Arc::default();
    let factory = Arc::new(RecordingFactory {
        log: Arc::clone(&log),
        keep,
    });
    let (tx, rx) = mpsc::channel(16);
    (Dispatcher::new(0, factory, tx), log, rx)
}

#[test]
fn test_create_session_registers_and_routes() {
    let (mut d, log, _rx) = dispatcher(0);
    let s = d.create_session(ConnectionId(42), addr(1), addr(2)).unwrap();

    assert_eq!(d.route(ConnectionId(42)), Some(s));
    assert_eq!(d.route(ConnectionId(43)), None);
    assert!(d.contains_session(s));
    assert_eq!(d.session(s).unwrap().state(), SessionState::Created);
    assert_eq!(log.lock().as_slice(), &[Event::Session(s)]);
}

#[test]
fn test_duplicate_connection_rejected() {
    let (mut d, _log, _rx) = dispatcher(0);
    d.create_session(ConnectionId(1), addr(1), addr(2)).unwrap();
    assert_eq!(
        d.create_session(ConnectionId(1), addr(1), addr(3)),
        Err(DispatchError::DuplicateSession(ConnectionId(1)))
    );
    assert_eq!(d.session_count(), 1);
}

#[test]
fn test_delete_session_force_closes_streams_first() {
    let (mut d, log, _rx) = dispatcher(0);
    let s = d.create_session(ConnectionId(5), addr(1), addr(2)).unwrap();
    d.create_incoming_stream(s, StreamId(0)).unwrap();
    d.create_incoming_stream(s, StreamId(4)).unwrap();

    let stats = d.delete_session(s).unwrap();
    assert_eq!(stats.streams_opened, 2);
    assert_eq!(stats.streams_closed, 2);
    assert!(!d.contains_session(s));
    assert_eq!(d.route(ConnectionId(5)), None);

    let log = log.lock();
    assert!(log.contains(&Event::Closed(StreamId(0))));
    assert!(log.contains(&Event::Closed(StreamId(4))));
}

#[test]
fn test_delete_unknown_session_is_error() {
    let (mut d, _log, _rx) = dispatcher(0);
    let s = d.create_session(ConnectionId(5), addr(1), addr(2)).unwrap();
    d.delete_session(s).unwrap();
    assert_eq!(d.delete_session(s), Err(DispatchError::UnknownSession(s)));
}

#[test]
fn test_session_ids_are_not_reused() {
    let (mut d, _log, _rx) = dispatcher(0);
    let a = d.create_session(ConnectionId(1), addr(1), addr(2)).unwrap();
    d.delete_session(a).unwrap();
    let b = d.create_session(ConnectionId(1), addr(1), addr(2)).unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_outgoing_stream_ids_are_server_bidi() {
    let (mut d, _log, _rx) = dispatcher(0);
    let s = d.create_session(ConnectionId(1), addr(1), addr(2)).unwrap();

    let ids: Vec<StreamId> = (0..3).map(|_| d.create_outgoing_stream(s).unwrap()).collect();
    assert_eq!(ids, vec![StreamId(1), StreamId(5), StreamId(9)]);
    assert!(ids.iter().all(|id| id.is_server_initiated() && id.is_bidirectional()));
}

#[test]
fn test_duplicate_incoming_stream_rejected() {
    let (mut d, _log, _rx) = dispatcher(0);
    let s = d.create_session(ConnectionId(1), addr(1), addr(2)).unwrap();
    d.create_incoming_stream(s, StreamId(0)).unwrap();
    assert_eq!(
        d.create_incoming_stream(s, StreamId(0)),
        Err(DispatchError::DuplicateStream {
            session: s,
            stream: StreamId(0)
        })
    );
}

#[test]
fn test_double_close_is_silent_noop() {
    let (mut d, log, _rx) = dispatcher(0);
    let s = d.create_session(ConnectionId(1), addr(1), addr(2)).unwrap();
    d.create_incoming_stream(s, StreamId(8)).unwrap();

    assert!(d.close_stream(s, StreamId(8)));
    assert!(!d.close_stream(s, StreamId(8)));
    assert!(!d.close_stream(s, StreamId(12)));
    assert!(!d.close_stream(SessionId(999), StreamId(8)));

    let closes = log
        .lock()
        .iter()
        .filter(|e| matches!(e, Event::Closed(_)))
        .count();
    assert_eq!(closes, 1);
}

#[test]
fn test_live_set_matches_created_minus_closed() {
    let (mut d, _log, _rx) = dispatcher(0);
    let s = d.create_session(ConnectionId(1), addr(1), addr(2)).unwrap();
    let mut expected = BTreeSet::new();

    let mut seed = 7u64;
    for round in 0..200u64 {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let id = StreamId((seed >> 33) % 16 * 4);
        if (seed >> 20) % 3 == 0 || round % 7 == 0 {
            if d.close_stream(s, id) {
                assert!(expected.remove(&id));
            } else {
                assert!(!expected.contains(&id));
            }
        } else if d.create_incoming_stream(s, id).is_ok() {
            assert!(expected.insert(id));
        } else {
            assert!(expected.contains(&id));
        }

        let live: BTreeSet<StreamId> = d.session(s).unwrap().stream_ids().into_iter().collect();
        assert_eq!(live, expected);
    }
}

#[test]
fn test_data_delivered_in_order_and_leftovers_kept() {
    // The sink only consumes once more than 3 bytes are pending.
    let (mut d, log, _rx) = dispatcher(3);
    let s = d.create_session(ConnectionId(1), addr(1), addr(2)).unwrap();
    d.create_incoming_stream(s, StreamId(0)).unwrap();

    d.deliver_stream_data(s, StreamId(0), Bytes::from_static(b"ab"), false)
        .unwrap();
    assert_eq!(d.stream(s, StreamId(0)).unwrap().pending_len(), 2);

    d.deliver_stream_data(s, StreamId(0), Bytes::from_static(b"cd"), true)
        .unwrap();
    let stream = d.stream(s, StreamId(0)).unwrap();
    assert_eq!(stream.pending_len(), 0);
    assert!(stream.fin_received());

    assert_eq!(
        log.lock().last(),
        Some(&Event::Data(StreamId(0), b"abcd".to_vec(), true))
    );
}

#[test]
fn test_data_for_unknown_stream_is_error() {
    let (mut d, _log, _rx) = dispatcher(0);
    let s = d.create_session(ConnectionId(1), addr(1), addr(2)).unwrap();
    assert_eq!(
        d.deliver_stream_data(s, StreamId(3), Bytes::from_static(b"x"), false),
        Err(DispatchError::UnknownStream {
            session: s,
            stream: StreamId(3)
        })
    );
}

#[test]
fn test_stream_handles_feed_shard_command_queue() {
    struct Writer;
    impl StreamFactory for Writer {
        fn create_incoming_stream(&mut self, handle: StreamHandle) -> Box<dyn StreamSink> {
            handle.write(Bytes::from_static(b"hello"), true).unwrap();
            Box::new(Silent)
        }
        fn create_outgoing_stream(&mut self, handle: StreamHandle) -> Box<dyn StreamSink> {
            self.create_incoming_stream(handle)
        }
    }
    struct Silent;
    impl StreamSink for Silent {
        fn on_data_available(&mut self, _pending: &mut PendingData, _fin: bool) {}
    }
    struct Factory;
    impl SessionFactory for Factory {
        fn new_session(&self, _info: &SessionInfo) -> Box<dyn StreamFactory> {
            Box::new(Writer)
        }
    }

    let (tx, mut rx) = mpsc::channel(4);
    let mut d = Dispatcher::new(3, Arc::new(Factory), tx);
    let s = d.create_session(ConnectionId(9), addr(1), addr(2)).unwrap();
    d.create_incoming_stream(s, StreamId(0)).unwrap();

    match rx.try_recv().unwrap() {
        Command::WriteStreamData {
            session,
            stream_id,
            fin,
            ..
        } => {
            assert_eq!(session, s);
            assert_eq!(stream_id, StreamId(0));
            assert!(fin);
        }
        other => panic!("unexpected command {:?}", other),
    }
}

#[test]
fn test_statistics_snapshot() {
    let (mut d, _log, _rx) = dispatcher(0);
    let a = d.create_session(ConnectionId(1), addr(1), addr(2)).unwrap();
    let b = d.create_session(ConnectionId(2), addr(1), addr(3)).unwrap();
    d.create_incoming_stream(a, StreamId(0)).unwrap();
    d.record_packet_in(a, 100);
    d.record_packet_out(b, 40);
    d.record_write_error(b);

    let stats = d.statistics();
    assert_eq!(stats.live_sessions, 2);
    assert_eq!(stats.live_streams, 1);
    assert_eq!(stats.sessions[0].0, a);
    assert_eq!(stats.sessions[0].1.bytes_in, 100);
    assert_eq!(stats.sessions[1].1.bytes_out, 40);
    assert_eq!(stats.sessions[1].1.write_errors, 1);
    assert_eq!(d.session(a).unwrap().state(), SessionState::Active);
}

#[test]
fn test_delete_all_sessions() {
    let (mut d, _log, _rx) = dispatcher(0);
    for cid in 0..4 {
        d.create_session(ConnectionId(cid), addr(1), addr(2)).unwrap();
    }
    assert_eq!(d.delete_all_sessions(), 4);
    assert_eq!(d.session_count(), 0);
}
