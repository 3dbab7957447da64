//! Everything an engine can touch on its shard.

use super::writer::{PacketWriter, WriteStatus};
use crate::clock::{Clock, Timestamp};
use crate::dispatcher::{self, Dispatcher, SessionStats};
use crate::engine::{Engine, InboundPacket};
use crate::proof::{self, ProofService};
use crate::routing::ParsedHeader;
use crate::scheduler::{
    Alarm, AlarmId, AlarmState, AlarmToken, FireDecision, SchedulerConfig, TaskRunner, WakeTimer,
};
use crate::telemetry::{record_metric, MetricsEvent};
use ahash::AHashMap;
use bytes::Bytes;
use quicmux_x::{Command, ConnectionId, SessionId, StreamId};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, trace, warn};

/// Per-shard state handed to every [`Engine`] callback.
///
/// Owns the shard's alarms and their scheduler, the session dispatcher, the
/// outbound writer and the proof service. Not `Send`: it is built on the
/// shard thread and dies there.
pub struct ShardContext {
    shard_id: usize,
    local_addr: SocketAddr,
    clock: Box<dyn Clock>,
    max_premature_rearms: u32,
    coalesce_window: Duration,
    runner: TaskRunner,
    alarms: AHashMap<AlarmId, Alarm>,
    next_alarm: u64,
    dispatcher: Dispatcher,
    writer: Box<dyn PacketWriter>,
    proofs: ProofService,
}

impl ShardContext {
    pub fn new(
        shard_id: usize,
        local_addr: SocketAddr,
        clock: Box<dyn Clock>,
        scheduler: &SchedulerConfig,
        dispatcher: Dispatcher,
        writer: Box<dyn PacketWriter>,
        proofs: ProofService,
    ) -> Self {
        let runner = TaskRunner::new(scheduler, clock.now());
        Self {
            shard_id,
            local_addr,
            clock,
            max_premature_rearms: scheduler.max_premature_rearms,
            coalesce_window: Duration::from_micros(scheduler.coalesce_window_us),
            runner,
            alarms: AHashMap::new(),
            next_alarm: 1,
            dispatcher,
            writer,
            proofs,
        }
    }

    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// The OS timer the shard loop should be sleeping on.
    pub fn timer(&self) -> WakeTimer {
        self.runner.timer()
    }

    pub fn task_runner(&self) -> &TaskRunner {
        &self.runner
    }

    // ---- alarms ----

    /// New idle alarm. `token` comes back in [`Engine::on_alarm`].
    pub fn create_alarm(&mut self, token: AlarmToken) -> AlarmId {
        let alarm = AlarmId(self.next_alarm);
        self.next_alarm += 1;
        self.alarms.insert(alarm, Alarm::new(token));
        self.runner.register_alarm(alarm);
        alarm
    }

    /// Arm `alarm` for `deadline`, replacing any earlier deadline.
    ///
    /// A destroyed alarm is left alone.
    pub fn set_alarm(&mut self, alarm: AlarmId, deadline: Timestamp) {
        let now = self.clock.now();
        match self.alarms.get_mut(&alarm) {
            Some(entry) => {
                if entry.set_impl(deadline) {
                    self.runner.run_alarm(alarm, deadline, now);
                }
            }
            None => self.ensure_destroyed(alarm, "set"),
        }
    }

    pub fn cancel_alarm(&mut self, alarm: AlarmId) {
        let now = self.clock.now();
        match self.alarms.get_mut(&alarm) {
            Some(entry) => {
                if entry.cancel_impl() {
                    self.runner.cancel_alarm(alarm, now);
                }
            }
            None => self.ensure_destroyed(alarm, "cancel"),
        }
    }

    /// Cancel and forget `alarm`. Later calls with the same id are no-ops.
    pub fn destroy_alarm(&mut self, alarm: AlarmId) {
        let now = self.clock.now();
        match self.alarms.remove(&alarm) {
            Some(mut entry) => {
                entry.destroy();
                self.runner.unregister_alarm(alarm, now);
            }
            None => self.ensure_destroyed(alarm, "destroy"),
        }
    }

    pub fn alarm_state(&self, alarm: AlarmId) -> AlarmState {
        match self.alarms.get(&alarm) {
            Some(entry) => entry.state(),
            None => {
                self.ensure_destroyed(alarm, "inspect");
                AlarmState::Destroyed
            }
        }
    }

    pub fn is_alarm_set(&self, alarm: AlarmId) -> bool {
        self.alarm_state(alarm) == AlarmState::Armed
    }

    pub fn alarm_count(&self) -> usize {
        self.alarms.len()
    }

    /// Ids below `next_alarm` were handed out and have since been destroyed.
    /// Anything else is an id this shard never created.
    fn ensure_destroyed(&self, alarm: AlarmId, op: &str) {
        if alarm.0 == 0 || alarm.0 >= self.next_alarm {
            panic!("{} on alarm {} that shard {} never created", op, alarm, self.shard_id);
        }
        trace!(alarm = %alarm, op, "Ignoring call on destroyed alarm");
    }

    /// Fire every due alarm. Returns how many reached the engine.
    pub fn do_tasks(&mut self, engine: &mut dyn Engine) -> usize {
        let due = self.runner.pop_due(self.clock.now());
        let mut fired = 0;

        for alarm in due {
            // Re-armed by an earlier callback in this batch.
            if self.runner.is_scheduled(alarm) {
                continue;
            }
            let horizon = self.clock.now() + self.coalesce_window;
            let decision = match self.alarms.get_mut(&alarm) {
                Some(entry) => entry.on_alarm(horizon, self.max_premature_rearms),
                None => continue,
            };

            match decision {
                FireDecision::Fire(token) => {
                    engine.on_alarm(self, alarm, token);
                    fired += 1;
                }
                FireDecision::ForceFire(token) => {
                    error!(
                        shard_id = self.shard_id,
                        alarm = %alarm,
                        max_rearms = self.max_premature_rearms,
                        "Alarm still early after repeated re-arms, firing anyway"
                    );
                    engine.on_alarm(self, alarm, token);
                    fired += 1;
                }
                FireDecision::Rearm(deadline) => {
                    let now = self.clock.now();
                    warn!(
                        shard_id = self.shard_id,
                        alarm = %alarm,
                        early_us = deadline.as_micros() - now.as_micros(),
                        "Timer woke before alarm deadline, re-arming"
                    );
                    record_metric(MetricsEvent::AlarmRearmed);
                    self.runner.run_alarm(alarm, deadline, now);
                }
                FireDecision::Skip => {
                    trace!(alarm = %alarm, "Due alarm no longer armed");
                }
            }
        }

        self.runner.finish_tasks(self.clock.now());
        if fired > 0 {
            record_metric(MetricsEvent::AlarmsFired { count: fired });
        }
        fired
    }

    // ---- output ----

    pub fn write_packet(&mut self, peer: SocketAddr, data: Bytes) -> WriteStatus {
        self.writer.write_packet(peer, data)
    }

    /// Write a datagram to the session's current peer address.
    pub fn send_to_session(
        &mut self,
        session: SessionId,
        data: Bytes,
    ) -> dispatcher::Result<WriteStatus> {
        let peer = self.dispatcher.session(session)?.peer_addr();
        let len = data.len();
        let status = self.writer.write_packet(peer, data);
        match status {
            WriteStatus::Queued => self.dispatcher.record_packet_out(session, len),
            WriteStatus::Blocked => self.dispatcher.record_write_error(session),
        }
        Ok(status)
    }

    // ---- sessions and streams ----

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    pub fn create_session(
        &mut self,
        conn_id: ConnectionId,
        self_addr: SocketAddr,
        peer: SocketAddr,
    ) -> dispatcher::Result<SessionId> {
        self.dispatcher.create_session(conn_id, self_addr, peer)
    }

    pub fn delete_session(&mut self, session: SessionId) -> dispatcher::Result<SessionStats> {
        self.dispatcher.delete_session(session)
    }

    pub fn create_incoming_stream(
        &mut self,
        session: SessionId,
        stream_id: StreamId,
    ) -> dispatcher::Result<()> {
        self.dispatcher.create_incoming_stream(session, stream_id)
    }

    pub fn create_outgoing_stream(&mut self, session: SessionId) -> dispatcher::Result<StreamId> {
        self.dispatcher.create_outgoing_stream(session)
    }

    pub fn deliver_stream_data(
        &mut self,
        session: SessionId,
        stream_id: StreamId,
        data: Bytes,
        fin: bool,
    ) -> dispatcher::Result<()> {
        self.dispatcher
            .deliver_stream_data(session, stream_id, data, fin)
    }

    pub fn close_stream(&mut self, session: SessionId, stream_id: StreamId) -> bool {
        self.dispatcher.close_stream(session, stream_id)
    }

    // ---- proofs ----

    pub fn is_secure(&self) -> bool {
        self.proofs.is_secure()
    }

    /// Sign `payload` on the shard thread.
    pub fn get_proof(&self, payload: &[u8]) -> proof::Result<Vec<u8>> {
        self.proofs.sign(payload)
    }

    /// Sign `payload` off-thread; the result arrives in
    /// [`Engine::on_proof_ready`] with the returned request id.
    pub fn request_proof(&mut self, payload: Vec<u8>) -> u64 {
        self.proofs.request(payload)
    }

    // ---- event entry points ----

    /// Apply one application command.
    pub fn handle_command(&mut self, engine: &mut dyn Engine, command: Command) {
        match command {
            Command::WriteStreamData {
                session,
                stream_id,
                data,
                fin,
            } => engine.on_stream_write(self, session, stream_id, data, fin),
            Command::CloseStream { session, stream_id } => {
                engine.on_stream_close(self, session, stream_id)
            }
            Command::CloseSession { session } => engine.on_session_close(self, session),
        }
    }

    /// Hand a datagram owned by this shard to the engine.
    pub fn process_parsed(
        &mut self,
        engine: &mut dyn Engine,
        peer: SocketAddr,
        header: ParsedHeader,
        data: Bytes,
    ) {
        let session = self.dispatcher.route(header.conn_id);
        if let Some(id) = session {
            if let Ok(entry) = self.dispatcher.session_mut(id) {
                if entry.peer_addr() != peer {
                    trace!(session = %id, old = %entry.peer_addr(), new = %peer, "Peer address changed");
                    entry.set_peer_addr(peer);
                }
            }
        }

        let packet = InboundPacket {
            self_addr: self.local_addr,
            peer,
            conn_id: header.conn_id,
            session,
            header_len: header.header_len,
            data,
        };
        engine.process_packet(self, packet);
    }
}

impl std::fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardContext")
            .field("shard_id", &self.shard_id)
            .field("local_addr", &self.local_addr)
            .field("alarms", &self.alarms.len())
            .field("runner", &self.runner)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}
