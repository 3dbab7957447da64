//! Outbound datagram path.
//!
//! The shard never touches the socket for writes. It pushes datagrams onto
//! a bounded crossbeam queue with `try_send`; a dedicated `writer-{i}` OS
//! thread drains the queue, performs the `send_to`, and posts a
//! [`WriteCompletion`] back over the shard's completion channel.
//!
//! ```text
//! shard loop --try_send--> [write queue] --> writer thread --send_to--> socket
//!     ^                                            |
//!     +-------------[completion channel]<----------+
//! ```

use crate::telemetry::{record_metric, MetricsEvent};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// How long the writer waits for socket writability before retrying.
const WRITABLE_POLL_MS: i32 = 100;

/// `WouldBlock` retries per datagram before it is failed.
const MAX_SEND_RETRIES: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Accepted; a completion follows.
    Queued,
    /// Queue full. Nothing was queued and no completion follows.
    Blocked,
}

/// Outcome of one datagram write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCompletion {
    pub peer: SocketAddr,
    pub len: usize,
    pub error: Option<io::ErrorKind>,
}

impl WriteCompletion {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Where a shard sends datagrams.
pub trait PacketWriter {
    /// Never blocks.
    fn write_packet(&mut self, peer: SocketAddr, data: Bytes) -> WriteStatus;
}

#[derive(Debug)]
struct OutboundDatagram {
    peer: SocketAddr,
    data: Bytes,
}

/// Production writer backed by a writer thread.
pub struct ShardWriter {
    shard_id: usize,
    queue: Option<Sender<OutboundDatagram>>,
    thread: Option<JoinHandle<()>>,
}

impl ShardWriter {
    /// Spawn the writer thread over `socket`, usually a `try_clone` of the
    /// shard's receive socket.
    pub fn spawn(
        shard_id: usize,
        socket: UdpSocket,
        capacity: usize,
        completions: mpsc::Sender<WriteCompletion>,
    ) -> io::Result<Self> {
        let (tx, rx) = crossbeam_channel::bounded(capacity);
        let thread = thread::Builder::new()
            .name(format!("writer-{}", shard_id))
            .spawn(move || run_writer(shard_id, socket, rx, completions))?;

        Ok(Self {
            shard_id,
            queue: Some(tx),
            thread: Some(thread),
        })
    }

    /// Close the queue and wait for the writer to drain it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.queue.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(shard_id = self.shard_id, "Writer thread panicked");
            }
        }
    }
}

impl PacketWriter for ShardWriter {
    fn write_packet(&mut self, peer: SocketAddr, data: Bytes) -> WriteStatus {
        let Some(queue) = &self.queue else {
            return WriteStatus::Blocked;
        };
        match queue.try_send(OutboundDatagram { peer, data }) {
            Ok(()) => WriteStatus::Queued,
            Err(TrySendError::Full(_)) => {
                warn!(shard_id = self.shard_id, peer = %peer, "Write queue full, dropping datagram");
                record_metric(MetricsEvent::WriteQueueFull);
                WriteStatus::Blocked
            }
            Err(TrySendError::Disconnected(_)) => {
                error!(shard_id = self.shard_id, "Writer thread has exited");
                WriteStatus::Blocked
            }
        }
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_writer(
    shard_id: usize,
    socket: UdpSocket,
    queue: Receiver<OutboundDatagram>,
    completions: mpsc::Sender<WriteCompletion>,
) {
    debug!(shard_id, "Writer thread started");
    let mut shard_gone = false;

    for datagram in queue.iter() {
        let completion = send_datagram(&socket, &datagram);
        match completion.error {
            None => record_metric(MetricsEvent::PacketSent {
                bytes: completion.len,
            }),
            Some(kind) => {
                warn!(shard_id, peer = %datagram.peer, error = ?kind, "Datagram send failed");
                record_metric(MetricsEvent::NetworkSendError);
            }
        }

        // Keep draining after the shard is gone so the queue empties.
        if !shard_gone && completions.blocking_send(completion).is_err() {
            shard_gone = true;
        }
    }

    debug!(shard_id, "Writer thread stopped");
}

fn send_datagram(socket: &UdpSocket, datagram: &OutboundDatagram) -> WriteCompletion {
    send_with_retry(
        datagram.peer,
        || socket.send_to(&datagram.data, datagram.peer),
        || wait_writable(socket),
    )
}

/// Run `send` until it succeeds, fails hard, or has hit `WouldBlock`
/// more than [`MAX_SEND_RETRIES`] times.
fn send_with_retry(
    peer: SocketAddr,
    mut send: impl FnMut() -> io::Result<usize>,
    mut wait: impl FnMut(),
) -> WriteCompletion {
    let mut retries = 0;
    loop {
        let kind = match send() {
            Ok(sent) => {
                trace!(peer = %peer, len = sent, "Datagram sent");
                return WriteCompletion {
                    peer,
                    len: sent,
                    error: None,
                };
            }
            Err(e) => e.kind(),
        };
        match kind {
            io::ErrorKind::WouldBlock if retries < MAX_SEND_RETRIES => {
                retries += 1;
                wait();
            }
            io::ErrorKind::Interrupted => {}
            kind => {
                return WriteCompletion {
                    peer,
                    len: 0,
                    error: Some(kind),
                };
            }
        }
    }
}

/// Block until the non-blocking socket can accept a datagram, or the poll
/// interval passes.
fn wait_writable(socket: &UdpSocket) {
    let mut fds = libc::pollfd {
        fd: socket.as_raw_fd(),
        events: libc::POLLOUT,
        revents: 0,
    };
    // SAFETY: `fds` is a valid pollfd for the duration of the call and the
    // count matches.
    unsafe {
        libc::poll(&mut fds, 1, WRITABLE_POLL_MS);
    }
}
