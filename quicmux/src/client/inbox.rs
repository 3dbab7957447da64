//! Stream sinks that park received data until the caller reads it.

use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::Mutex;
use quicmux_x::{
    PendingData, SessionFactory, SessionInfo, StreamFactory, StreamHandle, StreamId, StreamSink,
};
use std::collections::VecDeque;
use std::sync::Arc;

/// Data received on one stream and not yet read.
#[derive(Debug, Default)]
pub(crate) struct StreamInbox {
    pub chunks: VecDeque<Bytes>,
    pub fin: bool,
}

/// Shared between the dispatcher's sinks and [`super::ClientConn`].
pub(crate) type Inbox = Arc<Mutex<AHashMap<StreamId, StreamInbox>>>;

pub(crate) struct InboxFactory {
    inbox: Inbox,
}

impl InboxFactory {
    pub fn new(inbox: Inbox) -> Self {
        Self { inbox }
    }
}

impl SessionFactory for InboxFactory {
    fn new_session(&self, _info: &SessionInfo) -> Box<dyn StreamFactory> {
        Box::new(InboxStreams {
            inbox: Arc::clone(&self.inbox),
        })
    }
}

struct InboxStreams {
    inbox: Inbox,
}

impl StreamFactory for InboxStreams {
    fn create_incoming_stream(&mut self, handle: StreamHandle) -> Box<dyn StreamSink> {
        let stream = handle.stream_id();
        self.inbox.lock().entry(stream).or_default();
        Box::new(InboxSink {
            stream,
            inbox: Arc::clone(&self.inbox),
        })
    }

    fn create_outgoing_stream(&mut self, handle: StreamHandle) -> Box<dyn StreamSink> {
        self.create_incoming_stream(handle)
    }
}

struct InboxSink {
    stream: StreamId,
    inbox: Inbox,
}

impl StreamSink for InboxSink {
    fn on_data_available(&mut self, pending: &mut PendingData, fin: bool) {
        let mut inbox = self.inbox.lock();
        let entry = inbox.entry(self.stream).or_default();
        while let Some(chunk) = pending.pop_chunk() {
            if !chunk.is_empty() {
                entry.chunks.push_back(chunk);
            }
        }
        entry.fin |= fin;
    }
}
