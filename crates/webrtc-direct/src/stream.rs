use crate::channel::ByteChannel;
use crate::connection::ConnectionInner;
use crate::TransportError;

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// One multiplexed duplex byte stream, bound to a negotiated protocol.
///
/// The two halves close independently: `close_write` ends our output while
/// reads continue; the stream is fully closed when both halves are, or when
/// the parent connection closes. A stream is owned by exactly one caller;
/// it is not clonable.
pub struct Stream {
    id: u64,
    protocol: String,
    channel: Arc<dyn ByteChannel>,
    parent: Weak<ConnectionInner>,
    write_closed: AtomicBool,
}

impl Stream {
    pub(crate) fn new(
        id: u64,
        protocol: String,
        channel: Arc<dyn ByteChannel>,
        parent: Weak<ConnectionInner>,
    ) -> Self {
        Self {
            id,
            protocol,
            channel,
            parent,
            write_closed: AtomicBool::new(false),
        }
    }

    /// Stream id, unique within the parent connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The negotiated protocol id.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Write one chunk. Chunks are delivered to the remote read side in
    /// submission order.
    pub async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.write_closed.load(Ordering::SeqCst) {
            return Err(TransportError::StreamClosed);
        }
        self.channel
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    /// Read the next chunk. `None` marks the end of the read sequence.
    pub async fn read(&self) -> Option<Bytes> {
        self.channel.recv().await
    }

    /// Read until end-of-stream, concatenating all chunks.
    pub async fn read_to_end(&self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await {
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Half-close: everything written so far is delivered, then the remote
    /// read sequence terminates. Local reads stay open.
    pub async fn close_write(&self) {
        if !self.write_closed.swap(true, Ordering::SeqCst) {
            self.channel.close_write().await;
        }
    }

    /// Close both halves and detach from the parent connection.
    pub async fn close(&self) {
        self.write_closed.store(true, Ordering::SeqCst);
        self.channel.close().await;
        self.detach();
    }

    fn detach(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.release_stream(self.id);
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.detach();
    }
}
