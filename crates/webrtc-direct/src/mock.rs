//! Test doubles for the upgrader and registrar boundaries.
//!
//! [`MockUpgrader`] skips security entirely and multiplexes streams over the
//! raw channel with a small frame protocol; [`MockRegistrar`] dispatches
//! inbound streams to registered handler closures. Both are injected
//! explicitly — there is no process-wide registry.

use crate::channel::ByteChannel;
use crate::connection::Connection;
use crate::stream::Stream;
use crate::upgrader::{Registrar, StreamMuxer, Upgrader};
use crate::{PeerId, TransportError};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use multiaddr::Multiaddr;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

const FLAG_OPEN: u8 = 0;
const FLAG_DATA: u8 = 1;
const FLAG_FIN: u8 = 2;
const FLAG_RESET: u8 = 3;

const HEADER_LEN: usize = 9;

fn encode_frame(id: u64, flag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u64(id);
    buf.put_u8(flag);
    buf.extend_from_slice(payload);
    buf.freeze()
}

fn decode_frame(mut frame: Bytes) -> Option<(u64, u8, Bytes)> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    let id = frame.get_u64();
    let flag = frame.get_u8();
    Some((id, flag, frame))
}

struct MuxEntry {
    /// Feeds inbound payloads to the substream; taken on FIN so the read
    /// sequence ends after the buffered chunks.
    data_tx: Option<mpsc::UnboundedSender<Bytes>>,
    cancel: CancellationToken,
}

struct MuxShared {
    raw: Arc<dyn ByteChannel>,
    entries: Mutex<HashMap<u64, MuxEntry>>,
}

impl MuxShared {
    fn register(self: &Arc<Self>, id: u64) -> Arc<MuxedStream> {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.entries.lock().expect("mux table poisoned").insert(
            id,
            MuxEntry {
                data_tx: Some(data_tx),
                cancel: cancel.clone(),
            },
        );
        Arc::new(MuxedStream {
            id,
            shared: self.clone(),
            rx: tokio::sync::Mutex::new(data_rx),
            cancel,
            write_closed: AtomicBool::new(false),
        })
    }
}

/// One substream of a [`FrameMuxer`].
struct MuxedStream {
    id: u64,
    shared: Arc<MuxShared>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    cancel: CancellationToken,
    write_closed: AtomicBool,
}

#[async_trait]
impl ByteChannel for MuxedStream {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() || self.write_closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.shared
            .raw
            .send(encode_frame(self.id, FLAG_DATA, &data))
            .await
    }

    async fn recv(&self) -> Option<Bytes> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            chunk = rx.recv() => chunk,
        }
    }

    async fn close_write(&self) {
        if !self.write_closed.swap(true, Ordering::SeqCst) {
            let _ = self
                .shared
                .raw
                .send(encode_frame(self.id, FLAG_FIN, &[]))
                .await;
        }
    }

    async fn close(&self) {
        self.write_closed.store(true, Ordering::SeqCst);
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            let _ = self
                .shared
                .raw
                .send(encode_frame(self.id, FLAG_RESET, &[]))
                .await;
        }
        self.shared
            .entries
            .lock()
            .expect("mux table poisoned")
            .remove(&self.id);
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Frame-based stream multiplexer over one raw channel.
///
/// Every raw message is one frame: 8-byte stream id, 1-byte flag
/// (OPEN/DATA/FIN/RESET), payload. The dialing side allocates odd stream
/// ids, the listening side even ones, so the two ends never collide.
pub struct FrameMuxer {
    shared: Arc<MuxShared>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Arc<dyn ByteChannel>>>,
    next_id: AtomicU64,
}

impl FrameMuxer {
    pub fn new(raw: Arc<dyn ByteChannel>, initiator: bool) -> Arc<Self> {
        let shared = Arc::new(MuxShared {
            raw,
            entries: Mutex::new(HashMap::new()),
        });
        let (inbound_tx, inbound_rx) = mpsc::channel(16);
        tokio::spawn(demux(shared.clone(), inbound_tx));
        Arc::new(Self {
            shared,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            next_id: AtomicU64::new(if initiator { 1 } else { 2 }),
        })
    }
}

async fn demux(shared: Arc<MuxShared>, inbound_tx: mpsc::Sender<Arc<dyn ByteChannel>>) {
    loop {
        let Some(raw_frame) = shared.raw.recv().await else {
            break;
        };
        let Some((id, flag, payload)) = decode_frame(raw_frame) else {
            warn!("dropping undersized mux frame");
            continue;
        };
        match flag {
            FLAG_OPEN => {
                let stream = shared.register(id);
                if inbound_tx.send(stream).await.is_err() {
                    break;
                }
            }
            FLAG_DATA => {
                let entries = shared.entries.lock().expect("mux table poisoned");
                if let Some(entry) = entries.get(&id) {
                    if let Some(tx) = &entry.data_tx {
                        let _ = tx.send(payload);
                    }
                }
            }
            FLAG_FIN => {
                let mut entries = shared.entries.lock().expect("mux table poisoned");
                if let Some(entry) = entries.get_mut(&id) {
                    entry.data_tx.take();
                }
            }
            FLAG_RESET => {
                let entry = shared
                    .entries
                    .lock()
                    .expect("mux table poisoned")
                    .remove(&id);
                if let Some(entry) = entry {
                    entry.cancel.cancel();
                }
            }
            other => warn!(flag = other, "dropping mux frame with unknown flag"),
        }
    }

    // Raw channel is gone: terminate every substream.
    let entries: Vec<MuxEntry> = {
        let mut entries = shared.entries.lock().expect("mux table poisoned");
        entries.drain().map(|(_, entry)| entry).collect()
    };
    for entry in entries {
        entry.cancel.cancel();
    }
}

#[async_trait]
impl StreamMuxer for FrameMuxer {
    async fn open_substream(&self) -> Result<Arc<dyn ByteChannel>, TransportError> {
        if self.shared.raw.is_closed() {
            return Err(TransportError::ChannelClosed);
        }
        let id = self.next_id.fetch_add(2, Ordering::SeqCst);
        let stream = self.shared.register(id);
        if let Err(e) = self.shared.raw.send(encode_frame(id, FLAG_OPEN, &[])).await {
            self.shared
                .entries
                .lock()
                .expect("mux table poisoned")
                .remove(&id);
            return Err(e);
        }
        Ok(stream)
    }

    async fn next_substream(&self) -> Option<Arc<dyn ByteChannel>> {
        self.inbound.lock().await.recv().await
    }

    async fn close(&self) {
        self.shared.raw.close().await;
    }
}

/// Plaintext upgrader for tests: no security handshake, streams muxed with
/// [`FrameMuxer`]. Inbound streams are served against the injected
/// registrar on both sides, like a real duplex session.
pub struct MockUpgrader {
    registrar: Arc<dyn Registrar>,
}

impl MockUpgrader {
    pub fn new(registrar: Arc<dyn Registrar>) -> Arc<Self> {
        Arc::new(Self { registrar })
    }
}

#[async_trait]
impl Upgrader for MockUpgrader {
    async fn upgrade_outbound(
        &self,
        raw: Arc<dyn ByteChannel>,
        remote_addr: Multiaddr,
        remote_peer: Option<PeerId>,
    ) -> Result<Connection, TransportError> {
        let muxer = FrameMuxer::new(raw, true);
        let conn = Connection::new(muxer, remote_addr, remote_peer);
        conn.serve(self.registrar.clone());
        Ok(conn)
    }

    async fn upgrade_inbound(
        &self,
        raw: Arc<dyn ByteChannel>,
        remote_addr: Multiaddr,
    ) -> Result<Connection, TransportError> {
        let muxer = FrameMuxer::new(raw, false);
        let conn = Connection::new(muxer, remote_addr, None);
        conn.serve(self.registrar.clone());
        Ok(conn)
    }
}

type Handler = Arc<dyn Fn(Stream) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Protocol registrar for tests: maps protocol ids to handler closures.
pub struct MockRegistrar {
    handlers: Mutex<HashMap<String, Handler>>,
}

impl MockRegistrar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// Register a handler for a protocol id.
    pub fn handle<F, Fut>(&self, protocol: &str, handler: F)
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .lock()
            .expect("handler table poisoned")
            .insert(
                protocol.to_string(),
                Arc::new(move |stream| Box::pin(handler(stream))),
            );
    }
}

#[async_trait]
impl Registrar for MockRegistrar {
    fn supports(&self, protocol: &str) -> bool {
        self.handlers
            .lock()
            .expect("handler table poisoned")
            .contains_key(protocol)
    }

    async fn deliver(&self, stream: Stream) {
        let handler = self
            .handlers
            .lock()
            .expect("handler table poisoned")
            .get(stream.protocol())
            .cloned();
        match handler {
            Some(handler) => {
                tokio::spawn(handler(stream));
            }
            None => warn!(protocol = stream.protocol(), "no handler for stream"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;

    fn muxer_pair() -> (Arc<FrameMuxer>, Arc<FrameMuxer>) {
        let (a, b) = MemoryChannel::pair();
        (
            FrameMuxer::new(Arc::new(a), true),
            FrameMuxer::new(Arc::new(b), false),
        )
    }

    #[tokio::test]
    async fn substreams_exchange_data_both_ways() {
        let (dialer, listener) = muxer_pair();

        let out = dialer.open_substream().await.unwrap();
        let inn = listener.next_substream().await.unwrap();

        out.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(inn.recv().await.unwrap(), Bytes::from_static(b"ping"));

        inn.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(out.recv().await.unwrap(), Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn substreams_are_independent() {
        let (dialer, listener) = muxer_pair();

        let out1 = dialer.open_substream().await.unwrap();
        let out2 = dialer.open_substream().await.unwrap();
        let in1 = listener.next_substream().await.unwrap();
        let in2 = listener.next_substream().await.unwrap();

        out2.send(Bytes::from_static(b"second")).await.unwrap();
        out1.send(Bytes::from_static(b"first")).await.unwrap();

        assert_eq!(in1.recv().await.unwrap(), Bytes::from_static(b"first"));
        assert_eq!(in2.recv().await.unwrap(), Bytes::from_static(b"second"));
    }

    #[tokio::test]
    async fn fin_delivers_buffered_data_then_eof() {
        let (dialer, listener) = muxer_pair();

        let out = dialer.open_substream().await.unwrap();
        let inn = listener.next_substream().await.unwrap();

        out.send(Bytes::from_static(b"tail")).await.unwrap();
        out.close_write().await;

        assert_eq!(inn.recv().await.unwrap(), Bytes::from_static(b"tail"));
        assert!(inn.recv().await.is_none());

        // Reads are done, but the reverse direction still works.
        inn.send(Bytes::from_static(b"back")).await.unwrap();
        assert_eq!(out.recv().await.unwrap(), Bytes::from_static(b"back"));
    }

    #[tokio::test]
    async fn write_after_close_write_fails() {
        let (dialer, _listener) = muxer_pair();

        let out = dialer.open_substream().await.unwrap();
        out.close_write().await;
        assert!(matches!(
            out.send(Bytes::from_static(b"late")).await,
            Err(TransportError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn muxer_close_terminates_substreams() {
        let (dialer, listener) = muxer_pair();

        let out = dialer.open_substream().await.unwrap();
        let inn = listener.next_substream().await.unwrap();

        dialer.close().await;

        assert!(inn.recv().await.is_none());
        assert!(out.recv().await.is_none());
        assert!(listener.next_substream().await.is_none());
    }
}
