use crate::channel::ByteChannel;
use crate::stream::Stream;
use crate::upgrader::{Registrar, StreamMuxer};
use crate::{PeerId, TransportError};

use bytes::Bytes;
use multiaddr::Multiaddr;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Reply sent when a proposed protocol has no handler.
const PROTOCOL_NA: &[u8] = b"na";

/// Locally generated connection identity, stable for the connection's
/// lifetime. Two dials to the same address always get distinct ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    remote_addr: Multiaddr,
    remote_peer: Option<PeerId>,
    muxer: Arc<dyn StreamMuxer>,
    /// Live streams, keyed by a monotonically allocated local id. Streams
    /// hold only a `Weak` handle back here.
    streams: Mutex<HashMap<u64, Arc<dyn ByteChannel>>>,
    next_stream_id: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionInner {
    pub(crate) fn release_stream(&self, id: u64) {
        self.streams.lock().expect("stream table poisoned").remove(&id);
    }

    fn register_stream(&self, channel: Arc<dyn ByteChannel>) -> u64 {
        let id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        self.streams
            .lock()
            .expect("stream table poisoned")
            .insert(id, channel);
        id
    }
}

/// One peer session: issues multiplexed streams on demand and tears all of
/// them down on close.
///
/// Cloning yields another handle to the same session. Connections are never
/// deduplicated: dialing one address twice produces two fully independent
/// sessions with disjoint stream-id spaces.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap an upgraded muxer into a connection. Called by upgraders.
    pub fn new(
        muxer: Arc<dyn StreamMuxer>,
        remote_addr: Multiaddr,
        remote_peer: Option<PeerId>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::random(),
                remote_addr,
                remote_peer,
                muxer,
                streams: Mutex::new(HashMap::new()),
                next_stream_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.inner.remote_addr
    }

    pub fn remote_peer(&self) -> Option<&PeerId> {
        self.inner.remote_peer.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Open a new stream, negotiating the first protocol the remote accepts.
    ///
    /// Protocol ids are proposed in the given order; if the remote declines
    /// them all the call fails with
    /// [`TransportError::NegotiationFailed`]. Racing with `close` either
    /// fails with [`TransportError::ConnectionClosed`] or returns a stream
    /// that strictly preceded the close.
    pub async fn new_stream(&self, protocols: &[&str]) -> Result<Stream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        if protocols.is_empty() {
            return Err(TransportError::NegotiationFailed(Vec::new()));
        }

        let substream = self
            .inner
            .muxer
            .open_substream()
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        let protocol = match negotiate_outbound(&*substream, protocols).await {
            Ok(protocol) => protocol,
            Err(e) => {
                substream.close().await;
                return Err(e);
            }
        };

        if self.is_closed() {
            substream.close().await;
            return Err(TransportError::ConnectionClosed);
        }

        let id = self.inner.register_stream(substream.clone());
        debug!(conn = %self.inner.id, stream = id, %protocol, "opened outbound stream");
        Ok(Stream::new(
            id,
            protocol,
            substream,
            Arc::downgrade(&self.inner),
        ))
    }

    /// Close the connection: force-close every open stream, then the muxer.
    ///
    /// Idempotent. Visible to all stream holders without coordination —
    /// their reads terminate and their writes fail rather than hang.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(conn = %self.inner.id, "closing connection");
        let channels: Vec<Arc<dyn ByteChannel>> = {
            let mut streams = self.inner.streams.lock().expect("stream table poisoned");
            streams.drain().map(|(_, channel)| channel).collect()
        };
        for channel in channels {
            channel.close().await;
        }
        self.inner.muxer.close().await;
    }

    /// Start serving inbound streams: each accepted substream is negotiated
    /// against `registrar` and delivered to its handler. The loop ends when
    /// the muxer does.
    pub fn serve(&self, registrar: Arc<dyn Registrar>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let Some(substream) = inner.muxer.next_substream().await else {
                    break;
                };
                if inner.closed.load(Ordering::SeqCst) {
                    substream.close().await;
                    continue;
                }
                let inner = inner.clone();
                let registrar = registrar.clone();
                tokio::spawn(async move {
                    accept_stream(inner, registrar, substream).await;
                });
            }
            debug!("inbound stream loop finished");
        });
    }
}

async fn accept_stream(
    inner: Arc<ConnectionInner>,
    registrar: Arc<dyn Registrar>,
    substream: Arc<dyn ByteChannel>,
) {
    let Some(protocol) = negotiate_inbound(&*substream, &*registrar).await else {
        substream.close().await;
        return;
    };
    if inner.closed.load(Ordering::SeqCst) {
        substream.close().await;
        return;
    }
    let id = inner.register_stream(substream.clone());
    debug!(conn = %inner.id, stream = id, %protocol, "accepted inbound stream");
    let stream = Stream::new(id, protocol, substream, Arc::downgrade(&inner));
    registrar.deliver(stream).await;
}

/// Dial side of per-stream negotiation: propose each id in order, take the
/// first the remote echoes back.
async fn negotiate_outbound(
    channel: &dyn ByteChannel,
    protocols: &[&str],
) -> Result<String, TransportError> {
    for protocol in protocols {
        channel
            .send(Bytes::copy_from_slice(protocol.as_bytes()))
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;
        match channel.recv().await {
            Some(reply) if reply.as_ref() == protocol.as_bytes() => {
                return Ok((*protocol).to_string())
            }
            Some(reply) if reply.as_ref() == PROTOCOL_NA => continue,
            Some(reply) => {
                warn!(?reply, "unexpected negotiation reply");
                return Err(TransportError::NegotiationFailed(
                    protocols.iter().map(|p| p.to_string()).collect(),
                ));
            }
            None => return Err(TransportError::ConnectionClosed),
        }
    }
    Err(TransportError::NegotiationFailed(
        protocols.iter().map(|p| p.to_string()).collect(),
    ))
}

/// Listen side of per-stream negotiation: echo the first supported
/// proposal, decline the rest.
async fn negotiate_inbound(
    channel: &dyn ByteChannel,
    registrar: &dyn Registrar,
) -> Option<String> {
    loop {
        let proposal = channel.recv().await?;
        let Ok(protocol) = std::str::from_utf8(&proposal) else {
            warn!("non-utf8 protocol proposal");
            return None;
        };
        if registrar.supports(protocol) {
            let protocol = protocol.to_string();
            channel.send(proposal).await.ok()?;
            return Some(protocol);
        }
        channel.send(Bytes::from_static(PROTOCOL_NA)).await.ok()?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryChannel;
    use async_trait::async_trait;

    struct StaticRegistrar(Vec<String>);

    #[async_trait]
    impl Registrar for StaticRegistrar {
        fn supports(&self, protocol: &str) -> bool {
            self.0.iter().any(|p| p == protocol)
        }

        async fn deliver(&self, _stream: Stream) {}
    }

    #[tokio::test]
    async fn negotiation_takes_first_supported_protocol() {
        let (dialer, listener) = MemoryChannel::pair();
        let registrar = StaticRegistrar(vec!["/echo/1.0.0".to_string()]);

        let listen = tokio::spawn(async move {
            let protocol = negotiate_inbound(&listener, &registrar).await;
            (listener, protocol)
        });

        let negotiated = negotiate_outbound(&dialer, &["/nope/1.0.0", "/echo/1.0.0"])
            .await
            .unwrap();
        assert_eq!(negotiated, "/echo/1.0.0");

        let (_listener, protocol) = listen.await.unwrap();
        assert_eq!(protocol.as_deref(), Some("/echo/1.0.0"));
    }

    #[tokio::test]
    async fn negotiation_fails_when_nothing_matches() {
        let (dialer, listener) = MemoryChannel::pair();
        let registrar = StaticRegistrar(vec!["/other/1.0.0".to_string()]);

        let listen = tokio::spawn(async move {
            let _ = negotiate_inbound(&listener, &registrar).await;
            listener
        });

        let result = negotiate_outbound(&dialer, &["/nope/1.0.0", "/missing/2.0.0"]).await;
        match result {
            Err(TransportError::NegotiationFailed(proposed)) => {
                assert_eq!(proposed, vec!["/nope/1.0.0", "/missing/2.0.0"]);
            }
            other => panic!("expected NegotiationFailed, got {other:?}"),
        }

        dialer.close().await;
        let _ = listen.await;
    }
}
