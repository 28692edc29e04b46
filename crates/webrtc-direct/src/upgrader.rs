use crate::channel::ByteChannel;
use crate::connection::Connection;
use crate::stream::Stream;
use crate::{PeerId, TransportError};

use async_trait::async_trait;
use multiaddr::Multiaddr;
use std::sync::Arc;

/// Security/mux capability: turns a raw channel into an upgraded
/// [`Connection`].
///
/// Caller-supplied and reusable across dials; the transport never mutates
/// it and hands each raw channel over exactly once. Implementations report
/// failure as [`TransportError::Upgrade`].
#[async_trait]
pub trait Upgrader: Send + Sync {
    /// Upgrade a channel we dialed. `remote_peer` is the identity hint from
    /// the dialed address, when one was present.
    async fn upgrade_outbound(
        &self,
        raw: Arc<dyn ByteChannel>,
        remote_addr: Multiaddr,
        remote_peer: Option<PeerId>,
    ) -> Result<Connection, TransportError>;

    /// Upgrade a channel a remote dialed to us.
    async fn upgrade_inbound(
        &self,
        raw: Arc<dyn ByteChannel>,
        remote_addr: Multiaddr,
    ) -> Result<Connection, TransportError>;
}

/// Stream multiplexer capability an upgrader builds a [`Connection`] on.
///
/// Substreams are plain byte channels; the connection layer handles
/// protocol negotiation and stream bookkeeping on top.
#[async_trait]
pub trait StreamMuxer: Send + Sync {
    /// Open an outbound substream.
    async fn open_substream(&self) -> Result<Arc<dyn ByteChannel>, TransportError>;

    /// Wait for the next inbound substream. `None` means the muxer is done.
    async fn next_substream(&self) -> Option<Arc<dyn ByteChannel>>;

    /// Close the muxer and its underlying channel.
    async fn close(&self);
}

/// Listening-side protocol registrar.
///
/// Inbound streams negotiated for a supported protocol are handed to
/// `deliver`; at least one negotiation per connection may be live at a time.
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Whether a handler is registered for `protocol`.
    fn supports(&self, protocol: &str) -> bool;

    /// Deliver a fully-negotiated inbound stream to its handler.
    async fn deliver(&self, stream: Stream);
}
