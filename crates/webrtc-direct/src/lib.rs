//! WebRTC-direct transport.
//!
//! Dials a remote peer by exchanging session-description signaling over a
//! plain HTTP endpoint, then exposes the resulting data channel as a
//! multiplexed, protocol-negotiated set of duplex byte streams.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use webrtc_direct::{MockRegistrar, MockUpgrader, TransportConfig, WebRtcDirect};
//!
//! # async fn example() -> Result<(), webrtc_direct::TransportError> {
//! let transport = WebRtcDirect::new(TransportConfig::new())?;
//!
//! let registrar = MockRegistrar::new();
//! let upgrader = MockUpgrader::new(registrar);
//!
//! let addr = "/ip4/127.0.0.1/tcp/12345/http/p2p-webrtc-direct".parse().unwrap();
//! let conn = transport.dial(&addr, upgrader).await?;
//!
//! let stream = conn.new_stream(&["/echo/1.0.0"]).await?;
//! stream.write(b"some data").await?;
//! stream.close_write().await;
//! let echoed = stream.read_to_end().await;
//! println!("echoed {} bytes", echoed.len());
//!
//! conn.close().await;
//! # Ok(())
//! # }
//! ```

mod addr;
mod channel;
mod config;
mod connection;
mod engine;
mod error;
mod listener;
mod mock;
mod signaling;
mod stream;
mod transport;
mod upgrader;
mod webrtc;

pub use addr::ResolvedAddress;
pub use channel::{ByteChannel, MemoryChannel};
pub use config::TransportConfig;
pub use connection::{Connection, ConnectionId};
pub use engine::{ChannelEngine, MemoryEngine, MemoryNet};
pub use error::TransportError;
pub use listener::SignalingListener;
pub use mock::{FrameMuxer, MockRegistrar, MockUpgrader};
pub use signaling::{SignalPayload, SignalingClient};
pub use stream::Stream;
pub use transport::WebRtcDirect;
pub use upgrader::{Registrar, StreamMuxer, Upgrader};
pub use crate::webrtc::WebRtcEngine;

// Re-export the address types callers hand to `dial` and `listen`.
pub use multiaddr::{Multiaddr, Protocol};

use multiaddr::multihash::Multihash;
use std::fmt;
use std::str::FromStr;

/// Remote peer identity — the multihash carried by a `/p2p/` address
/// component. Displayed and parsed as a hex string.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerId(Multihash<64>);

impl PeerId {
    /// Create from the multihash of a `/p2p/` address component.
    pub fn from_multihash(hash: Multihash<64>) -> Self {
        Self(hash)
    }

    /// Access the underlying multihash.
    pub fn as_multihash(&self) -> &Multihash<64> {
        &self.0
    }

    /// The raw multihash bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_bytes()))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let full = hex::encode(self.0.to_bytes());
        let short = if full.len() > 12 { &full[..12] } else { &full };
        write!(f, "PeerId({short}...)")
    }
}

impl FromStr for PeerId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|_| TransportError::InvalidAddress(format!("invalid peer id: {s}")))?;
        let hash = Multihash::from_bytes(&bytes)
            .map_err(|_| TransportError::InvalidAddress(format!("invalid peer id: {s}")))?;
        Ok(Self(hash))
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_peer() -> PeerId {
        let hash = Multihash::wrap(0x12, &[7u8; 32]).unwrap();
        PeerId::from_multihash(hash)
    }

    #[test]
    fn peer_id_hex_round_trip() {
        let peer = sample_peer();
        let text = peer.to_string();
        let parsed: PeerId = text.parse().unwrap();
        assert_eq!(peer, parsed);
    }

    #[test]
    fn peer_id_rejects_garbage() {
        assert!("not hex".parse::<PeerId>().is_err());
        assert!("abcd".parse::<PeerId>().is_err());
    }

    #[test]
    fn peer_id_debug_is_short() {
        let rendered = format!("{:?}", sample_peer());
        assert!(rendered.starts_with("PeerId("));
        assert!(rendered.len() < 30);
    }
}
