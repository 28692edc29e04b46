use crate::PeerId;
use std::time::Duration;

/// Configuration for a [`WebRtcDirect`](crate::WebRtcDirect) transport.
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use std::time::Duration;
/// use webrtc_direct::TransportConfig;
///
/// let config = TransportConfig::new()
///     .dial_timeout(Duration::from_secs(10))
///     .ice_server("stun:stun.l.google.com:19302");
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bound on the whole dial pipeline (resolve, signal, upgrade).
    pub(crate) dial_timeout: Duration,
    /// Bound on the HTTP offer/answer exchange.
    pub(crate) connect_timeout: Duration,
    /// Bound on data-channel establishment after the answer is applied.
    pub(crate) channel_open_timeout: Duration,
    /// Path the signaling endpoint is served on.
    pub(crate) signaling_path: String,
    /// ICE server URLs handed to the WebRTC engine. Empty by default:
    /// direct dialing needs no STUN/TURN to reach a routable host.
    pub(crate) ice_servers: Vec<String>,
    /// Identity asserted in signaling answers when listening.
    pub(crate) local_peer: Option<PeerId>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            channel_open_timeout: Duration::from_secs(10),
            signaling_path: "/signal".to_string(),
            ice_servers: Vec::new(),
            local_peer: None,
        }
    }

    /// Set the overall dial timeout (default: 30 s).
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Set the signaling exchange timeout (default: 10 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the data-channel open timeout (default: 10 s).
    pub fn channel_open_timeout(mut self, timeout: Duration) -> Self {
        self.channel_open_timeout = timeout;
        self
    }

    /// Set the HTTP path the signaling endpoint lives on (default: `/signal`).
    pub fn signaling_path(mut self, path: impl Into<String>) -> Self {
        self.signaling_path = path.into();
        self
    }

    /// Add an ICE server URL (`stun:` or `turn:`) for NAT traversal.
    pub fn ice_server(mut self, url: impl Into<String>) -> Self {
        self.ice_servers.push(url.into());
        self
    }

    /// Assert a local identity in signaling answers when listening.
    ///
    /// Dialers that carry a `/p2p/` component verify it against this value.
    pub fn local_peer(mut self, peer: PeerId) -> Self {
        self.local_peer = Some(peer);
        self
    }
}
