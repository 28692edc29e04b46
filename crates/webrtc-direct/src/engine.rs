//! Channel-establishment boundary.
//!
//! The transport never touches ICE or DTLS directly: an engine turns an
//! offer/answer exchange into an open [`ByteChannel`]. Sessions are keyed so
//! a dial that is abandoned mid-handshake can release its resources.

use crate::channel::{ByteChannel, MemoryChannel};
use crate::TransportError;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Establishes raw channels from session-description exchanges.
///
/// Outbound: `create_offer` → (signaling round trip) → `complete`.
/// Inbound: `accept` → (answer returned to the dialer) → `open_inbound`.
/// A session that will not proceed must be released with `abort`.
#[async_trait]
pub trait ChannelEngine: Send + Sync {
    /// Start an outbound session. Returns the session key and the local
    /// offer description.
    async fn create_offer(&self) -> Result<(String, String), TransportError>;

    /// Apply the remote answer to a pending outbound session and wait for
    /// the channel to open.
    async fn complete(
        &self,
        session: &str,
        answer_sdp: &str,
    ) -> Result<Arc<dyn ByteChannel>, TransportError>;

    /// Answer an inbound offer. Returns the session key and the local
    /// answer description.
    async fn accept(&self, offer_sdp: &str) -> Result<(String, String), TransportError>;

    /// Wait for an accepted inbound session's channel to open.
    async fn open_inbound(&self, session: &str) -> Result<Arc<dyn ByteChannel>, TransportError>;

    /// Drop a pending session and release its transport resources.
    async fn abort(&self, session: &str);
}

/// Rendezvous hub linking the two ends of in-memory "dials".
///
/// Engines on both sides must be created from the same hub; there is no
/// process-wide registry. Offers and answers are opaque tokens, so the full
/// signaling path (HTTP included) is exercised unchanged.
pub struct MemoryNet {
    rendezvous: Mutex<HashMap<String, Arc<MemoryChannel>>>,
}

impl MemoryNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rendezvous: Mutex::new(HashMap::new()),
        })
    }

    /// Create an engine attached to this hub.
    pub fn engine(self: &Arc<Self>) -> Arc<MemoryEngine> {
        Arc::new(MemoryEngine {
            net: self.clone(),
            outbound: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
        })
    }
}

const MEMORY_SDP_PREFIX: &str = "memory:";

fn memory_token(sdp: &str) -> Result<&str, TransportError> {
    sdp.strip_prefix(MEMORY_SDP_PREFIX).ok_or_else(|| {
        TransportError::Signaling(format!("not a memory session description: {sdp}"))
    })
}

/// In-memory [`ChannelEngine`] for tests and simulation.
pub struct MemoryEngine {
    net: Arc<MemoryNet>,
    outbound: Mutex<HashMap<String, Arc<MemoryChannel>>>,
    inbound: Mutex<HashMap<String, Arc<MemoryChannel>>>,
}

#[async_trait]
impl ChannelEngine for MemoryEngine {
    async fn create_offer(&self) -> Result<(String, String), TransportError> {
        let (local, remote) = MemoryChannel::pair();
        let session = Uuid::new_v4().to_string();
        self.outbound
            .lock()
            .await
            .insert(session.clone(), Arc::new(local));
        self.net
            .rendezvous
            .lock()
            .await
            .insert(session.clone(), Arc::new(remote));
        let offer = format!("{MEMORY_SDP_PREFIX}{session}");
        Ok((session, offer))
    }

    async fn complete(
        &self,
        session: &str,
        answer_sdp: &str,
    ) -> Result<Arc<dyn ByteChannel>, TransportError> {
        let token = memory_token(answer_sdp)?;
        let channel = self.outbound.lock().await.remove(session).ok_or_else(|| {
            TransportError::Signaling(format!("unknown outbound session {session}"))
        })?;
        if token != session {
            channel.close().await;
            return Err(TransportError::Signaling(format!(
                "answer for session {token} does not match {session}"
            )));
        }
        Ok(channel)
    }

    async fn accept(&self, offer_sdp: &str) -> Result<(String, String), TransportError> {
        let token = memory_token(offer_sdp)?;
        let channel = self
            .net
            .rendezvous
            .lock()
            .await
            .remove(token)
            .ok_or_else(|| {
                TransportError::Signaling(format!("no pending offer for session {token}"))
            })?;
        let session = Uuid::new_v4().to_string();
        self.inbound.lock().await.insert(session.clone(), channel);
        let answer = format!("{MEMORY_SDP_PREFIX}{token}");
        Ok((session, answer))
    }

    async fn open_inbound(&self, session: &str) -> Result<Arc<dyn ByteChannel>, TransportError> {
        let channel = self.inbound.lock().await.remove(session).ok_or_else(|| {
            TransportError::Signaling(format!("unknown inbound session {session}"))
        })?;
        Ok(channel)
    }

    async fn abort(&self, session: &str) {
        if let Some(channel) = self.outbound.lock().await.remove(session) {
            channel.close().await;
        }
        if let Some(channel) = self.net.rendezvous.lock().await.remove(session) {
            channel.close().await;
        }
        if let Some(channel) = self.inbound.lock().await.remove(session) {
            channel.close().await;
        }
    }
}
