use crate::addr::{self, ResolvedAddress};
use crate::channel::ByteChannel;
use crate::engine::ChannelEngine;
use crate::listener::SignalingListener;
use crate::signaling::SignalingClient;
use crate::upgrader::{Registrar, Upgrader};
use crate::webrtc::WebRtcEngine;
use crate::{Connection, TransportConfig, TransportError};

use multiaddr::Multiaddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// The WebRTC-direct transport: dial a remote signaling endpoint, or listen
/// as one.
///
/// Dialing drives resolve → signal → upgrade and hands back an upgraded
/// [`Connection`]. Concurrent dials are fully independent — the transport
/// never shares or deduplicates channels between them.
pub struct WebRtcDirect {
    config: TransportConfig,
    engine: Arc<dyn ChannelEngine>,
    signaling: SignalingClient,
}

impl WebRtcDirect {
    /// Create a transport backed by the real WebRTC engine.
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let engine = Arc::new(WebRtcEngine::new(&config));
        Self::with_engine(config, engine)
    }

    /// Create a transport with a custom channel engine, e.g. a
    /// [`MemoryEngine`](crate::MemoryEngine) for tests.
    pub fn with_engine(
        config: TransportConfig,
        engine: Arc<dyn ChannelEngine>,
    ) -> Result<Self, TransportError> {
        let signaling = SignalingClient::new(&config)?;
        Ok(Self {
            config,
            engine,
            signaling,
        })
    }

    /// Dial `addr` and upgrade the resulting channel into a connection.
    ///
    /// The whole pipeline is bounded by the configured dial timeout; on
    /// expiry the in-flight step is cancelled and any partially built raw
    /// channel is closed before [`TransportError::DialTimeout`] surfaces.
    /// No retries: one call, one attempt, one outcome.
    pub async fn dial(
        &self,
        addr: &Multiaddr,
        upgrader: Arc<dyn Upgrader>,
    ) -> Result<Connection, TransportError> {
        let resolved = addr::resolve(addr)?;
        debug!(%addr, "dialing");

        let pending: Arc<Mutex<Option<Arc<dyn ByteChannel>>>> = Arc::new(Mutex::new(None));
        let pipeline = self.run_pipeline(addr, &resolved, upgrader, pending.clone());

        match tokio::time::timeout(self.config.dial_timeout, pipeline).await {
            Ok(result) => result,
            Err(_) => {
                // The pipeline future is dropped; release the raw channel
                // it may have produced before surfacing the failure.
                if let Some(raw) = pending.lock().await.take() {
                    raw.close().await;
                }
                warn!(%addr, timeout = ?self.config.dial_timeout, "dial timed out");
                Err(TransportError::DialTimeout(self.config.dial_timeout))
            }
        }
    }

    async fn run_pipeline(
        &self,
        addr: &Multiaddr,
        resolved: &ResolvedAddress,
        upgrader: Arc<dyn Upgrader>,
        pending: Arc<Mutex<Option<Arc<dyn ByteChannel>>>>,
    ) -> Result<Connection, TransportError> {
        let raw = self.signaling.open(resolved, &*self.engine).await?;
        *pending.lock().await = Some(raw.clone());

        match upgrader
            .upgrade_outbound(raw.clone(), addr.clone(), resolved.remote_peer.clone())
            .await
        {
            Ok(conn) => {
                pending.lock().await.take();
                debug!(conn = %conn.id(), %addr, "dial established");
                Ok(conn)
            }
            Err(e) => {
                pending.lock().await.take();
                raw.close().await;
                Err(e)
            }
        }
    }

    /// Listen on `addr`: serve the signaling endpoint, upgrade inbound
    /// channels, and dispatch their streams through `registrar`.
    pub async fn listen(
        &self,
        addr: &Multiaddr,
        upgrader: Arc<dyn Upgrader>,
        registrar: Arc<dyn Registrar>,
    ) -> Result<SignalingListener, TransportError> {
        let resolved = addr::resolve(addr)?;
        SignalingListener::bind(
            &self.config,
            resolved,
            self.engine.clone(),
            upgrader,
            registrar,
        )
        .await
    }
}
