//! Channel engine backed by the `webrtc` crate.
//!
//! Non-trickle negotiation: descriptions are published only after ICE
//! gathering completes, so one offer/answer round trip carries everything
//! the peers need.

use crate::channel::ByteChannel;
use crate::engine::ChannelEngine;
use crate::{TransportConfig, TransportError};

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

const DATA_CHANNEL_LABEL: &str = "data";

/// Hook a data channel's callbacks into async-side plumbing. Must run
/// before any message can arrive, or chunks would be lost.
fn wire_data_channel(
    dc: &Arc<RTCDataChannel>,
) -> (
    mpsc::UnboundedReceiver<Bytes>,
    oneshot::Receiver<()>,
    CancellationToken,
) {
    let (msg_tx, msg_rx) = mpsc::unbounded_channel();
    let (open_tx, open_rx) = oneshot::channel();
    let cancel = CancellationToken::new();

    let mut open_tx = Some(open_tx);
    dc.on_open(Box::new(move || {
        if let Some(tx) = open_tx.take() {
            let _ = tx.send(());
        }
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let _ = msg_tx.send(msg.data);
        Box::pin(async {})
    }));

    let close_cancel = cancel.clone();
    dc.on_close(Box::new(move || {
        close_cancel.cancel();
        Box::pin(async {})
    }));

    (msg_rx, open_rx, cancel)
}

/// [`ByteChannel`] over an open WebRTC data channel.
struct WebRtcChannel {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
    rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    cancel: CancellationToken,
    write_closed: AtomicBool,
}

#[async_trait]
impl ByteChannel for WebRtcChannel {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() || self.write_closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelClosed);
        }
        self.dc
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::ChannelClosed)
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
        // SCTP data channels have no half-close on the wire; stop our
        // output locally.
        self.write_closed.store(true, Ordering::SeqCst);
    }

    async fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let _ = self.dc.close().await;
        let _ = self.pc.close().await;
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

struct InboundParts {
    dc: Arc<RTCDataChannel>,
    msg_rx: mpsc::UnboundedReceiver<Bytes>,
    open_rx: oneshot::Receiver<()>,
    cancel: CancellationToken,
}

enum PendingSession {
    Outbound {
        pc: Arc<RTCPeerConnection>,
        dc: Arc<RTCDataChannel>,
        msg_rx: mpsc::UnboundedReceiver<Bytes>,
        open_rx: oneshot::Receiver<()>,
        cancel: CancellationToken,
    },
    Inbound {
        pc: Arc<RTCPeerConnection>,
        parts_rx: mpsc::Receiver<InboundParts>,
    },
}

impl PendingSession {
    async fn release(self) {
        match self {
            PendingSession::Outbound { pc, .. } => {
                let _ = pc.close().await;
            }
            PendingSession::Inbound { pc, .. } => {
                let _ = pc.close().await;
            }
        }
    }
}

/// Production [`ChannelEngine`] over `webrtc` peer connections.
pub struct WebRtcEngine {
    ice_servers: Vec<String>,
    open_timeout: Duration,
    sessions: Mutex<HashMap<String, PendingSession>>,
}

impl WebRtcEngine {
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            open_timeout: config.channel_open_timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let api = APIBuilder::new().build();
        let mut rtc_config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            rtc_config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }
        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| TransportError::Signaling(format!("peer connection: {e}")))?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl ChannelEngine for WebRtcEngine {
    async fn create_offer(&self) -> Result<(String, String), TransportError> {
        let pc = self.new_peer_connection().await?;
        let dc = match pc.create_data_channel(DATA_CHANNEL_LABEL, None).await {
            Ok(dc) => dc,
            Err(e) => {
                let _ = pc.close().await;
                return Err(TransportError::Signaling(format!("data channel: {e}")));
            }
        };
        let (msg_rx, open_rx, cancel) = wire_data_channel(&dc);

        let local_sdp = async {
            let offer = pc
                .create_offer(None)
                .await
                .map_err(|e| TransportError::Signaling(format!("create offer: {e}")))?;
            let mut gathered = pc.gathering_complete_promise().await;
            pc.set_local_description(offer)
                .await
                .map_err(|e| TransportError::Signaling(format!("local description: {e}")))?;
            let _ = gathered.recv().await;
            pc.local_description()
                .await
                .map(|desc| desc.sdp)
                .ok_or_else(|| TransportError::Signaling("no local description".to_string()))
        }
        .await;

        let sdp = match local_sdp {
            Ok(sdp) => sdp,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e);
            }
        };

        let session = Uuid::new_v4().to_string();
        self.sessions.lock().await.insert(
            session.clone(),
            PendingSession::Outbound {
                pc,
                dc,
                msg_rx,
                open_rx,
                cancel,
            },
        );
        Ok((session, sdp))
    }

    async fn complete(
        &self,
        session: &str,
        answer_sdp: &str,
    ) -> Result<Arc<dyn ByteChannel>, TransportError> {
        let pending = self.sessions.lock().await.remove(session);
        let (pc, dc, msg_rx, open_rx, cancel) = match pending {
            Some(PendingSession::Outbound {
                pc,
                dc,
                msg_rx,
                open_rx,
                cancel,
            }) => (pc, dc, msg_rx, open_rx, cancel),
            Some(other) => {
                other.release().await;
                return Err(TransportError::Signaling(format!(
                    "session {session} is not outbound"
                )));
            }
            None => {
                return Err(TransportError::Signaling(format!(
                    "unknown outbound session {session}"
                )))
            }
        };

        let answer = match RTCSessionDescription::answer(answer_sdp.to_string()) {
            Ok(answer) => answer,
            Err(e) => {
                let _ = pc.close().await;
                return Err(TransportError::Signaling(format!("unusable answer: {e}")));
            }
        };
        if let Err(e) = pc.set_remote_description(answer).await {
            let _ = pc.close().await;
            return Err(TransportError::Signaling(format!(
                "remote description: {e}"
            )));
        }

        match tokio::time::timeout(self.open_timeout, open_rx).await {
            Ok(Ok(())) => Ok(Arc::new(WebRtcChannel {
                pc,
                dc,
                rx: Mutex::new(msg_rx),
                cancel,
                write_closed: AtomicBool::new(false),
            })),
            Ok(Err(_)) => {
                let _ = pc.close().await;
                Err(TransportError::Signaling(
                    "data channel closed before opening".to_string(),
                ))
            }
            Err(_) => {
                let _ = pc.close().await;
                Err(TransportError::DialTimeout(self.open_timeout))
            }
        }
    }

    async fn accept(&self, offer_sdp: &str) -> Result<(String, String), TransportError> {
        let pc = self.new_peer_connection().await?;

        let (parts_tx, parts_rx) = mpsc::channel(1);
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let parts_tx = parts_tx.clone();
            Box::pin(async move {
                let (msg_rx, open_rx, cancel) = wire_data_channel(&dc);
                let _ = parts_tx
                    .send(InboundParts {
                        dc,
                        msg_rx,
                        open_rx,
                        cancel,
                    })
                    .await;
            })
        }));

        let local_sdp = async {
            let offer = RTCSessionDescription::offer(offer_sdp.to_string())
                .map_err(|e| TransportError::Signaling(format!("unusable offer: {e}")))?;
            pc.set_remote_description(offer)
                .await
                .map_err(|e| TransportError::Signaling(format!("remote description: {e}")))?;
            let answer = pc
                .create_answer(None)
                .await
                .map_err(|e| TransportError::Signaling(format!("create answer: {e}")))?;
            let mut gathered = pc.gathering_complete_promise().await;
            pc.set_local_description(answer)
                .await
                .map_err(|e| TransportError::Signaling(format!("local description: {e}")))?;
            let _ = gathered.recv().await;
            pc.local_description()
                .await
                .map(|desc| desc.sdp)
                .ok_or_else(|| TransportError::Signaling("no local description".to_string()))
        }
        .await;

        let sdp = match local_sdp {
            Ok(sdp) => sdp,
            Err(e) => {
                let _ = pc.close().await;
                return Err(e);
            }
        };

        let session = Uuid::new_v4().to_string();
        self.sessions
            .lock()
            .await
            .insert(session.clone(), PendingSession::Inbound { pc, parts_rx });
        Ok((session, sdp))
    }

    async fn open_inbound(&self, session: &str) -> Result<Arc<dyn ByteChannel>, TransportError> {
        let pending = self.sessions.lock().await.remove(session);
        let (pc, mut parts_rx) = match pending {
            Some(PendingSession::Inbound { pc, parts_rx }) => (pc, parts_rx),
            Some(other) => {
                other.release().await;
                return Err(TransportError::Signaling(format!(
                    "session {session} is not inbound"
                )));
            }
            None => {
                return Err(TransportError::Signaling(format!(
                    "unknown inbound session {session}"
                )))
            }
        };

        let parts = match tokio::time::timeout(self.open_timeout, parts_rx.recv()).await {
            Ok(Some(parts)) => parts,
            Ok(None) => {
                let _ = pc.close().await;
                return Err(TransportError::Signaling(
                    "peer connection closed before a data channel arrived".to_string(),
                ));
            }
            Err(_) => {
                let _ = pc.close().await;
                return Err(TransportError::DialTimeout(self.open_timeout));
            }
        };

        match tokio::time::timeout(self.open_timeout, parts.open_rx).await {
            Ok(Ok(())) => Ok(Arc::new(WebRtcChannel {
                pc,
                dc: parts.dc,
                rx: Mutex::new(parts.msg_rx),
                cancel: parts.cancel,
                write_closed: AtomicBool::new(false),
            })),
            Ok(Err(_)) => {
                let _ = pc.close().await;
                Err(TransportError::Signaling(
                    "data channel closed before opening".to_string(),
                ))
            }
            Err(_) => {
                let _ = pc.close().await;
                Err(TransportError::DialTimeout(self.open_timeout))
            }
        }
    }

    async fn abort(&self, session: &str) {
        if let Some(pending) = self.sessions.lock().await.remove(session) {
            pending.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_sessions_are_rejected() {
        let engine = WebRtcEngine::new(&TransportConfig::new());
        assert!(matches!(
            engine.complete("nope", "v=0").await,
            Err(TransportError::Signaling(_))
        ));
        assert!(matches!(
            engine.open_inbound("nope").await,
            Err(TransportError::Signaling(_))
        ));
        // Aborting a session that never existed is a no-op.
        engine.abort("nope").await;
    }
}
