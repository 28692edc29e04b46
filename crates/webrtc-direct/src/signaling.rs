use crate::addr::ResolvedAddress;
use crate::engine::ChannelEngine;
use crate::{ByteChannel, PeerId, TransportConfig, TransportError};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Signaling wire payload: one offer up, one answer back.
///
/// The answer may assert the listener's identity; dialers that resolved a
/// `/p2p/` component verify it before completing the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<PeerId>,
}

impl SignalPayload {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: "offer".to_string(),
            sdp,
            peer_id: None,
        }
    }

    pub fn answer(sdp: String, peer_id: Option<PeerId>) -> Self {
        Self {
            kind: "answer".to_string(),
            sdp,
            peer_id,
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == "offer"
    }

    pub fn is_answer(&self) -> bool {
        self.kind == "answer"
    }
}

/// Performs the HTTP offer/answer exchange against a resolved endpoint.
///
/// Strict two-step handshake, no retries: a failed exchange is terminal for
/// the dial that issued it.
pub struct SignalingClient {
    client: reqwest::Client,
    path: String,
    connect_timeout: Duration,
}

impl SignalingClient {
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::Signaling(format!("http client: {e}")))?;
        Ok(Self {
            client,
            path: config.signaling_path.clone(),
            connect_timeout: config.connect_timeout,
        })
    }

    /// Open a raw channel to the resolved endpoint: create the local offer,
    /// exchange it over HTTP, apply the answer. Any failure after the engine
    /// allocated a session aborts that session before surfacing.
    pub async fn open(
        &self,
        resolved: &ResolvedAddress,
        engine: &dyn ChannelEngine,
    ) -> Result<Arc<dyn ByteChannel>, TransportError> {
        let (session, offer_sdp) = engine.create_offer().await?;

        let answer = match self.exchange(resolved, offer_sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                engine.abort(&session).await;
                return Err(e);
            }
        };

        if let (Some(expected), Some(asserted)) =
            (resolved.remote_peer.as_ref(), answer.peer_id.as_ref())
        {
            if expected != asserted {
                engine.abort(&session).await;
                return Err(TransportError::Signaling(format!(
                    "peer identity mismatch: expected {expected}, remote asserted {asserted}"
                )));
            }
        }

        engine.complete(&session, &answer.sdp).await
    }

    async fn exchange(
        &self,
        resolved: &ResolvedAddress,
        offer_sdp: String,
    ) -> Result<SignalPayload, TransportError> {
        let url = resolved.signaling_url(&self.path);
        debug!(%url, "sending session offer");

        let response = self
            .client
            .post(&url)
            .json(&SignalPayload::offer(offer_sdp))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Signaling(format!(
                "signaling endpoint returned {status}"
            )));
        }

        let answer: SignalPayload = response
            .json()
            .await
            .map_err(|e| TransportError::Signaling(format!("unreadable answer: {e}")))?;
        if !answer.is_answer() || answer.sdp.is_empty() {
            return Err(TransportError::Signaling(format!(
                "expected a session answer, got {:?}",
                answer.kind
            )));
        }
        debug!(%url, "received session answer");
        Ok(answer)
    }

    fn classify(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::DialTimeout(self.connect_timeout)
        } else if e.is_connect() {
            TransportError::ConnectionRefused(e.to_string())
        } else {
            TransportError::Signaling(e.to_string())
        }
    }
}
