use std::time::Duration;

/// Errors returned by the WebRTC-direct transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("dial timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("signaling endpoint refused connection: {0}")]
    ConnectionRefused(String),

    #[error("signaling exchange failed: {0}")]
    Signaling(String),

    #[error("connection upgrade failed: {0}")]
    Upgrade(#[source] anyhow::Error),

    #[error("protocol negotiation failed, proposed {0:?}")]
    NegotiationFailed(Vec<String>),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("stream is closed")]
    StreamClosed,

    #[error("channel is closed")]
    ChannelClosed,

    #[error("listener error: {0}")]
    Listen(#[source] std::io::Error),
}
