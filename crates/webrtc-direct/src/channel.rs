//! Raw duplex byte channels.
//!
//! The dial pipeline produces a channel of plain byte chunks with no framing
//! or protocol awareness; the upgrader turns it into a multiplexed
//! connection. Implementations: WebRTC data channels (production) and
//! in-memory pairs (tests/simulation).

use crate::TransportError;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// A duplex, message-oriented byte channel.
///
/// `recv` yields a lazy, finite, non-restartable sequence of chunks; `None`
/// marks its end. `close` is idempotent and safe to call from either end
/// concurrently with in-flight reads or writes: pending reads terminate the
/// sequence, pending and subsequent writes fail with
/// [`TransportError::ChannelClosed`].
#[async_trait]
pub trait ByteChannel: Send + Sync {
    /// Send one chunk to the peer.
    async fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Receive the next chunk from the peer. `None` means end of stream.
    async fn recv(&self) -> Option<Bytes>;

    /// Half-close: signal end-of-input to the peer's read side. Chunks sent
    /// before the half-close are still delivered, in order and in full.
    async fn close_write(&self);

    /// Hard close of both directions.
    async fn close(&self);

    /// Whether the channel has been hard-closed.
    fn is_closed(&self) -> bool;
}

/// In-memory channel pair over mpsc queues.
pub struct MemoryChannel {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
    cancel: CancellationToken,
}

impl MemoryChannel {
    const CAPACITY: usize = 64;

    /// Create a connected pair. Hard-closing either end closes both.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(Self::CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(Self::CAPACITY);
        let cancel = CancellationToken::new();

        let a = Self {
            tx: Mutex::new(Some(tx_b)),
            rx: Mutex::new(rx_a),
            cancel: cancel.clone(),
        };
        let b = Self {
            tx: Mutex::new(Some(tx_a)),
            rx: Mutex::new(rx_b),
            cancel,
        };
        (a, b)
    }
}

#[async_trait]
impl ByteChannel for MemoryChannel {
    async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::ChannelClosed);
        }
        // Clone out of the lock so a blocked send cannot hold up close().
        let tx = self.tx.lock().await.clone();
        let Some(tx) = tx else {
            return Err(TransportError::ChannelClosed);
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::ChannelClosed),
            sent = tx.send(data) => sent.map_err(|_| TransportError::ChannelClosed),
        }
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
        self.tx.lock().await.take();
    }

    async fn close(&self) {
        self.tx.lock().await.take();
        self.cancel.cancel();
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_both_directions() {
        let (a, b) = MemoryChannel::pair();

        a.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"hello"));

        b.send(Bytes::from_static(b"world")).await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"world"));
    }

    #[tokio::test]
    async fn close_write_delivers_buffered_then_eof() {
        let (a, b) = MemoryChannel::pair();

        a.send(Bytes::from_static(b"one")).await.unwrap();
        a.send(Bytes::from_static(b"two")).await.unwrap();
        a.close_write().await;

        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert!(b.recv().await.is_none());
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn close_terminates_pending_read() {
        let (a, b) = MemoryChannel::pair();

        let reader = tokio::spawn(async move {
            let chunk = b.recv().await;
            (b, chunk)
        });
        tokio::task::yield_now().await;
        a.close().await;

        let (_b, chunk) = reader.await.unwrap();
        assert!(chunk.is_none());
    }

    #[tokio::test]
    async fn close_fails_writes_on_both_ends() {
        let (a, b) = MemoryChannel::pair();
        b.close().await;
        b.close().await; // idempotent

        assert!(matches!(
            a.send(Bytes::from_static(b"x")).await,
            Err(TransportError::ChannelClosed)
        ));
        assert!(matches!(
            b.send(Bytes::from_static(b"x")).await,
            Err(TransportError::ChannelClosed)
        ));
        assert!(a.is_closed());
    }
}
