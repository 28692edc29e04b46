use crate::addr::ResolvedAddress;
use crate::connection::Connection;
use crate::engine::ChannelEngine;
use crate::signaling::SignalPayload;
use crate::upgrader::{Registrar, Upgrader};
use crate::{PeerId, TransportConfig, TransportError};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use multiaddr::{Multiaddr, Protocol};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct ListenerCtx {
    engine: Arc<dyn ChannelEngine>,
    upgrader: Arc<dyn Upgrader>,
    registrar: Arc<dyn Registrar>,
    conn_tx: mpsc::Sender<Connection>,
    path: String,
    local_peer: Option<PeerId>,
}

/// Listening side of the transport: an HTTP endpoint answering signaling
/// offers, plus the queue of connections upgraded from them.
pub struct SignalingListener {
    local_addr: SocketAddr,
    local_peer: Option<PeerId>,
    incoming: Mutex<mpsc::Receiver<Connection>>,
    cancel: CancellationToken,
}

impl SignalingListener {
    pub(crate) async fn bind(
        config: &TransportConfig,
        resolved: ResolvedAddress,
        engine: Arc<dyn ChannelEngine>,
        upgrader: Arc<dyn Upgrader>,
        registrar: Arc<dyn Registrar>,
    ) -> Result<Self, TransportError> {
        let socket = SocketAddr::new(resolved.host, resolved.port);
        let tcp = TcpListener::bind(socket)
            .await
            .map_err(TransportError::Listen)?;
        let local_addr = tcp.local_addr().map_err(TransportError::Listen)?;

        let (conn_tx, conn_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let local_peer = config.local_peer.clone();
        let ctx = Arc::new(ListenerCtx {
            engine,
            upgrader,
            registrar,
            conn_tx,
            path: config.signaling_path.clone(),
            local_peer: local_peer.clone(),
        });

        let accept_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = accept_cancel.cancelled() => break,
                    accepted = tcp.accept() => accepted,
                };
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let conn_cancel = accept_cancel.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| handle_signal(req, ctx.clone(), peer));
                    let serving = http1::Builder::new().serve_connection(io, service);
                    tokio::select! {
                        _ = conn_cancel.cancelled() => {}
                        result = serving => {
                            if let Err(e) = result {
                                debug!("http connection ended: {e}");
                            }
                        }
                    }
                });
            }
        });

        debug!(%local_addr, "signaling listener bound");
        Ok(Self {
            local_addr,
            local_peer,
            incoming: Mutex::new(conn_rx),
            cancel,
        })
    }

    /// The bound socket address; reflects the actual port for port-0 binds.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The multiaddr remote peers dial to reach this listener.
    pub fn local_multiaddr(&self) -> Multiaddr {
        let mut addr = Multiaddr::from(self.local_addr.ip())
            .with(Protocol::Tcp(self.local_addr.port()))
            .with(Protocol::Http)
            .with(Protocol::P2pWebRtcDirect);
        if let Some(peer) = &self.local_peer {
            let p2p_peer = multiaddr::PeerId::try_from(peer.as_multihash().to_owned())
                .expect("local peer multihash is a valid peer id");
            addr = addr.with(Protocol::P2p(p2p_peer));
        }
        addr
    }

    /// Wait for the next accepted, upgraded connection.
    pub async fn accept(&self) -> Option<Connection> {
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            conn = incoming.recv() => conn,
        }
    }

    /// Stop serving. The socket is released; in-flight sessions are dropped.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for SignalingListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn handle_signal(
    req: Request<Incoming>,
    ctx: Arc<ListenerCtx>,
    peer: SocketAddr,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::POST || req.uri().path() != ctx.path {
        return Ok(plain_status(StatusCode::NOT_FOUND));
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(%peer, "unreadable signaling body: {e}");
            return Ok(plain_status(StatusCode::BAD_REQUEST));
        }
    };
    let offer: SignalPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(%peer, "malformed signaling payload: {e}");
            return Ok(plain_status(StatusCode::BAD_REQUEST));
        }
    };
    if !offer.is_offer() {
        return Ok(plain_status(StatusCode::BAD_REQUEST));
    }

    let (session, answer_sdp) = match ctx.engine.accept(&offer.sdp).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(%peer, "rejecting offer: {e}");
            return Ok(plain_status(StatusCode::BAD_REQUEST));
        }
    };

    // Answer immediately; channel establishment and upgrade continue in
    // the background once the dialer applies it.
    let finish_ctx = ctx.clone();
    tokio::spawn(async move {
        finish_inbound(finish_ctx, session, peer).await;
    });

    let answer = SignalPayload::answer(answer_sdp, ctx.local_peer.clone());
    let json = match serde_json::to_vec(&answer) {
        Ok(json) => json,
        Err(e) => {
            warn!("unserializable answer: {e}");
            return Ok(plain_status(StatusCode::INTERNAL_SERVER_ERROR));
        }
    };
    let mut response = Response::new(Full::new(Bytes::from(json)));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn plain_status(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

async fn finish_inbound(ctx: Arc<ListenerCtx>, session: String, peer: SocketAddr) {
    let raw = match ctx.engine.open_inbound(&session).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(%peer, "inbound channel failed: {e}");
            return;
        }
    };

    let remote_addr = Multiaddr::from(peer.ip()).with(Protocol::Tcp(peer.port()));
    match ctx.upgrader.upgrade_inbound(raw.clone(), remote_addr).await {
        Ok(conn) => {
            conn.serve(ctx.registrar.clone());
            debug!(conn = %conn.id(), %peer, "inbound connection established");
            let _ = ctx.conn_tx.send(conn).await;
        }
        Err(e) => {
            raw.close().await;
            warn!(%peer, "inbound upgrade failed: {e}");
        }
    }
}
