use crate::{PeerId, TransportError};

use multiaddr::{Multiaddr, Protocol};
use std::net::IpAddr;

/// A dialable signaling endpoint resolved from a multiaddr of the form
/// `/ip4|ip6/<host>/tcp/<port>/http/p2p-webrtc-direct[/p2p/<peer>]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub host: IpAddr,
    pub port: u16,
    pub remote_peer: Option<PeerId>,
}

impl ResolvedAddress {
    /// The signaling URL for this endpoint. IPv6 hosts are bracketed.
    pub fn signaling_url(&self, path: &str) -> String {
        match self.host {
            IpAddr::V4(host) => format!("http://{host}:{}{path}", self.port),
            IpAddr::V6(host) => format!("http://[{host}]:{}{path}", self.port),
        }
    }
}

/// Resolve a multiaddr into a signaling endpoint.
///
/// Pure validation, no I/O. Rejects addresses missing a transport family,
/// port, `http` scheme, or the `p2p-webrtc-direct` tag, and addresses
/// carrying components this transport cannot dial.
pub fn resolve(addr: &Multiaddr) -> Result<ResolvedAddress, TransportError> {
    let mut host = None;
    let mut port = None;
    let mut http = false;
    let mut webrtc_direct = false;
    let mut remote_peer = None;

    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(ip) => host = Some(IpAddr::V4(ip)),
            Protocol::Ip6(ip) => host = Some(IpAddr::V6(ip)),
            Protocol::Tcp(p) => port = Some(p),
            Protocol::Http => http = true,
            Protocol::P2pWebRtcDirect => webrtc_direct = true,
            Protocol::P2p(hash) => remote_peer = Some(PeerId::from_multihash(hash.into())),
            other => {
                return Err(TransportError::InvalidAddress(format!(
                    "unsupported component {other:?} in {addr}"
                )))
            }
        }
    }

    let host = host.ok_or_else(|| {
        TransportError::InvalidAddress(format!("missing ip4/ip6 component in {addr}"))
    })?;
    let port = port.ok_or_else(|| {
        TransportError::InvalidAddress(format!("missing tcp port in {addr}"))
    })?;
    if !http {
        return Err(TransportError::InvalidAddress(format!(
            "missing http component in {addr}"
        )));
    }
    if !webrtc_direct {
        return Err(TransportError::InvalidAddress(format!(
            "missing p2p-webrtc-direct component in {addr}"
        )));
    }

    Ok(ResolvedAddress {
        host,
        port,
        remote_peer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiaddr::multihash::Multihash;

    #[test]
    fn resolves_ipv4() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/12345/http/p2p-webrtc-direct"
            .parse()
            .unwrap();
        let resolved = resolve(&addr).unwrap();
        assert_eq!(resolved.host, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(resolved.port, 12345);
        assert!(resolved.remote_peer.is_none());
        assert_eq!(
            resolved.signaling_url("/signal"),
            "http://127.0.0.1:12345/signal"
        );
    }

    #[test]
    fn resolves_ipv6_with_brackets_in_url() {
        let addr: Multiaddr = "/ip6/::1/tcp/12346/http/p2p-webrtc-direct"
            .parse()
            .unwrap();
        let resolved = resolve(&addr).unwrap();
        assert_eq!(resolved.host, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(resolved.signaling_url("/signal"), "http://[::1]:12346/signal");
    }

    #[test]
    fn resolves_peer_component() {
        let hash = Multihash::wrap(0x12, &[9u8; 32]).unwrap();
        let addr = Multiaddr::from(IpAddr::from([127, 0, 0, 1]))
            .with(Protocol::Tcp(4001))
            .with(Protocol::Http)
            .with(Protocol::P2pWebRtcDirect)
            .with(Protocol::P2p(multiaddr::PeerId::try_from(hash).unwrap()));
        let resolved = resolve(&addr).unwrap();
        assert_eq!(resolved.remote_peer, Some(PeerId::from_multihash(hash)));
    }

    #[test]
    fn rejects_missing_port() {
        let addr: Multiaddr = "/ip4/127.0.0.1/http/p2p-webrtc-direct".parse().unwrap();
        assert!(matches!(
            resolve(&addr),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn rejects_missing_scheme() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/12345/p2p-webrtc-direct".parse().unwrap();
        assert!(matches!(
            resolve(&addr),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn rejects_missing_webrtc_direct_tag() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/12345/http".parse().unwrap();
        assert!(matches!(
            resolve(&addr),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn rejects_unsupported_component() {
        let addr: Multiaddr = "/ip4/127.0.0.1/udp/12345/http/p2p-webrtc-direct"
            .parse()
            .unwrap();
        assert!(matches!(
            resolve(&addr),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn resolve_is_repeatable() {
        let addr: Multiaddr = "/ip4/10.0.0.2/tcp/9000/http/p2p-webrtc-direct"
            .parse()
            .unwrap();
        assert_eq!(resolve(&addr).unwrap(), resolve(&addr).unwrap());
    }
}
