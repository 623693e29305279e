//! Client address resolution behind reverse proxies.
//!
//! The service is expected to run behind a proxy, so the peer address
//! alone is usually the proxy's. [`resolve_client_addr`] trusts the first
//! hop of `X-Forwarded-For` and falls back to the socket peer address.
//! Handlers read the result through the [`ClientAddr`] extension.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

/// Header carrying the proxy chain.
const FORWARDED_FOR: &str = "x-forwarded-for";

/// The best-known address of the originating client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub Option<IpAddr>);

/// First valid address in `X-Forwarded-For`, if any.
fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Middleware inserting [`ClientAddr`] into request extensions.
pub async fn resolve_client_addr(mut req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let client = forwarded_for(req.headers()).or(peer);

    req.extensions_mut().insert(ClientAddr(client));
    next.run(req).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::Ipv4Addr;

    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn first_forwarded_hop_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(
            forwarded_for(&headers),
            Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)))
        );
    }

    #[test]
    fn garbage_header_is_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("unknown"));
        assert_eq!(forwarded_for(&headers), None);
        assert_eq!(forwarded_for(&HeaderMap::new()), None);
    }
}
