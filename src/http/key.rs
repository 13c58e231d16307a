//! Client key resolution.

use axum::extract::{ConnectInfo, Request};
use std::net::SocketAddr;

/// Key used when a request carries nothing to identify its client.
pub const UNKNOWN_CLIENT: &str = "unknown";

const FORWARDED_FOR: &str = "x-forwarded-for";

/// Derives the rate limit key for a request.
///
/// The limiter only ever sees the resolved string. Returning `None` (or an
/// empty string) makes the middleware fall back to [`UNKNOWN_CLIENT`].
pub trait KeyResolver: Send + Sync {
    /// Resolve the client key for `request`.
    fn resolve(&self, request: &Request) -> Option<String>;
}

impl<F> KeyResolver for F
where
    F: Fn(&Request) -> Option<String> + Send + Sync,
{
    fn resolve(&self, request: &Request) -> Option<String> {
        self(request)
    }
}

/// Keys requests by client IP address.
///
/// Uses the peer address from the connection. When `trust_forwarded_for` is
/// set, the first `X-Forwarded-For` entry wins over the peer address.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientIpResolver {
    /// Prefer the proxy-supplied client address
    pub trust_forwarded_for: bool,
}

impl ClientIpResolver {
    /// Create a resolver.
    pub fn new(trust_forwarded_for: bool) -> Self {
        Self { trust_forwarded_for }
    }

    fn forwarded_for(request: &Request) -> Option<String> {
        let header = request.headers().get(FORWARDED_FOR)?.to_str().ok()?;
        let first = header.split(',').next()?.trim();
        (!first.is_empty()).then(|| first.to_string())
    }

    fn peer_ip(request: &Request) -> Option<String> {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
    }
}

impl KeyResolver for ClientIpResolver {
    fn resolve(&self, request: &Request) -> Option<String> {
        if self.trust_forwarded_for {
            if let Some(client) = Self::forwarded_for(request) {
                return Some(client);
            }
        }
        Self::peer_ip(request)
    }
}
