//! Rate-limit middleware for the ingress `send` route

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use super::errors::ApiError;
use crate::auth::{ApiKeyStore, KeyDigest, API_KEY_HEADER};
use crate::context::Relay;

/// Reject the request with 429 when the client's bucket is empty
///
/// Runs before authentication and body parsing.
pub async fn admission(State(relay): State<Arc<Relay>>, request: Request, next: Next) -> Response {
    let key = client_key(&relay.api_keys, &request);

    if !relay.limiter.allow(&key).await {
        debug!(client = %key, "Request rate limited");
        let rate = relay.limiter.config().rate_per_sec;
        let retry_after =
            Duration::try_from_secs_f64(1.0 / rate).unwrap_or(Duration::from_secs(1));
        return ApiError::RateLimited { retry_after }.into_response();
    }

    next.run(request).await
}

/// Bucket key: the digest of a valid API key, else the client address
///
/// Unverified keys share their sender's address bucket, so made-up keys
/// cannot claim fresh buckets or push real ones out of the table.
pub fn client_key<B>(keys: &ApiKeyStore, request: &axum::http::Request<B>) -> String {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match keys.identify(presented) {
        Ok(digest) => format!("key:{}", hex_digest(&digest)),
        Err(_) => format!("ip:{}", client_ip(request)),
    }
}

fn hex_digest(digest: &KeyDigest) -> String {
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Client IP from proxy headers, then the peer address
pub fn client_ip<B>(request: &axum::http::Request<B>) -> IpAddr {
    // Try X-Forwarded-For header first (for proxies)
    if let Some(ip) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
    {
        return ip;
    }

    if let Some(ip) = request
        .headers()
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
    {
        return ip;
    }

    if let Some(ConnectInfo(addr)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        return addr.ip();
    }

    IpAddr::from([127, 0, 0, 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;

    fn keys() -> ApiKeyStore {
        ApiKeyStore::new(["k1"])
    }

    #[test]
    fn test_valid_api_key_wins_over_address() {
        let request = Request::builder()
            .header(API_KEY_HEADER, "k1")
            .header("x-forwarded-for", "10.0.0.1")
            .body(Body::empty())
            .unwrap();

        let key = client_key(&keys(), &request);
        assert_eq!(key, format!("key:{}", hex_digest(&crate::auth::digest_key("k1"))));
        assert!(!key.contains("k1"));
    }

    #[test]
    fn test_unknown_api_key_uses_address() {
        let request = Request::builder()
            .header(API_KEY_HEADER, "made-up")
            .header("x-forwarded-for", "10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_key(&keys(), &request), "ip:10.0.0.1");
    }

    #[test]
    fn test_forwarded_for_uses_first_hop() {
        let request = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_key(&keys(), &request), "ip:203.0.113.7");
    }

    #[test]
    fn test_real_ip_then_peer_address() {
        let request = Request::builder()
            .header("x-real-ip", "198.51.100.2")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request).to_string(), "198.51.100.2");

        let mut request = Request::builder().body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 9], 4000))));
        assert_eq!(client_ip(&request).to_string(), "192.0.2.9");
    }

    #[test]
    fn test_unknown_client_falls_back_to_loopback() {
        let request = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(client_key(&keys(), &request), "ip:127.0.0.1");
    }
}
