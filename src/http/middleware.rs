//! Rate limiting middleware for axum.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::LimiterError;
use crate::ratelimit::{normalize, Clock, Decision, RateLimiter, SystemClock};

/// Response header carrying the bucket capacity.
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Response header carrying the tokens left after the request.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Shared state for the [`rate_limit`] middleware.
pub struct GateState<C: Clock = SystemClock> {
    /// The limiter deciding each request
    pub limiter: Arc<RateLimiter<C>>,
    /// Whether proxy headers identify the client
    pub trust_forwarded_headers: bool,
}

impl<C: Clock> Clone for GateState<C> {
    fn clone(&self) -> Self {
        Self {
            limiter: self.limiter.clone(),
            trust_forwarded_headers: self.trust_forwarded_headers,
        }
    }
}

impl<C: Clock> std::fmt::Debug for GateState<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateState")
            .field("limiter", &self.limiter)
            .field("trust_forwarded_headers", &self.trust_forwarded_headers)
            .finish()
    }
}

/// Work out which address a request comes from.
///
/// With `trust_forwarded` set, the first `X-Forwarded-For` entry wins, then
/// `X-Real-IP`, then the socket peer. Otherwise only the peer counts. A
/// trusted header that is present but not visible ASCII is an invalid key.
pub fn client_addr(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trust_forwarded: bool,
) -> Result<IpAddr, LimiterError> {
    if trust_forwarded {
        let forwarded = header_str(headers, "x-forwarded-for")?
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let real_ip = header_str(headers, "x-real-ip")?
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if let Some(raw) = forwarded.or(real_ip) {
            return normalize(raw).map(|key| key.addr());
        }
    }

    peer.map(|addr| addr.ip())
        .ok_or_else(|| LimiterError::InvalidKey(String::new()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Result<Option<&'a str>, LimiterError> {
    headers
        .get(name)
        .map(|value| {
            value.to_str().map_err(|_| {
                LimiterError::InvalidKey(String::from_utf8_lossy(value.as_bytes()).into_owned())
            })
        })
        .transpose()
}

/// Admit or reject a request based on its client's token bucket.
///
/// Rejections get `429` with a JSON body, unusable client addresses get
/// `400`. Decided responses carry `X-RateLimit-Limit` and
/// `X-RateLimit-Remaining`.
pub async fn rate_limit<C: Clock + 'static>(
    State(gate): State<GateState<C>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = peer.map(|ConnectInfo(addr)| addr);

    let addr = match client_addr(request.headers(), peer, gate.trust_forwarded_headers) {
        Ok(addr) => addr,
        Err(e) => {
            warn!(error = %e, peer = ?peer, "Rejecting request with unusable client address");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() })))
                .into_response();
        }
    };

    let decision = gate.limiter.check_ip(addr);

    let mut response = if decision.admitted {
        next.run(request).await
    } else {
        debug!(client = %addr, "Rejecting rate limited request");
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "rate_limit_exceeded",
                "message": "Too many requests. Please try again later.",
            })),
        )
            .into_response()
    };

    set_rate_limit_headers(response.headers_mut(), decision);
    response
}

fn set_rate_limit_headers(headers: &mut HeaderMap, decision: Decision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request as HttpRequest;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    fn app(capacity: u32, trust: bool) -> Router<()> {
        let gate = GateState {
            limiter: Arc::new(RateLimiter::new(capacity, 0.001).unwrap()),
            trust_forwarded_headers: trust,
        };
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(from_fn_with_state(gate, rate_limit::<SystemClock>))
    }

    fn with_peer(router: Router<()>, peer: &str) -> Router<()> {
        router.layer(MockConnectInfo(peer.parse::<SocketAddr>().unwrap()))
    }

    fn get_root() -> HttpRequest<Body> {
        HttpRequest::builder().uri("/").body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_client_addr_peer_only() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));
        let peer: SocketAddr = "10.0.0.5:4000".parse().unwrap();

        let addr = client_addr(&headers, Some(peer), false).unwrap();
        assert_eq!(addr, "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_client_addr_forwarded_precedence() {
        let peer: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("2.2.2.2"));
        assert_eq!(
            client_addr(&headers, Some(peer), true).unwrap().to_string(),
            "2.2.2.2"
        );

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static(" ::ffff:1.1.1.1 , 3.3.3.3"),
        );
        assert_eq!(
            client_addr(&headers, Some(peer), true).unwrap().to_string(),
            "1.1.1.1"
        );
    }

    #[test]
    fn test_client_addr_invalid_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        let err = client_addr(&headers, None, true).unwrap_err();
        assert_eq!(err, LimiterError::InvalidKey("not-an-ip".to_string()));
    }

    #[test]
    fn test_client_addr_non_ascii_header() {
        let peer: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("2.2.2.2"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_bytes(b"\xff\xfe").unwrap(),
        );

        let err = client_addr(&headers, Some(peer), true).unwrap_err();
        assert!(matches!(err, LimiterError::InvalidKey(_)));

        headers.remove("x-forwarded-for");
        headers.insert("x-real-ip", HeaderValue::from_bytes(b"1.2.3.4\xe9").unwrap());
        assert!(client_addr(&headers, Some(peer), true).is_err());

        // Untrusted headers are never read
        let addr = client_addr(&headers, Some(peer), false).unwrap();
        assert_eq!(addr, peer.ip());
    }

    #[test]
    fn test_client_addr_nothing_known() {
        assert!(client_addr(&HeaderMap::new(), None, true).is_err());
        assert!(client_addr(&HeaderMap::new(), None, false).is_err());
    }

    #[tokio::test]
    async fn test_admits_then_rejects() {
        let app = with_peer(app(2, false), "192.0.2.10:5555");

        for remaining in ["1", "0"] {
            let response = app.clone().oneshot(get_root()).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[LIMIT_HEADER], "2");
            assert_eq!(response.headers()[REMAINING_HEADER], remaining);
        }

        let response = app.clone().oneshot(get_root()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[REMAINING_HEADER], "0");
        let body = body_json(response).await;
        assert_eq!(body["error"], "rate_limit_exceeded");
        assert_eq!(body["message"], "Too many requests. Please try again later.");
    }

    #[tokio::test]
    async fn test_forwarded_clients_are_isolated() {
        let app = with_peer(app(1, true), "10.0.0.1:80");

        for client in ["198.51.100.1", "198.51.100.2"] {
            let request = HttpRequest::builder()
                .uri("/")
                .header("x-forwarded-for", client)
                .body(Body::empty())
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let request = HttpRequest::builder()
            .uri("/")
            .header("x-forwarded-for", "::ffff:198.51.100.1")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_invalid_forwarded_address_is_bad_request() {
        let app = with_peer(app(1, true), "10.0.0.1:80");
        let request = HttpRequest::builder()
            .uri("/")
            .header("x-forwarded-for", "garbage")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(LIMIT_HEADER).is_none());
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("invalid IP address"));
    }

    #[tokio::test]
    async fn test_non_ascii_forwarded_address_is_bad_request() {
        let app = with_peer(app(1, true), "10.0.0.1:80");
        let request = HttpRequest::builder()
            .uri("/")
            .header("x-forwarded-for", HeaderValue::from_bytes(b"\xff\xfe").unwrap())
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(LIMIT_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_missing_peer_is_bad_request() {
        let response = app(1, false).oneshot(get_root()).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
