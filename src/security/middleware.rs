// ARCHITECTURE: Security Middleware - HTTP Adapter for the Request Pipeline
//
// Translates an axum request into a `RequestContext`, runs the security pipeline, and
// renders the decision:
// - Reject: JSON `{error, code, retry_after}` with status, Retry-After and rate-limit headers
// - Allow: forwards to the handler, then adds security and X-RateLimit-* headers
//
// CLIENT ADDRESS:
// The socket peer is the client unless the peer is a configured trusted proxy. Only then
// are forwarding headers read, walking X-Forwarded-For from the right and taking the first
// hop that is not itself a trusted proxy. Anything left of that hop is client-controlled.
//
// The bearer token only identifies the user for quota purposes. A token that fails
// verification leaves the request anonymous; route-level authorization is the handler's job.
// A revocation lookup that cannot reach the shared store fails the request with 503.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use super::{
    pipeline::{Decision, RejectResponse, RequestContext},
    rate_limiter::QuotaSnapshot,
    service::SecurityService,
};

// RESPONSE: SecurityError - Rejection Body
#[derive(Debug, Clone, Serialize)]
pub struct SecurityError {
    pub error: String,
    pub code: String,
    pub retry_after: Option<u64>,
}

/// Shared state for the layer: the service, the body buffering limit and the proxies
/// whose forwarding headers are trusted.
#[derive(Clone)]
pub struct SecurityLayerState {
    pub service: Arc<SecurityService>,
    pub max_body_bytes: usize,
    pub trusted_proxies: Arc<[IpAddr]>,
}

impl SecurityLayerState {
    pub fn new(service: Arc<SecurityService>) -> Self {
        let server = &service.config().server;
        let max_body_bytes = server.max_body_bytes;
        let trusted_proxies = Arc::from(server.trusted_proxies.as_slice());
        Self {
            service,
            max_body_bytes,
            trusted_proxies,
        }
    }
}

pub async fn security_layer(
    State(state): State<SecurityLayerState>,
    request: Request,
    next: Next,
) -> Response {
    let start_time = std::time::Instant::now();
    let (parts, body) = request.into_parts();

    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let ip = resolve_client_ip(&parts.headers, peer, &state.trusted_proxies)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_agent = parts
        .headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let bytes = match to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return rejection_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                SecurityError {
                    error: "Request body too large".to_string(),
                    code: "payload_too_large".to_string(),
                    retry_after: None,
                },
                &[],
            );
        }
    };

    let authenticated_user_id = match extract_bearer_token(&parts.headers) {
        Some(token) => match state.service.verify_token(token).await {
            Ok(claims) => Some(claims.sub),
            Err(e) if e.is_backend_failure() => {
                warn!(ip = %ip, error = %e, "Token revocation state unavailable, rejecting request");
                return rejection_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    SecurityError {
                        error: "Security check temporarily unavailable".to_string(),
                        code: "security_check_unavailable".to_string(),
                        retry_after: None,
                    },
                    &[],
                );
            }
            Err(_) => None,
        },
        None => None,
    };

    let ctx = RequestContext {
        ip,
        user_agent,
        path,
        body: String::from_utf8_lossy(&bytes).into_owned(),
        authenticated_user_id,
    };

    match state.service.check_request(&ctx).await {
        Decision::Reject(rejection) => render_rejection(rejection),
        Decision::Allow { quota } => {
            let request = Request::from_parts(parts, Body::from(bytes));
            let mut response = next.run(request).await;
            add_security_headers(response.headers_mut());
            if let Some(snapshot) = quota {
                add_quota_headers(response.headers_mut(), &snapshot);
            }

            debug!(
                ip = %ctx.ip,
                path = %ctx.path,
                status = %response.status(),
                processing_time_ms = start_time.elapsed().as_millis(),
                "Request passed security checks"
            );
            response
        }
    }
}

/// Client address for a request whose socket peer is `peer`.
///
/// Forwarding headers are honored only when `peer` is in `trusted`. X-Forwarded-For is read
/// right to left and the first hop outside `trusted` wins; X-Real-IP and X-Client-IP are
/// consulted only when X-Forwarded-For yields nothing usable.
pub fn resolve_client_ip(headers: &HeaderMap, peer: Option<IpAddr>, trusted: &[IpAddr]) -> Option<IpAddr> {
    let peer = peer?;
    if !trusted.contains(&peer) {
        return Some(peer);
    }

    let forwarded = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .collect::<Vec<_>>();
    for hop in forwarded.iter().rev() {
        match hop.trim().parse::<IpAddr>() {
            Ok(ip) if trusted.contains(&ip) => continue,
            Ok(ip) => return Some(ip),
            // An unparseable hop ends the trusted chain
            Err(_) => break,
        }
    }

    ["x-real-ip", "x-client-ip"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| v.trim().parse::<IpAddr>().ok())
        .or(Some(peer))
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

fn render_rejection(rejection: RejectResponse) -> Response {
    let body = SecurityError {
        error: rejection.message,
        code: rejection.code.to_string(),
        retry_after: rejection.retry_after_seconds,
    };
    rejection_response(rejection.http_status, body, &rejection.headers)
}

fn rejection_response(status: StatusCode, body: SecurityError, headers: &[(&'static str, String)]) -> Response {
    let mut response = (status, Json(body)).into_response();
    let response_headers = response.headers_mut();
    for (name, value) in headers {
        insert_header(response_headers, name, value);
    }
    add_security_headers(response_headers);
    response
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
        headers.insert(name, value);
    }
}

fn add_quota_headers(headers: &mut HeaderMap, snapshot: &QuotaSnapshot) {
    let reset = Utc::now().timestamp() + snapshot.reset_after_ms.div_ceil(1000) as i64;
    insert_header(headers, "x-ratelimit-limit", &snapshot.limit.to_string());
    insert_header(headers, "x-ratelimit-remaining", &snapshot.remaining.to_string());
    insert_header(headers, "x-ratelimit-reset", &reset.to_string());
}

fn add_security_headers(headers: &mut HeaderMap) {
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("x-xss-protection", HeaderValue::from_static("1; mode=block"));
    headers.insert(
        "strict-transport-security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert("referrer-policy", HeaderValue::from_static("strict-origin-when-cross-origin"));
    headers.insert("content-security-policy", HeaderValue::from_static("default-src 'self'"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn forwarded(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static(value));
        headers.insert("x-real-ip", HeaderValue::from_static("198.51.100.77"));
        headers
    }

    #[test]
    fn untrusted_peer_ignores_forwarding_headers() {
        let headers = forwarded("1.2.3.4, 203.0.113.9");
        let resolved = resolve_client_ip(&headers, Some(ip("203.0.113.9")), &[]);
        assert_eq!(resolved, Some(ip("203.0.113.9")));

        let proxy = [ip("10.0.0.1")];
        let resolved = resolve_client_ip(&headers, Some(ip("192.0.2.4")), &proxy);
        assert_eq!(resolved, Some(ip("192.0.2.4")));

        assert_eq!(resolve_client_ip(&headers, None, &proxy), None);
    }

    #[test]
    fn trusted_proxy_yields_rightmost_untrusted_hop() {
        let proxies = [ip("10.0.0.1"), ip("10.0.0.2")];

        // Client-supplied 1.2.3.4 sits left of the address the proxy observed
        let headers = forwarded("1.2.3.4, 203.0.113.9, 10.0.0.2");
        let resolved = resolve_client_ip(&headers, Some(ip("10.0.0.1")), &proxies);
        assert_eq!(resolved, Some(ip("203.0.113.9")));

        let headers = forwarded("garbage, 10.0.0.2");
        let resolved = resolve_client_ip(&headers, Some(ip("10.0.0.1")), &proxies);
        assert_eq!(resolved, Some(ip("198.51.100.77")), "falls back to X-Real-IP");

        let resolved = resolve_client_ip(&HeaderMap::new(), Some(ip("10.0.0.1")), &proxies);
        assert_eq!(resolved, Some(ip("10.0.0.1")), "no headers leaves the proxy itself");
    }

    #[test]
    fn bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_bearer_token(&headers), None);
        headers.insert("authorization", HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(extract_bearer_token(&headers), Some("abc.def.ghi"));
    }
}
