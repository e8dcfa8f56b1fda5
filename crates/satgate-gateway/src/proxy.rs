//! The streaming reverse proxy.
//!
//! Bodies stream through in both directions — the gateway never buffers a
//! request or response. Request headers pass a per-upstream allow-list (the
//! default list excludes `authorization` and `cookie`, so gateway credentials
//! never reach an upstream); response headers are stripped of hop-by-hop
//! fields plus the upstream's deny-list.

use std::io;
use std::time::Instant;

use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use url::Url;
use uuid::Uuid;

use crate::config::CompiledUpstream;
use crate::error::GatewayError;
use crate::metrics::UPSTREAM_LATENCY;
use crate::policy::Grant;
use crate::state::AppState;

/// Connection-scoped headers that must never cross a proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

/// Reject control bytes a client could use to smuggle extra header lines or
/// requests past the upstream's parser.
fn sanitize_query(query: Option<&str>) -> Result<Option<&str>, GatewayError> {
    match query {
        None => Ok(None),
        Some(q) => {
            if q.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
                return Err(GatewayError::BadRequest(
                    "query string contains control bytes".to_string(),
                ));
            }
            Ok(Some(q))
        }
    }
}

/// Append the full request path (and sanitized query) to the upstream's base
/// path. Any fragment on the base is dropped.
fn build_upstream_url(
    base: &Url,
    path: &str,
    query: Option<&str>,
) -> Result<Url, GatewayError> {
    if path.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(GatewayError::BadRequest(
            "path contains control bytes".to_string(),
        ));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(GatewayError::BadRequest(
            "path traversal is not allowed".to_string(),
        ));
    }
    let mut url = base.clone();
    let joined = format!("{}{}", base.path().trim_end_matches('/'), path);
    url.set_path(&joined);
    url.set_query(sanitize_query(query)?);
    url.set_fragment(None);
    Ok(url)
}

fn wants_body(req: &HttpRequest) -> bool {
    let headers = req.headers();
    if headers.contains_key("transfer-encoding") {
        return true;
    }
    headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|n| n > 0)
}

/// Proxy one request to the given upstream and stream the response back.
pub async fn forward(
    state: &AppState,
    route: &str,
    upstream_idx: usize,
    req: &HttpRequest,
    payload: web::Payload,
    grant: Option<&Grant>,
) -> Result<HttpResponse, GatewayError> {
    let upstream: &CompiledUpstream = state
        .config
        .upstreams
        .get(upstream_idx)
        .ok_or_else(|| GatewayError::Internal("dangling upstream index".to_string()))?;

    let url = build_upstream_url(&upstream.url, req.path(), req.uri().query())?;
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|_| GatewayError::BadRequest("unusable method".to_string()))?;
    let request_id = Uuid::new_v4().to_string();

    let mut builder = upstream.client.request(method, url);
    for (name, value) in req.headers() {
        let name = name.as_str();
        // host and content-length are derived fresh, never copied.
        if is_hop_by_hop(name)
            || name == "host"
            || name == "content-length"
            || !upstream.request_allow.contains(name)
        {
            continue;
        }
        if let Ok(value) = value.to_str() {
            builder = builder.header(name, value);
        }
    }
    if upstream.forward_host {
        if let Some(host) = req.headers().get("host").and_then(|v| v.to_str().ok()) {
            builder = builder.header("host", host);
        }
    }
    builder = builder.header("x-request-id", &request_id);
    if let Some(peer) = req.peer_addr() {
        builder = builder.header("x-forwarded-for", peer.ip().to_string());
    }

    if wants_body(req) {
        // Payload is not Send; bridge it through a channel so reqwest can
        // stream it from this task.
        let (mut tx, rx) = futures::channel::mpsc::channel::<Result<Bytes, io::Error>>(8);
        let mut payload = payload;
        actix_web::rt::spawn(async move {
            while let Some(chunk) = payload.next().await {
                let item = chunk.map_err(|e| io::Error::other(e.to_string()));
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        builder = builder.body(reqwest::Body::wrap_stream(rx));
    }

    // The per-request timeout runs from connect through the end of the
    // response body: a slow upstream cannot hold the relay open past its
    // deadline. Mid-body expiry surfaces as a stream error, which aborts the
    // client response.
    let started = Instant::now();
    let sent = builder.timeout(upstream.timeout).send().await;
    UPSTREAM_LATENCY
        .with_label_values(&[&upstream.name])
        .observe(started.elapsed().as_secs_f64());

    let resp = match sent {
        Err(e) if e.is_timeout() => {
            return Err(GatewayError::GatewayTimeout(format!(
                "upstream {}: {e}",
                upstream.name
            )))
        }
        Err(e) => {
            return Err(GatewayError::BadGateway(format!(
                "upstream {}: {e}",
                upstream.name
            )))
        }
        Ok(resp) => resp,
    };

    let status = actix_web::http::StatusCode::from_u16(resp.status().as_u16())
        .map_err(|_| GatewayError::BadGateway("upstream sent an invalid status".to_string()))?;
    let mut out = HttpResponse::build(status);
    for (name, value) in resp.headers() {
        let name = name.as_str();
        // content-length is dropped: the body re-streams chunked.
        if is_hop_by_hop(name) || name == "content-length" || upstream.response_deny.contains(name)
        {
            continue;
        }
        // append, not insert: repeated names (Set-Cookie) must all survive.
        out.append_header((name, value.as_bytes()));
    }
    out.insert_header(("x-request-id", request_id.as_str()));
    out.insert_header(("x-satgate-route", route));
    if let Some(grant) = grant {
        if !grant.scope.is_empty() {
            out.insert_header(("x-satgate-scope", grant.scope.as_str()));
        }
        if let Some(n) = grant.calls_remaining {
            out.insert_header(("x-calls-remaining", n.to_string()));
        }
        if let Some(n) = grant.budget_remaining {
            out.insert_header(("x-budget-remaining", n.to_string()));
        }
    }

    Ok(out.streaming(resp.bytes_stream()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_path_is_joined_onto_the_base() {
        let base = Url::parse("https://api.example.com/v2/").unwrap();
        let url = build_upstream_url(&base, "/data/items", Some("limit=5")).unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v2/data/items?limit=5");

        let base = Url::parse("http://localhost:9000").unwrap();
        let url = build_upstream_url(&base, "/x", None).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/x");
    }

    #[test]
    fn control_bytes_in_query_are_rejected() {
        let base = Url::parse("http://localhost:9000").unwrap();
        assert!(build_upstream_url(&base, "/x", Some("a=1%0d%0a")).is_ok());
        assert!(build_upstream_url(&base, "/x", Some("a=1\r\nHost: evil")).is_err());
        assert!(build_upstream_url(&base, "/x\n", None).is_err());
    }

    #[test]
    fn dotdot_segments_are_rejected() {
        let base = Url::parse("http://localhost:9000/api").unwrap();
        assert!(build_upstream_url(&base, "/a/../secret", None).is_err());
        assert!(build_upstream_url(&base, "/a/..", None).is_err());
        assert!(build_upstream_url(&base, "/a/..b/c", None).is_ok());
    }

    #[test]
    fn fragments_never_reach_the_upstream() {
        let mut base = Url::parse("http://localhost:9000/base").unwrap();
        base.set_fragment(Some("frag"));
        let url = build_upstream_url(&base, "/x", None).unwrap();
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(is_hop_by_hop("connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-request-id"));
    }
}
