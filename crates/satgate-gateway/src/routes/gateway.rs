//! The data-plane catch-all: decide, then proxy or render the verdict.

use std::time::Instant;

use actix_web::{web, HttpRequest, HttpResponse, ResponseError};

use crate::metrics::{DECISION_LATENCY, REQUESTS_TOTAL};
use crate::policy::{self, Decision, RequestFacts};
use crate::proxy;
use crate::state::AppState;

pub async fn proxy_entry(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    let facts = RequestFacts::from_http(&req);

    let started = Instant::now();
    let decision = policy::decide(&state, &facts).await;
    DECISION_LATENCY.observe(started.elapsed().as_secs_f64());
    REQUESTS_TOTAL
        .with_label_values(&[decision.route_label(), decision.label()])
        .inc();

    match decision {
        Decision::Allow {
            route,
            upstream,
            grant,
        } => {
            tracing::debug!(route = %route, method = %facts.method, path = %facts.path, "allow");
            match proxy::forward(&state, &route, upstream, &req, payload, grant.as_ref()).await {
                Ok(resp) => resp,
                Err(e) => e.error_response(),
            }
        }
        Decision::Challenge {
            route,
            challenge,
            tier,
            price_sats,
            ttl_secs,
            max_calls,
            reason,
        } => {
            tracing::info!(
                route = %route,
                tier = %tier,
                price_sats,
                reason = reason.unwrap_or("none"),
                "challenge issued"
            );
            let mut resp = HttpResponse::PaymentRequired();
            resp.insert_header((
                "www-authenticate",
                format!(
                    "L402 macaroon=\"{}\", invoice=\"{}\"",
                    challenge.token, challenge.invoice
                ),
            ));
            resp.insert_header(("x-l402-price-sats", price_sats.to_string()));
            resp.insert_header(("x-l402-tier", tier.as_str()));
            resp.insert_header(("x-l402-ttl-secs", ttl_secs.to_string()));
            if let Some(n) = max_calls {
                resp.insert_header(("x-l402-max-calls", n.to_string()));
            }
            if let Some(reason) = reason {
                resp.insert_header(("x-l402-reason", reason));
            }
            resp.json(serde_json::json!({
                "error": "payment_required",
                "message": "pay the invoice, then retry with Authorization: L402 <token>:<preimage>",
                "tier": tier,
                "price_sats": price_sats,
                "payment_hash": challenge.payment_hash,
                "expires_at": challenge.expires_at,
            }))
        }
        Decision::Deny {
            route,
            status,
            error,
            message,
        } => {
            tracing::debug!(
                route = route.as_deref().unwrap_or("none"),
                status,
                error,
                "deny"
            );
            deny_response(status, error, &message)
        }
    }
}

fn deny_response(status: u16, error: &str, message: &str) -> HttpResponse {
    let status = actix_web::http::StatusCode::from_u16(status)
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(serde_json::json!({
        "error": error,
        "message": message,
    }))
}
