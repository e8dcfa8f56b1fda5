//! Out-of-process policy evaluation: `POST /decision`.
//!
//! Sidecars and test harnesses submit request facts and get the verdict the
//! data plane would reach, including any freshly minted challenge. Evaluation
//! here charges meters exactly like a proxied request would.

use actix_web::{web, HttpResponse};

use crate::policy::{decide, Decision, RequestFacts};
use crate::state::AppState;

pub async fn evaluate(
    state: web::Data<AppState>,
    facts: web::Json<RequestFacts>,
) -> HttpResponse {
    let decision = decide(&state, &facts).await;
    let body = match decision {
        Decision::Allow {
            route,
            upstream,
            grant,
        } => serde_json::json!({
            "decision": "allow",
            "route": route,
            "upstream": state.config.upstreams.get(upstream).map(|u| u.name.clone()),
            "grant": grant,
        }),
        Decision::Challenge {
            route,
            challenge,
            tier,
            price_sats,
            ttl_secs,
            max_calls,
            reason,
        } => serde_json::json!({
            "decision": "challenge",
            "route": route,
            "tier": tier,
            "price_sats": price_sats,
            "ttl_secs": ttl_secs,
            "max_calls": max_calls,
            "reason": reason,
            "token": challenge.token,
            "invoice": challenge.invoice,
            "payment_hash": challenge.payment_hash,
            "expires_at": challenge.expires_at,
        }),
        Decision::Deny {
            route,
            status,
            error,
            message,
        } => serde_json::json!({
            "decision": "deny",
            "route": route,
            "status": status,
            "error": error,
            "message": message,
        }),
    };
    HttpResponse::Ok().json(body)
}
