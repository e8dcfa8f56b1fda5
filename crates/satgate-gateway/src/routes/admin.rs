//! Admin plane: capability minting, delegation, and tier inspection.
//!
//! Every handler is gated on `X-Admin-Secret`, compared in constant time.
//! Without a configured secret (dev mode only; compile() enforces this) the
//! plane is open and says so loudly at startup.

use actix_web::{web, HttpRequest, HttpResponse};
use satgate::{constant_time_eq, Delegation};
use serde::Deserialize;

use crate::error::GatewayError;
use crate::state::AppState;

fn require_admin(state: &AppState, req: &HttpRequest) -> Result<(), GatewayError> {
    let Some(ref secret) = state.config.admin_secret else {
        // Only reachable in dev mode.
        return Ok(());
    };
    let presented = req
        .headers()
        .get("x-admin-secret")
        .and_then(|v| v.to_str().ok());
    match presented {
        Some(p) if constant_time_eq(p.as_bytes(), secret.as_bytes()) => Ok(()),
        _ => Err(GatewayError::Unauthorized(
            "admin secret required".to_string(),
        )),
    }
}

#[derive(Debug, Deserialize)]
pub struct MintRequest {
    pub scope: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub max_calls: Option<u64>,
}

/// `POST /admin/tokens` — mint a payment-free capability token.
pub async fn mint_token(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<MintRequest>,
) -> Result<HttpResponse, GatewayError> {
    require_admin(&state, &req)?;
    if body.scope.is_empty() {
        return Err(GatewayError::BadRequest("scope must be nonempty".to_string()));
    }
    let mac = state
        .tokens
        .mint_capability(&body.scope, body.ttl_secs, body.max_calls);
    tracing::info!(scope = %body.scope, max_calls = ?body.max_calls, "capability minted");
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "token": mac.encode(),
        "scope": body.scope,
        "max_calls": body.max_calls,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DelegateRequest {
    pub token: String,
    #[serde(flatten)]
    pub delegation: Delegation,
}

/// `POST /admin/tokens/delegate` — derive a narrowed sub-token.
///
/// Offline holders can do this themselves with the chain signature alone;
/// this endpoint exists for operators who want the gateway to do it.
pub async fn delegate_token(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Json<DelegateRequest>,
) -> Result<HttpResponse, GatewayError> {
    require_admin(&state, &req)?;
    let now = chrono::Utc::now().timestamp();
    let child = state
        .tokens
        .delegate(&body.token, &body.delegation, now)
        .map_err(|e| GatewayError::BadRequest(e.to_string()))?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "token": child.encode(),
    })))
}

/// `GET /admin/tiers` — the static tier price table.
pub async fn list_tiers(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, GatewayError> {
    require_admin(&state, &req)?;
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "default_price_sats": state.config.l402.default_price_sats,
        "default_ttl_secs": state.config.l402.default_ttl_secs,
        "tiers": state.config.l402.tiers,
    })))
}
