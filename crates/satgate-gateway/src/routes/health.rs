use actix_web::{web, HttpRequest, HttpResponse};
use prometheus::{Encoder, TextEncoder};
use satgate::{constant_time_eq, LightningBackend};

use crate::metrics::REGISTRY;
use crate::state::AppState;

/// `GET /health` — 200 when fully healthy, 503 when the payment backend is
/// down (the gateway still serves, but cannot issue challenges).
pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    let lightning = match state.lightning.status().await {
        Ok(status) => status,
        Err(e) => satgate::BackendStatus {
            ok: false,
            detail: e.to_string(),
        },
    };

    let body = serde_json::json!({
        "status": if lightning.ok { "ok" } else { "degraded" },
        "lightning": { "ok": lightning.ok, "detail": lightning.detail },
        "routes": state.config.routes.len(),
    });
    if lightning.ok {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// `GET /metrics` — Prometheus exposition, bearer-gated when a token is set.
pub async fn metrics(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Some(ref expected) = state.config.metrics_token {
        let presented = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let ok = presented
            .map(|p| constant_time_eq(p.as_bytes(), expected.as_bytes()))
            .unwrap_or(false);
        if !ok {
            return HttpResponse::Unauthorized().json(serde_json::json!({
                "error": "unauthorized",
                "message": "metrics token required",
            }));
        }
    }

    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buf) {
        tracing::error!(error = %e, "metrics encoding failed");
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(buf)
}
