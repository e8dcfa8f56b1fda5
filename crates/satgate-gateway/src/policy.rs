//! The routing and policy decision engine.
//!
//! One state machine per request, terminal on first decision. Fail-closed is
//! the load-bearing property: no route, unknown policy state, invoice
//! failure, or any other surprise resolves to a denial, never to access.
//!
//! The engine is transport-agnostic: the in-process proxy handler and the
//! out-of-process `POST /decision` endpoint both call [`decide`] with the
//! same [`RequestFacts`].

use std::collections::HashMap;

use satgate::{Challenge, TokenError, ValidToken};

use crate::config::{CompiledRoute, ExhaustMode, PolicyDoc};
use crate::metrics::{CHALLENGES_ISSUED, METER_EXHAUSTED, TOKENS_REJECTED};
use crate::state::AppState;

/// The request attributes the engine decides on.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RequestFacts {
    pub method: String,
    pub path: String,
    /// Lowercased header names; first value wins.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl RequestFacts {
    pub fn from_http(req: &actix_web::HttpRequest) -> Self {
        let mut headers = HashMap::new();
        for (name, value) in req.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_lowercase())
                    .or_insert_with(|| value.to_string());
            }
        }
        Self {
            method: req.method().as_str().to_string(),
            path: req.path().to_string(),
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(&name.to_lowercase()).cloned()
    }
}

/// A quota snapshot attached to allowed requests, surfaced as response headers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Grant {
    pub scope: String,
    pub tier: Option<String>,
    pub calls_remaining: Option<u64>,
    pub budget_remaining: Option<u64>,
}

/// The terminal verdict for a request.
#[derive(Debug)]
pub enum Decision {
    /// Proxy to `upstream` (index into the config's upstream table).
    Allow {
        route: String,
        upstream: usize,
        grant: Option<Grant>,
    },
    /// 402 with a fresh token+invoice pair.
    Challenge {
        route: String,
        challenge: Challenge,
        tier: String,
        price_sats: u64,
        ttl_secs: u64,
        max_calls: Option<u64>,
        /// `calls_exhausted` / `budget_exhausted` on re-challenges.
        reason: Option<&'static str>,
    },
    /// Terminal denial.
    Deny {
        route: Option<String>,
        status: u16,
        error: &'static str,
        message: String,
    },
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Allow { .. } => "allow",
            Decision::Challenge { .. } => "challenge",
            Decision::Deny { .. } => "deny",
        }
    }

    pub fn route_label(&self) -> &str {
        match self {
            Decision::Allow { route, .. } | Decision::Challenge { route, .. } => route,
            Decision::Deny { route, .. } => route.as_deref().unwrap_or("none"),
        }
    }
}

/// Parse `Authorization: L402 <token>:<hex-proof>` (legacy alias `LSAT`).
pub fn parse_l402_credentials(header: &str) -> Option<(String, String)> {
    let rest = header
        .strip_prefix("L402 ")
        .or_else(|| header.strip_prefix("LSAT "))?;
    let (token, proof) = rest.trim().split_once(':')?;
    if token.is_empty() || proof.is_empty() {
        return None;
    }
    Some((token.to_string(), proof.to_string()))
}

/// Parse `Authorization: Capability <token>` (alias `Bearer`).
pub fn parse_capability_credentials(header: &str) -> Option<String> {
    let token = header
        .strip_prefix("Capability ")
        .or_else(|| header.strip_prefix("Bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Evaluate the route table and its policy for one request.
pub async fn decide(state: &AppState, facts: &RequestFacts) -> Decision {
    let now = chrono::Utc::now().timestamp();
    let header = |name: &str| facts.header(name);

    let Some(route) = state.config.match_route(&facts.method, &facts.path, &header) else {
        return Decision::Deny {
            route: None,
            status: 403,
            error: "no_route",
            message: "no route matches this request".to_string(),
        };
    };

    match route.policy.clone() {
        PolicyDoc::Public => Decision::Allow {
            route: route.name.clone(),
            upstream: match route.upstream {
                Some(idx) => idx,
                None => return internal_deny(route, "public route without upstream"),
            },
            grant: None,
        },
        PolicyDoc::Deny { status } => Decision::Deny {
            route: Some(route.name.clone()),
            status,
            error: "policy_deny",
            message: "access to this route is denied".to_string(),
        },
        PolicyDoc::L402 {
            tier,
            price_sats,
            scope,
            ttl_secs,
            max_calls,
            budget_sats,
        } => {
            let price = price_sats.unwrap_or_else(|| state.config.l402.price_for_tier(&tier));
            let ttl = ttl_secs.unwrap_or(state.config.l402.default_ttl_secs);
            let max_calls = max_calls.or(state.config.l402.default_max_calls);
            let budget = budget_sats.or(state.config.l402.default_budget_sats);
            let issue = ChallengeSpec {
                route,
                tier: &tier,
                price,
                scope: &scope,
                ttl,
                max_calls,
                budget,
            };

            let creds = facts
                .header("authorization")
                .and_then(|h| parse_l402_credentials(&h));
            let Some((token, proof)) = creds else {
                return issue_challenge(state, issue, None).await;
            };

            let valid = match state.tokens.validate(&token, Some(&proof), now) {
                Ok(valid) => valid,
                Err(e) => {
                    TOKENS_REJECTED.with_label_values(&[reject_reason(&e)]).inc();
                    tracing::debug!(route = %route.name, error = %e, "l402 token rejected");
                    return issue_challenge(state, issue, None).await;
                }
            };
            if !valid.grants(&scope) {
                // A scope mismatch gets a challenge for the *correct* scope,
                // not a bare rejection: the client can pay its way in.
                TOKENS_REJECTED.with_label_values(&["scope_mismatch"]).inc();
                return issue_challenge(state, issue, None).await;
            }

            match charge(state, &valid, price, now) {
                ChargeOutcome::Ok(grant) => Decision::Allow {
                    route: route.name.clone(),
                    upstream: match route.upstream {
                        Some(idx) => idx,
                        None => return internal_deny(route, "l402 route without upstream"),
                    },
                    grant: Some(grant),
                },
                ChargeOutcome::CallsExhausted => {
                    METER_EXHAUSTED.with_label_values(&["calls"]).inc();
                    match state.config.l402.on_calls_exhausted {
                        ExhaustMode::Challenge => {
                            issue_challenge(state, issue, Some("calls_exhausted")).await
                        }
                        ExhaustMode::Reject => Decision::Deny {
                            route: Some(route.name.clone()),
                            status: 429,
                            error: "calls_exhausted",
                            message: "call quota exhausted for this token".to_string(),
                        },
                    }
                }
                ChargeOutcome::BudgetExhausted => {
                    // Always re-challenge: the client must fund a new window.
                    METER_EXHAUSTED.with_label_values(&["budget"]).inc();
                    issue_challenge(state, issue, Some("budget_exhausted")).await
                }
            }
        }
        PolicyDoc::Capability { scope, max_calls } => {
            let creds = facts
                .header("authorization")
                .and_then(|h| parse_capability_credentials(&h));
            let Some(token) = creds else {
                return Decision::Deny {
                    route: Some(route.name.clone()),
                    status: 401,
                    error: "missing_token",
                    message: "a capability token is required".to_string(),
                };
            };

            let valid = match state.tokens.validate(&token, None, now) {
                Ok(valid) => valid,
                Err(e) => {
                    TOKENS_REJECTED.with_label_values(&[reject_reason(&e)]).inc();
                    return capability_reject(route, &e);
                }
            };
            if !valid.grants(&scope) {
                TOKENS_REJECTED.with_label_values(&["scope_mismatch"]).inc();
                return Decision::Deny {
                    route: Some(route.name.clone()),
                    status: 403,
                    error: "scope_mismatch",
                    message: format!("token does not grant scope {scope:?}"),
                };
            }

            // Capability routes meter calls only; there is no tier price to
            // charge a budget against, and no payment to prompt for.
            let effective_max = min_opt(valid.max_calls, max_calls);
            match charge_calls_only(state, &valid, effective_max, now) {
                ChargeOutcome::Ok(mut grant) => {
                    grant.scope = scope;
                    Decision::Allow {
                        route: route.name.clone(),
                        upstream: match route.upstream {
                            Some(idx) => idx,
                            None => return internal_deny(route, "capability route without upstream"),
                        },
                        grant: Some(grant),
                    }
                }
                ChargeOutcome::CallsExhausted => {
                    METER_EXHAUSTED.with_label_values(&["calls"]).inc();
                    Decision::Deny {
                        route: Some(route.name.clone()),
                        status: 429,
                        error: "calls_exhausted",
                        message: "call quota exhausted for this token".to_string(),
                    }
                }
                ChargeOutcome::BudgetExhausted => internal_deny(route, "budget charge on capability route"),
            }
        }
    }
}

struct ChallengeSpec<'a> {
    route: &'a CompiledRoute,
    tier: &'a str,
    price: u64,
    scope: &'a str,
    ttl: u64,
    max_calls: Option<u64>,
    budget: Option<u64>,
}

async fn issue_challenge(
    state: &AppState,
    spec: ChallengeSpec<'_>,
    reason: Option<&'static str>,
) -> Decision {
    let result = state
        .tokens
        .create_challenge(
            state.lightning.as_ref(),
            spec.tier,
            spec.price,
            spec.scope,
            Some(spec.ttl),
            spec.max_calls,
            spec.budget,
        )
        .await;
    match result {
        Ok(challenge) => {
            CHALLENGES_ISSUED
                .with_label_values(&[spec.tier, reason.unwrap_or("none")])
                .inc();
            Decision::Challenge {
                route: spec.route.name.clone(),
                challenge,
                tier: spec.tier.to_string(),
                price_sats: spec.price,
                ttl_secs: spec.ttl,
                max_calls: spec.max_calls,
                reason,
            }
        }
        // No invoice means no challenge to offer; fail closed.
        Err(e) => {
            tracing::error!(route = %spec.route.name, error = %e, "invoice creation failed");
            internal_deny(spec.route, "payment backend unavailable")
        }
    }
}

enum ChargeOutcome {
    Ok(Grant),
    CallsExhausted,
    BudgetExhausted,
}

fn charge(state: &AppState, valid: &ValidToken, cost_sats: u64, now: i64) -> ChargeOutcome {
    let ttl = valid.ttl_from(now);
    let mut calls_remaining = None;
    if let Some(max) = valid.max_calls {
        let charge = state.meter.charge_call(&valid.signature, max, ttl);
        if charge.exhausted {
            return ChargeOutcome::CallsExhausted;
        }
        calls_remaining = Some(charge.remaining);
    }
    let mut budget_remaining = None;
    if let Some(budget) = valid.budget_sats {
        let charge = state
            .meter
            .charge_budget(&valid.signature, budget, cost_sats, ttl);
        if !charge.charged {
            // The call taken above must not stay spent on a request the
            // budget then rejected.
            if valid.max_calls.is_some() {
                state.meter.refund_call(&valid.signature);
            }
            return ChargeOutcome::BudgetExhausted;
        }
        budget_remaining = Some(charge.remaining);
    }
    ChargeOutcome::Ok(Grant {
        scope: valid.scopes.last().cloned().unwrap_or_default(),
        tier: valid.tier.clone(),
        calls_remaining,
        budget_remaining,
    })
}

fn charge_calls_only(
    state: &AppState,
    valid: &ValidToken,
    max_calls: Option<u64>,
    now: i64,
) -> ChargeOutcome {
    let mut calls_remaining = None;
    if let Some(max) = max_calls {
        let charge = state
            .meter
            .charge_call(&valid.signature, max, valid.ttl_from(now));
        if charge.exhausted {
            return ChargeOutcome::CallsExhausted;
        }
        calls_remaining = Some(charge.remaining);
    }
    ChargeOutcome::Ok(Grant {
        scope: String::new(),
        tier: valid.tier.clone(),
        calls_remaining,
        budget_remaining: None,
    })
}

fn capability_reject(route: &CompiledRoute, err: &TokenError) -> Decision {
    // Signature/structure problems are 401 (not a credential); a structurally
    // sound but expired/over-delegated token is 403 (a credential that does
    // not suffice).
    let (status, error) = match err {
        TokenError::Malformed(_)
        | TokenError::BadSignature
        | TokenError::UnknownCaveat(_)
        | TokenError::InvalidCaveat(_)
        | TokenError::MissingExpiry => (401, "invalid_token"),
        TokenError::Expired(_) => (403, "token_expired"),
        TokenError::DelegationTooDeep(_, _) => (403, "delegation_too_deep"),
        TokenError::MissingProof | TokenError::BadProof => (401, "invalid_token"),
        TokenError::WidenedDelegation(_) => (403, "invalid_delegation"),
    };
    Decision::Deny {
        route: Some(route.name.clone()),
        status,
        error,
        message: err.to_string(),
    }
}

fn internal_deny(route: &CompiledRoute, message: &str) -> Decision {
    Decision::Deny {
        route: Some(route.name.clone()),
        status: 500,
        error: "internal_error",
        message: message.to_string(),
    }
}

fn reject_reason(err: &TokenError) -> &'static str {
    match err {
        TokenError::Malformed(_) => "malformed",
        TokenError::BadSignature => "bad_signature",
        TokenError::UnknownCaveat(_) => "unknown_caveat",
        TokenError::InvalidCaveat(_) => "invalid_caveat",
        TokenError::Expired(_) => "expired",
        TokenError::MissingExpiry => "missing_expiry",
        TokenError::MissingProof => "missing_proof",
        TokenError::BadProof => "bad_proof",
        TokenError::WidenedDelegation(_) => "widened_delegation",
        TokenError::DelegationTooDeep(_, _) => "delegation_too_deep",
    }
}

fn min_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (x, None) | (None, x) => x,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l402_header_parsing() {
        assert_eq!(
            parse_l402_credentials("L402 tok:abcd"),
            Some(("tok".to_string(), "abcd".to_string()))
        );
        assert_eq!(
            parse_l402_credentials("LSAT tok:abcd"),
            Some(("tok".to_string(), "abcd".to_string()))
        );
        assert!(parse_l402_credentials("L402 tok").is_none());
        assert!(parse_l402_credentials("L402 :abcd").is_none());
        assert!(parse_l402_credentials("Basic dXNlcjpwYXNz").is_none());
    }

    #[test]
    fn capability_header_parsing() {
        assert_eq!(
            parse_capability_credentials("Capability tok"),
            Some("tok".to_string())
        );
        assert_eq!(
            parse_capability_credentials("Bearer tok"),
            Some("tok".to_string())
        );
        assert!(parse_capability_credentials("Capability ").is_none());
        assert!(parse_capability_credentials("L402 tok:p").is_none());
    }
}
