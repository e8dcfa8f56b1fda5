//! The closed caveat vocabulary.
//!
//! Caveats travel as flat `key=value` strings inside a macaroon. The set of
//! recognized keys is fixed: parsing anything else fails, and verification
//! treats an unparseable caveat as fatal. A token is never extensible at the
//! edge.

use crate::error::TokenError;

/// A single restriction embedded in a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caveat {
    /// Hex-encoded Lightning payment hash this token is bound to.
    PaymentHash(String),
    /// UNIX timestamp after which the token is invalid.
    ExpiresAt(i64),
    /// Scope the token grants, e.g. `api:basic:read` or `api:basic:*`.
    Scope(String),
    /// Pricing tier the token was issued under.
    Tier(String),
    /// Maximum number of successful calls.
    MaxCalls(u64),
    /// Maximum spendable budget in sats.
    BudgetSats(u64),
    /// Who derived this delegated token.
    DelegatedBy(String),
    /// Length of the delegation chain this token sits at.
    DelegationDepth(u32),
    /// UNIX timestamp the delegation happened at.
    DelegationTime(i64),
}

impl Caveat {
    /// Parse a `key=value` caveat string. Unknown keys and malformed values
    /// are errors; callers must treat either as verification failure.
    pub fn parse(raw: &str) -> Result<Self, TokenError> {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| TokenError::InvalidCaveat(raw.to_string()))?;
        if value.is_empty() {
            return Err(TokenError::InvalidCaveat(raw.to_string()));
        }
        match key {
            "payment_hash" => Ok(Caveat::PaymentHash(value.to_string())),
            "expires_at" => Ok(Caveat::ExpiresAt(parse_num(raw, value)?)),
            "scope" => Ok(Caveat::Scope(value.to_string())),
            "tier" => Ok(Caveat::Tier(value.to_string())),
            "max_calls" => Ok(Caveat::MaxCalls(parse_num(raw, value)?)),
            "budget_sats" => Ok(Caveat::BudgetSats(parse_num(raw, value)?)),
            "delegated_by" => Ok(Caveat::DelegatedBy(value.to_string())),
            "delegation_depth" => Ok(Caveat::DelegationDepth(parse_num(raw, value)?)),
            "delegation_time" => Ok(Caveat::DelegationTime(parse_num(raw, value)?)),
            _ => Err(TokenError::UnknownCaveat(key.to_string())),
        }
    }
}

fn parse_num<T: std::str::FromStr>(raw: &str, value: &str) -> Result<T, TokenError> {
    value
        .parse()
        .map_err(|_| TokenError::InvalidCaveat(raw.to_string()))
}

impl std::fmt::Display for Caveat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Caveat::PaymentHash(v) => write!(f, "payment_hash={v}"),
            Caveat::ExpiresAt(v) => write!(f, "expires_at={v}"),
            Caveat::Scope(v) => write!(f, "scope={v}"),
            Caveat::Tier(v) => write!(f, "tier={v}"),
            Caveat::MaxCalls(v) => write!(f, "max_calls={v}"),
            Caveat::BudgetSats(v) => write!(f, "budget_sats={v}"),
            Caveat::DelegatedBy(v) => write!(f, "delegated_by={v}"),
            Caveat::DelegationDepth(v) => write!(f, "delegation_depth={v}"),
            Caveat::DelegationTime(v) => write!(f, "delegation_time={v}"),
        }
    }
}

/// Does a held scope satisfy a required scope?
///
/// Exact equality, or a held scope ending in `:*` matches any required scope
/// under that prefix: `api:basic:*` grants `api:basic:read`.
pub fn scope_grants(held: &str, required: &str) -> bool {
    if held == required {
        return true;
    }
    match held.strip_suffix(":*") {
        Some(prefix) => {
            required.len() > prefix.len() + 1
                && required.starts_with(prefix)
                && required.as_bytes()[prefix.len()] == b':'
        }
        None => false,
    }
}

/// Is `child` a subset of `parent`? Used to reject widening delegations.
///
/// Everything `child` can grant must also be grantable by `parent`.
pub fn scope_narrows(child: &str, parent: &str) -> bool {
    if child == parent {
        return true;
    }
    match child.strip_suffix(":*") {
        // A wildcard child narrows only a wildcard parent with a shorter prefix.
        Some(_) => scope_grants(parent, &format!("{child}x")) && parent.ends_with(":*"),
        None => scope_grants(parent, child),
    }
}
