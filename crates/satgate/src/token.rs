//! The token service: challenge minting, validation, and delegation.
//!
//! Constructed once per process with the root signing key and passed by
//! reference into the gateway — there is no global token state. All the
//! authority a token carries lives in its caveat chain; validation consults
//! nothing but the root key, the chain, and (for payment-bound tokens) the
//! presented preimage.

use rand::RngCore;

use crate::caveat::{scope_grants, scope_narrows, Caveat};
use crate::error::TokenError;
use crate::lightning::{verify_preimage, LightningBackend};
use crate::macaroon::Macaroon;

/// Issuance defaults, from the gateway's `l402` config section.
#[derive(Debug, Clone)]
pub struct TokenDefaults {
    pub ttl_secs: u64,
    pub max_delegation_depth: u32,
}

impl Default for TokenDefaults {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_delegation_depth: 4,
        }
    }
}

/// A fresh payment challenge: the token to hold and the invoice to pay.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub token: String,
    pub invoice: String,
    pub payment_hash: String,
    pub expires_at: i64,
}

/// Restrictions to apply when deriving a sub-token. Every field may only
/// narrow the parent; anything that would widen is rejected.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Delegation {
    pub scope: Option<String>,
    pub expires_at: Option<i64>,
    pub max_calls: Option<u64>,
    pub budget_sats: Option<u64>,
    pub delegated_by: Option<String>,
}

/// The effective authority of a verified token: the most restrictive value
/// of each caveat kind across the whole chain.
#[derive(Debug, Clone)]
pub struct ValidToken {
    /// Hex of the chain signature. Stable per token, used as the meter key.
    pub signature: String,
    pub scopes: Vec<String>,
    pub tier: Option<String>,
    pub expires_at: i64,
    pub max_calls: Option<u64>,
    pub budget_sats: Option<u64>,
    pub payment_bound: bool,
    pub delegation_depth: u32,
}

impl ValidToken {
    /// True only when every scope caveat in the chain grants the required
    /// scope — a delegated caveat can therefore only narrow, never widen.
    pub fn grants(&self, required: &str) -> bool {
        !self.scopes.is_empty() && self.scopes.iter().all(|s| scope_grants(s, required))
    }

    /// Seconds of validity remaining. Meter entries inherit this as TTL.
    pub fn ttl_from(&self, now: i64) -> i64 {
        self.expires_at - now
    }
}

/// Effective caveat fold, shared between validation and delegation.
struct Effective {
    payment_hash: Option<String>,
    expires_at: Option<i64>,
    scopes: Vec<String>,
    tier: Option<String>,
    max_calls: Option<u64>,
    budget_sats: Option<u64>,
    delegation_depth: u32,
}

fn fold_caveats(mac: &Macaroon) -> Result<Effective, TokenError> {
    let mut eff = Effective {
        payment_hash: None,
        expires_at: None,
        scopes: Vec::new(),
        tier: None,
        max_calls: None,
        budget_sats: None,
        delegation_depth: 0,
    };
    for raw in &mac.caveats {
        match Caveat::parse(raw)? {
            Caveat::PaymentHash(h) => {
                eff.payment_hash.get_or_insert(h);
            }
            Caveat::ExpiresAt(t) => {
                eff.expires_at = Some(eff.expires_at.map_or(t, |cur| cur.min(t)));
            }
            Caveat::Scope(s) => eff.scopes.push(s),
            Caveat::Tier(t) => {
                eff.tier.get_or_insert(t);
            }
            Caveat::MaxCalls(n) => {
                eff.max_calls = Some(eff.max_calls.map_or(n, |cur| cur.min(n)));
            }
            Caveat::BudgetSats(n) => {
                eff.budget_sats = Some(eff.budget_sats.map_or(n, |cur| cur.min(n)));
            }
            Caveat::DelegationDepth(d) => {
                eff.delegation_depth = eff.delegation_depth.max(d);
            }
            Caveat::DelegatedBy(_) | Caveat::DelegationTime(_) => {}
        }
    }
    Ok(eff)
}

/// Mints, validates, and delegates macaroon tokens against one root key.
pub struct TokenService {
    root_key: [u8; 32],
    defaults: TokenDefaults,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("root_key", &"[REDACTED]")
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl TokenService {
    pub fn new(root_key: [u8; 32], defaults: TokenDefaults) -> Self {
        Self { root_key, defaults }
    }

    /// Request an invoice and mint the macaroon bound to its payment hash.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_challenge<B: LightningBackend>(
        &self,
        backend: &B,
        tier: &str,
        price_sats: u64,
        scope: &str,
        ttl_secs: Option<u64>,
        max_calls: Option<u64>,
        budget_sats: Option<u64>,
    ) -> Result<Challenge, crate::error::LightningError> {
        let ttl = ttl_secs.unwrap_or(self.defaults.ttl_secs);
        let memo = format!("satgate {tier} {scope}");
        let invoice = backend.create_invoice(price_sats, &memo, ttl).await?;
        let expires_at = unix_now() + ttl as i64;

        // Short machine-stable identifier derived from the payment hash.
        let identifier = format!("l402-{}", &invoice.payment_hash[..16.min(invoice.payment_hash.len())]);

        let mut caveats = vec![
            Caveat::PaymentHash(invoice.payment_hash.clone()).to_string(),
            Caveat::ExpiresAt(expires_at).to_string(),
            Caveat::Scope(scope.to_string()).to_string(),
            Caveat::Tier(tier.to_string()).to_string(),
        ];
        if let Some(n) = max_calls {
            caveats.push(Caveat::MaxCalls(n).to_string());
        }
        if let Some(n) = budget_sats {
            caveats.push(Caveat::BudgetSats(n).to_string());
        }

        let mac = Macaroon::mint(&self.root_key, &identifier, caveats);
        Ok(Challenge {
            token: mac.encode(),
            invoice: invoice.payment_request,
            payment_hash: invoice.payment_hash,
            expires_at,
        })
    }

    /// Mint a payment-free capability token. Admin-plane operation.
    pub fn mint_capability(
        &self,
        scope: &str,
        ttl_secs: Option<u64>,
        max_calls: Option<u64>,
    ) -> Macaroon {
        let mut id_bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let identifier = format!("cap-{}", hex::encode(id_bytes));
        let expires_at = unix_now() + ttl_secs.unwrap_or(self.defaults.ttl_secs) as i64;

        let mut caveats = vec![
            Caveat::ExpiresAt(expires_at).to_string(),
            Caveat::Scope(scope.to_string()).to_string(),
        ];
        if let Some(n) = max_calls {
            caveats.push(Caveat::MaxCalls(n).to_string());
        }
        Macaroon::mint(&self.root_key, &identifier, caveats)
    }

    /// Verify a presented token, returning its effective authority.
    ///
    /// Order matters: signature first (nothing in an unsigned token can be
    /// trusted, including its caveats), then the closed-world caveat parse,
    /// then expiry, depth, and payment proof.
    pub fn validate(
        &self,
        token: &str,
        proof: Option<&str>,
        now: i64,
    ) -> Result<ValidToken, TokenError> {
        let mac = Macaroon::decode(token)?;
        if !mac.verify_signature(&self.root_key) {
            return Err(TokenError::BadSignature);
        }
        let eff = fold_caveats(&mac)?;

        let expires_at = eff.expires_at.ok_or(TokenError::MissingExpiry)?;
        if expires_at <= now {
            return Err(TokenError::Expired(expires_at));
        }
        if eff.delegation_depth > self.defaults.max_delegation_depth {
            return Err(TokenError::DelegationTooDeep(
                eff.delegation_depth,
                self.defaults.max_delegation_depth,
            ));
        }

        let payment_bound = eff.payment_hash.is_some();
        if let Some(ref hash) = eff.payment_hash {
            let proof = proof.ok_or(TokenError::MissingProof)?;
            if !verify_preimage(proof, hash) {
                return Err(TokenError::BadProof);
            }
        }

        Ok(ValidToken {
            signature: hex::encode(mac.signature),
            scopes: eff.scopes,
            tier: eff.tier,
            expires_at,
            max_calls: eff.max_calls,
            budget_sats: eff.budget_sats,
            payment_bound,
            delegation_depth: eff.delegation_depth,
        })
    }

    /// Derive a sub-token. Every restriction must narrow the parent; the
    /// chain signature is extended without touching the root key.
    pub fn delegate(
        &self,
        token: &str,
        delegation: &Delegation,
        now: i64,
    ) -> Result<Macaroon, TokenError> {
        let mac = Macaroon::decode(token)?;
        if !mac.verify_signature(&self.root_key) {
            return Err(TokenError::BadSignature);
        }
        let eff = fold_caveats(&mac)?;

        let parent_expiry = eff.expires_at.ok_or(TokenError::MissingExpiry)?;
        if parent_expiry <= now {
            return Err(TokenError::Expired(parent_expiry));
        }

        let depth = eff.delegation_depth + 1;
        if depth > self.defaults.max_delegation_depth {
            return Err(TokenError::DelegationTooDeep(
                depth,
                self.defaults.max_delegation_depth,
            ));
        }

        if let Some(e) = delegation.expires_at {
            if e > parent_expiry {
                return Err(TokenError::WidenedDelegation("expiry"));
            }
        }
        if let Some(m) = delegation.max_calls {
            if eff.max_calls.is_some_and(|parent| m > parent) {
                return Err(TokenError::WidenedDelegation("max_calls"));
            }
        }
        if let Some(b) = delegation.budget_sats {
            if eff.budget_sats.is_some_and(|parent| b > parent) {
                return Err(TokenError::WidenedDelegation("budget_sats"));
            }
        }
        if let Some(ref scope) = delegation.scope {
            // A scope can only be added under an existing one, and must be a
            // subset of every scope already in the chain.
            if eff.scopes.is_empty() || !eff.scopes.iter().all(|p| scope_narrows(scope, p)) {
                return Err(TokenError::WidenedDelegation("scope"));
            }
        }

        let by = delegation.delegated_by.as_deref().unwrap_or("holder");
        let mut child = mac
            .attenuate(&Caveat::DelegatedBy(by.to_string()).to_string())
            .attenuate(&Caveat::DelegationDepth(depth).to_string())
            .attenuate(&Caveat::DelegationTime(now).to_string());
        if let Some(e) = delegation.expires_at {
            child = child.attenuate(&Caveat::ExpiresAt(e).to_string());
        }
        if let Some(ref s) = delegation.scope {
            child = child.attenuate(&Caveat::Scope(s.clone()).to_string());
        }
        if let Some(m) = delegation.max_calls {
            child = child.attenuate(&Caveat::MaxCalls(m).to_string());
        }
        if let Some(b) = delegation.budget_sats {
            child = child.attenuate(&Caveat::BudgetSats(b).to_string());
        }
        Ok(child)
    }
}

pub(crate) fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
