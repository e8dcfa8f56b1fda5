use thiserror::Error;

/// Errors returned by token construction and verification.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("signature mismatch")]
    BadSignature,

    /// A caveat outside the closed vocabulary. Tokens are closed-world:
    /// anything unrecognized fails verification, it is never skipped.
    #[error("unknown caveat: {0}")]
    UnknownCaveat(String),

    #[error("invalid caveat value: {0}")]
    InvalidCaveat(String),

    #[error("token expired at {0}")]
    Expired(i64),

    #[error("token carries no expiry caveat")]
    MissingExpiry,

    #[error("payment proof required")]
    MissingProof,

    #[error("payment proof does not match payment hash")]
    BadProof,

    #[error("delegation would widen {0}")]
    WidenedDelegation(&'static str),

    #[error("delegation depth {0} exceeds maximum {1}")]
    DelegationTooDeep(u32, u32),
}

/// Errors returned by Lightning backend operations.
#[derive(Debug, Error)]
pub enum LightningError {
    #[error("backend request failed: {0}")]
    Transport(String),

    #[error("backend rejected request: {0}")]
    Rejected(String),

    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
}
