//! L402 capability tokens for the SatGate payment gateway.
//!
//! Implements HTTP 402 pay-per-request using macaroon bearer tokens bound to
//! Lightning payment proofs, plus payment-free delegated capability tokens.
//!
//! # Model
//!
//! - **Macaroon** ([`Macaroon`]) — identifier + caveat chain + HMAC-SHA256
//!   chained signature. Anyone holding a token can *attenuate* it (append
//!   restricting caveats) offline; only the root key holder can mint or
//!   verify one.
//! - **Token service** ([`TokenService`]) — mints payment challenges,
//!   validates presented tokens, and derives delegated sub-tokens.
//! - **Lightning backend** ([`LightningBackend`]) — creates invoices and
//!   reports payment status. Payment *proof* checking is pure hashing
//!   ([`verify_preimage`]) and never touches the backend.
//!
//! # Quick example
//!
//! ```no_run
//! use satgate::{MockBackend, TokenService, TokenDefaults};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let root_key = [7u8; 32];
//! let service = TokenService::new(root_key, TokenDefaults::default());
//! let backend = MockBackend::new();
//!
//! let challenge = service
//!     .create_challenge(&backend, "micro", 1, "api:basic:read", None, Some(100), None)
//!     .await
//!     .unwrap();
//! println!("pay {} to use {}", challenge.invoice, challenge.token);
//! # }
//! ```

pub mod caveat;
pub mod error;
pub mod lightning;
pub mod macaroon;
pub mod security;
pub mod token;

pub use caveat::{scope_grants, scope_narrows, Caveat};
pub use error::{LightningError, TokenError};
pub use lightning::{
    verify_preimage, AnyBackend, BackendStatus, Invoice, LightningBackend, LnbitsBackend,
    MockBackend, PaymentStatus,
};
pub use macaroon::Macaroon;
pub use security::constant_time_eq;
pub use token::{Challenge, Delegation, TokenDefaults, TokenService, ValidToken};
