//! Lightning backend interface.
//!
//! The gateway only needs three capabilities from a Lightning node: create an
//! invoice, report whether a payment hash has settled, and report its own
//! health. Proof-of-payment checking is deliberately *not* a backend method:
//! a preimage either hashes to the bound payment hash or it does not, so
//! [`verify_preimage`] is pure and validation never performs I/O.

use std::future::Future;

use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::LightningError;

/// A freshly created invoice.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Invoice {
    /// BOLT11 payment request to present to the payer.
    pub payment_request: String,
    /// Hex-encoded payment hash the invoice settles against.
    pub payment_hash: String,
}

/// Settlement state of a payment hash.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PaymentStatus {
    pub paid: bool,
    pub preimage: Option<String>,
}

/// Backend liveness report.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackendStatus {
    pub ok: bool,
    pub detail: String,
}

/// The capability the gateway requires from any Lightning implementation.
pub trait LightningBackend: Send + Sync {
    /// Create an invoice for `amount_sats`, expiring after `expiry_secs`.
    fn create_invoice(
        &self,
        amount_sats: u64,
        memo: &str,
        expiry_secs: u64,
    ) -> impl Future<Output = Result<Invoice, LightningError>> + Send;

    /// Report settlement state for a payment hash.
    fn check_payment(
        &self,
        payment_hash: &str,
    ) -> impl Future<Output = Result<PaymentStatus, LightningError>> + Send;

    /// Backend health, surfaced by the gateway's health endpoint.
    fn status(&self) -> impl Future<Output = Result<BackendStatus, LightningError>> + Send;
}

/// Check a payment proof: `sha256(preimage) == payment_hash`.
///
/// Both arguments are hex. Malformed hex never verifies.
pub fn verify_preimage(proof_hex: &str, payment_hash_hex: &str) -> bool {
    let Ok(preimage) = hex::decode(proof_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(payment_hash_hex) else {
        return false;
    };
    let digest = Sha256::digest(&preimage);
    crate::security::constant_time_eq(&digest, &expected)
}

/// In-process backend for dev mode and tests.
///
/// Invoices are fabricated; every invoice is considered settled immediately
/// and its preimage is retrievable, so the full challenge/pay/retry loop can
/// run without a node.
#[derive(Debug, Default)]
pub struct MockBackend {
    preimages: DashMap<String, String>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the preimage for a previously created invoice. Test helper.
    pub fn preimage_for(&self, payment_hash: &str) -> Option<String> {
        self.preimages.get(payment_hash).map(|p| p.clone())
    }
}

impl LightningBackend for MockBackend {
    async fn create_invoice(
        &self,
        amount_sats: u64,
        _memo: &str,
        _expiry_secs: u64,
    ) -> Result<Invoice, LightningError> {
        let mut preimage = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut preimage);
        let payment_hash = hex::encode(Sha256::digest(preimage));
        let preimage_hex = hex::encode(preimage);
        self.preimages
            .insert(payment_hash.clone(), preimage_hex);
        Ok(Invoice {
            payment_request: format!("lnmock1{}sat{}", &payment_hash[..16], amount_sats),
            payment_hash,
        })
    }

    async fn check_payment(&self, payment_hash: &str) -> Result<PaymentStatus, LightningError> {
        match self.preimages.get(payment_hash) {
            Some(preimage) => Ok(PaymentStatus {
                paid: true,
                preimage: Some(preimage.clone()),
            }),
            None => Ok(PaymentStatus {
                paid: false,
                preimage: None,
            }),
        }
    }

    async fn status(&self) -> Result<BackendStatus, LightningError> {
        Ok(BackendStatus {
            ok: true,
            detail: "mock backend".to_string(),
        })
    }
}

/// LNbits REST backend.
pub struct LnbitsBackend {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

#[derive(serde::Deserialize)]
struct LnbitsInvoice {
    payment_request: String,
    payment_hash: String,
}

#[derive(serde::Deserialize)]
struct LnbitsPayment {
    paid: bool,
    preimage: Option<String>,
}

impl LnbitsBackend {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, LightningError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| LightningError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        resp: reqwest::Response,
    ) -> Result<T, LightningError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "lnbits returned non-success");
            return Err(LightningError::Rejected(format!("status {status}")));
        }
        resp.json()
            .await
            .map_err(|e| LightningError::InvalidResponse(e.to_string()))
    }
}

impl LightningBackend for LnbitsBackend {
    async fn create_invoice(
        &self,
        amount_sats: u64,
        memo: &str,
        expiry_secs: u64,
    ) -> Result<Invoice, LightningError> {
        let resp = self
            .client
            .post(format!("{}/api/v1/payments", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .json(&serde_json::json!({
                "out": false,
                "amount": amount_sats,
                "memo": memo,
                "expiry": expiry_secs,
            }))
            .send()
            .await
            .map_err(|e| LightningError::Transport(e.to_string()))?;
        let invoice: LnbitsInvoice = self.json(resp).await?;
        Ok(Invoice {
            payment_request: invoice.payment_request,
            payment_hash: invoice.payment_hash,
        })
    }

    async fn check_payment(&self, payment_hash: &str) -> Result<PaymentStatus, LightningError> {
        let resp = self
            .client
            .get(format!("{}/api/v1/payments/{}", self.base_url, payment_hash))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| LightningError::Transport(e.to_string()))?;
        let payment: LnbitsPayment = self.json(resp).await?;
        Ok(PaymentStatus {
            paid: payment.paid,
            preimage: payment.preimage,
        })
    }

    async fn status(&self) -> Result<BackendStatus, LightningError> {
        let resp = self
            .client
            .get(format!("{}/api/v1/wallet", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(|e| LightningError::Transport(e.to_string()))?;
        if resp.status().is_success() {
            Ok(BackendStatus {
                ok: true,
                detail: "lnbits reachable".to_string(),
            })
        } else {
            Ok(BackendStatus {
                ok: false,
                detail: format!("lnbits status {}", resp.status()),
            })
        }
    }
}

/// Runtime-selected backend. Keeps the trait free of `dyn` requirements
/// while letting config choose the implementation.
pub enum AnyBackend {
    Mock(MockBackend),
    Lnbits(LnbitsBackend),
}

impl LightningBackend for AnyBackend {
    async fn create_invoice(
        &self,
        amount_sats: u64,
        memo: &str,
        expiry_secs: u64,
    ) -> Result<Invoice, LightningError> {
        match self {
            AnyBackend::Mock(b) => b.create_invoice(amount_sats, memo, expiry_secs).await,
            AnyBackend::Lnbits(b) => b.create_invoice(amount_sats, memo, expiry_secs).await,
        }
    }

    async fn check_payment(&self, payment_hash: &str) -> Result<PaymentStatus, LightningError> {
        match self {
            AnyBackend::Mock(b) => b.check_payment(payment_hash).await,
            AnyBackend::Lnbits(b) => b.check_payment(payment_hash).await,
        }
    }

    async fn status(&self) -> Result<BackendStatus, LightningError> {
        match self {
            AnyBackend::Mock(b) => b.status().await,
            AnyBackend::Lnbits(b) => b.status().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_invoice_settles_with_its_own_preimage() {
        let backend = MockBackend::new();
        let invoice = backend.create_invoice(10, "test", 300).await.unwrap();
        let status = backend.check_payment(&invoice.payment_hash).await.unwrap();
        assert!(status.paid);
        let preimage = status.preimage.unwrap();
        assert!(verify_preimage(&preimage, &invoice.payment_hash));
    }

    #[test]
    fn wrong_preimage_never_verifies() {
        let preimage = hex::encode([1u8; 32]);
        let hash = hex::encode(Sha256::digest([2u8; 32]));
        assert!(!verify_preimage(&preimage, &hash));
    }

    #[test]
    fn malformed_hex_never_verifies() {
        assert!(!verify_preimage("zz", "aabb"));
        assert!(!verify_preimage("aabb", "not-hex"));
    }
}
