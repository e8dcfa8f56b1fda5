//! Macaroon bearer credentials.
//!
//! A macaroon is an identifier plus an ordered caveat list, authenticated by
//! an HMAC-SHA256 chain: `sig_0 = HMAC(root_key, identifier)` and
//! `sig_{i+1} = HMAC(sig_i, caveat_i)`. Appending a caveat only needs the
//! current signature, so a holder can attenuate offline; recomputing the
//! chain needs the root key, so only the issuer can verify.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::TokenError;
use crate::security::constant_time_eq;

type HmacSha256 = Hmac<Sha256>;

const WIRE_VERSION: u8 = 1;

/// An opaque signed bearer credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macaroon {
    pub identifier: String,
    pub caveats: Vec<String>,
    pub signature: [u8; 32],
}

fn chain_step(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

impl Macaroon {
    /// Mint a fresh macaroon over `identifier` with the given caveats.
    pub fn mint<I, S>(root_key: &[u8; 32], identifier: &str, caveats: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut mac = Macaroon {
            identifier: identifier.to_string(),
            caveats: Vec::new(),
            signature: chain_step(root_key, identifier.as_bytes()),
        };
        for caveat in caveats {
            mac = mac.attenuate(&caveat.into());
        }
        mac
    }

    /// Append a caveat, extending the signature chain. No root key needed —
    /// this is the attenuation property delegation relies on.
    #[must_use]
    pub fn attenuate(&self, caveat: &str) -> Self {
        let mut caveats = self.caveats.clone();
        caveats.push(caveat.to_string());
        Macaroon {
            identifier: self.identifier.clone(),
            caveats,
            signature: chain_step(&self.signature, caveat.as_bytes()),
        }
    }

    /// Recompute the chain against the root key and compare in constant time.
    pub fn verify_signature(&self, root_key: &[u8; 32]) -> bool {
        let mut sig = chain_step(root_key, self.identifier.as_bytes());
        for caveat in &self.caveats {
            sig = chain_step(&sig, caveat.as_bytes());
        }
        constant_time_eq(&sig, &self.signature)
    }

    /// Serialize to the opaque wire form (URL-safe base64 over JSON).
    pub fn encode(&self) -> String {
        let wire = Wire {
            v: WIRE_VERSION,
            id: self.identifier.clone(),
            c: self.caveats.clone(),
            s: hex::encode(self.signature),
        };
        let json = serde_json::to_vec(&wire).expect("wire form is always serializable");
        base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, json)
    }

    /// Decode the opaque wire form. Any structural defect is `Malformed`.
    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let bytes =
            base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, token)
                .map_err(|_| TokenError::Malformed("not base64".to_string()))?;
        let wire: Wire = serde_json::from_slice(&bytes)
            .map_err(|_| TokenError::Malformed("not a token envelope".to_string()))?;
        if wire.v != WIRE_VERSION {
            return Err(TokenError::Malformed(format!(
                "unsupported token version {}",
                wire.v
            )));
        }
        let sig = hex::decode(&wire.s)
            .map_err(|_| TokenError::Malformed("signature is not hex".to_string()))?;
        let signature: [u8; 32] = sig
            .try_into()
            .map_err(|_| TokenError::Malformed("signature length".to_string()))?;
        Ok(Macaroon {
            identifier: wire.id,
            caveats: wire.c,
            signature,
        })
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Wire {
    v: u8,
    id: String,
    c: Vec<String>,
    s: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [42u8; 32];

    #[test]
    fn mint_and_verify() {
        let mac = Macaroon::mint(&KEY, "tok-1", ["scope=api:basic:read", "expires_at=99"]);
        assert!(mac.verify_signature(&KEY));
        assert!(!mac.verify_signature(&[43u8; 32]));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mac = Macaroon::mint(&KEY, "tok-2", ["tier=micro"]);
        let decoded = Macaroon::decode(&mac.encode()).unwrap();
        assert_eq!(decoded, mac);
        assert!(decoded.verify_signature(&KEY));
    }

    #[test]
    fn attenuation_extends_chain_without_root_key() {
        let parent = Macaroon::mint(&KEY, "tok-3", ["scope=api:*"]);
        let child = parent.attenuate("scope=api:basic:read");
        // Derived without the key, still verifies against it.
        assert!(child.verify_signature(&KEY));
        assert_eq!(child.caveats.len(), 2);
    }

    #[test]
    fn tampered_caveat_breaks_signature() {
        let mac = Macaroon::mint(&KEY, "tok-4", ["max_calls=10"]);
        let mut forged = mac.clone();
        forged.caveats[0] = "max_calls=10000".to_string();
        assert!(!forged.verify_signature(&KEY));
    }

    #[test]
    fn dropped_caveat_breaks_signature() {
        let mac = Macaroon::mint(&KEY, "tok-5", ["scope=api:basic:read", "max_calls=1"]);
        let mut forged = mac.clone();
        forged.caveats.pop();
        assert!(!forged.verify_signature(&KEY));
    }

    #[test]
    fn garbage_does_not_decode() {
        assert!(Macaroon::decode("not a token").is_err());
        assert!(Macaroon::decode("bm90IGpzb24").is_err());
    }
}
