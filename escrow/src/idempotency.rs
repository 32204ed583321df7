//! Idempotency keys.
//!
//! A derived key is `<prefix>-<hex>`, where the hex part is the first 16
//! bytes of a SHA-256 over the identity, the operation fields, a random
//! nonce and a nanosecond timestamp. Two derivations never collide in
//! practice, so a replayed key means a caller deliberately resent one.
//! Callers that want retry-safety supply their own key instead.

use chrono::Utc;
use coinvault_coins::Identity;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::record::TransactionKind;

/// Bytes of the digest kept in a derived key.
const KEY_DIGEST_BYTES: usize = 16;

/// Unique identifier of one transaction attempt.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionKey(String);

impl TransactionKey {
    /// Wraps a caller-supplied key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derives a fresh key for an operation.
    ///
    /// `fields` are the operation's parameters (amounts, denominations) in a
    /// fixed order; they only add entropy and make keys traceable in logs.
    pub fn derive(identity: Identity, kind: TransactionKind, fields: &[&str]) -> Self {
        let nonce: [u8; 16] = rand::random();
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(identity.as_uuid().as_bytes());
        hasher.update(kind.as_str().as_bytes());
        for field in fields {
            hasher.update((field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        hasher.update(nonce);
        hasher.update(nanos.to_le_bytes());
        let digest = hasher.finalize();

        Self(format!(
            "{}-{}",
            kind.key_prefix(),
            hex::encode(&digest[..KEY_DIGEST_BYTES])
        ))
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes, used as the durable log's tree key.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionKey({})", self.0)
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransactionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn derived_keys_have_prefix_and_length() {
        let key = TransactionKey::derive(Identity::random(), TransactionKind::Deposit, &["500"]);
        assert!(key.as_str().starts_with("D-"));
        assert_eq!(key.as_str().len(), 2 + KEY_DIGEST_BYTES * 2);
    }

    #[test]
    fn identical_inputs_still_yield_distinct_keys() {
        let id = Identity::random();
        let keys: HashSet<TransactionKey> = (0..1_000)
            .map(|_| TransactionKey::derive(id, TransactionKind::Exchange, &["Coin_Copper", "1000", "Coin_Gold"]))
            .collect();
        assert_eq!(keys.len(), 1_000);
    }
}
