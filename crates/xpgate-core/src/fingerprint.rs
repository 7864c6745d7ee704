use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::request::RewardRequest;

const FINGERPRINT_DOMAIN_V1: &[u8] = b"xpgate.request.v1";

/// Idempotency key of a request: SHA-256 over every semantically significant
/// field, not the transaction id alone, so a conflicting replay differs from
/// a retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprints the normalized request fields.
    ///
    /// Amounts are normalized first, so `100` and `100.00` hash alike. Each
    /// field is length-prefixed to keep field boundaries unambiguous.
    #[must_use]
    pub fn of(request: &RewardRequest) -> Self {
        let amount = request.amount.normalize().to_string();
        let mut hasher = Sha256::new();
        hasher.update(FINGERPRINT_DOMAIN_V1);
        for field in [
            request.transaction_id.trim(),
            request.user_id.trim(),
            request.merchant_id.trim(),
            amount.as_str(),
            request.transaction_type.as_str(),
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wraps a fingerprint previously produced by [`Fingerprint::of`] and
    /// read back from a store.
    #[must_use]
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
