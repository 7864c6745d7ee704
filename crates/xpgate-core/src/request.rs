//! Incoming reward requests.
//!
//! A [`RewardRequest`] is the only input the decision pipeline accepts. It is
//! produced by whatever transport sits in front of the engine (the CLI reads
//! it from JSON lines) and is never mutated afterwards.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of transaction the reward is requested for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Purchase,
    BillPayment,
    Recharge,
    Transfer,
}

impl TransactionType {
    /// Stable wire name, also used as fingerprint input.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Purchase => "purchase",
            Self::BillPayment => "bill_payment",
            Self::Recharge => "recharge",
            Self::Transfer => "transfer",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transaction for which a reward decision is requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardRequest {
    /// Unique per logical transaction.
    pub transaction_id: String,
    pub user_id: String,
    pub merchant_id: String,
    /// Transaction amount in currency units.
    pub amount: Decimal,
    pub transaction_type: TransactionType,
    /// Optional transaction timestamp (unix seconds). Informational only:
    /// the ledger day is taken from the engine clock.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
}

/// Rejection of a malformed request. Raised before any side effect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("amount must not be negative, got {0}")]
    NegativeAmount(Decimal),
}

impl RewardRequest {
    /// Checks the request shape: non-blank identifiers and a non-negative
    /// amount.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let required = [
            ("transaction_id", &self.transaction_id),
            ("user_id", &self.user_id),
            ("merchant_id", &self.merchant_id),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField(name));
            }
        }
        if self.amount.is_sign_negative() && !self.amount.is_zero() {
            return Err(ValidationError::NegativeAmount(self.amount));
        }
        Ok(())
    }

    /// Validates and returns a copy with the identifiers trimmed. Cache,
    /// replay binding and ledger keys all derive from this form.
    ///
    /// # Errors
    ///
    /// Same as [`RewardRequest::validate`].
    pub fn normalized(&self) -> Result<RewardRequest, ValidationError> {
        self.validate()?;
        Ok(RewardRequest {
            transaction_id: self.transaction_id.trim().to_string(),
            user_id: self.user_id.trim().to_string(),
            merchant_id: self.merchant_id.trim().to_string(),
            amount: self.amount,
            transaction_type: self.transaction_type,
            ts: self.ts,
        })
    }
}
