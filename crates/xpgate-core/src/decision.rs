use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::persona::Persona;

/// Kind of reward granted with a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RewardType {
    Xp,
    Checkout,
    Gold,
}

impl RewardType {
    pub const ALL: [RewardType; 3] = [RewardType::Xp, RewardType::Checkout, RewardType::Gold];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Xp => "XP",
            Self::Checkout => "CHECKOUT",
            Self::Gold => "GOLD",
        }
    }
}

impl fmt::Display for RewardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a decision came out the way it did. Serialized as upper-case strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    NewUser,
    ReturningUser,
    PowerUser,
    /// Classification failed or timed out; treated as a new user.
    PersonaFallback,
    /// The per-transaction XP ceiling was applied.
    XpCapped,
    /// The persona's daily cap is zero.
    ZeroCacCap,
    CacCapExceeded,
    /// The ledger could not be reached; the reward was withheld.
    LedgerUnavailable,
    /// Monetary reward withheld but formula XP kept.
    XpFallback,
    CooldownActive,
    XpModeEnabled,
    CheckoutReward,
    GoldReward,
    PreferXpMode,
    CooldownPolicyEnabled,
}

impl ReasonCode {
    #[must_use]
    pub fn for_persona(persona: Persona) -> Self {
        match persona {
            Persona::New => Self::NewUser,
            Persona::Returning => Self::ReturningUser,
            Persona::Power => Self::PowerUser,
        }
    }

    #[must_use]
    pub fn for_reward_type(reward_type: RewardType) -> Self {
        match reward_type {
            RewardType::Xp => Self::XpModeEnabled,
            RewardType::Checkout => Self::CheckoutReward,
            RewardType::Gold => Self::GoldReward,
        }
    }
}

/// The outcome of one reward decision. Immutable once created and cached
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: Uuid,
    pub policy_version: String,
    pub persona: Persona,
    pub multiplier: Decimal,
    pub reward_type: RewardType,
    pub xp: u64,
    pub reward_value: Decimal,
    pub reason_codes: Vec<ReasonCode>,
    pub transaction_id: String,
    pub user_id: String,
    pub merchant_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Decision {
    #[must_use]
    pub fn has_reason(&self, code: ReasonCode) -> bool {
        self.reason_codes.contains(&code)
    }

    /// Wire representation handed back to the transport layer.
    #[must_use]
    pub fn to_response(&self) -> DecisionResponse {
        DecisionResponse::from(self)
    }
}

/// Decision as serialized for callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub decision_id: Uuid,
    pub policy_version: String,
    pub reward_type: RewardType,
    pub reward_value: Decimal,
    pub xp: u64,
    pub reason_codes: Vec<ReasonCode>,
    pub meta: DecisionMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionMeta {
    pub persona: Persona,
    pub multiplier: Decimal,
    pub transaction_id: String,
    pub user_id: String,
    pub merchant_id: String,
}

impl From<&Decision> for DecisionResponse {
    fn from(decision: &Decision) -> Self {
        Self {
            decision_id: decision.decision_id,
            policy_version: decision.policy_version.clone(),
            reward_type: decision.reward_type,
            reward_value: decision.reward_value,
            xp: decision.xp,
            reason_codes: decision.reason_codes.clone(),
            meta: DecisionMeta {
                persona: decision.persona,
                multiplier: decision.multiplier,
                transaction_id: decision.transaction_id.clone(),
                user_id: decision.user_id.clone(),
                merchant_id: decision.merchant_id.clone(),
            },
        }
    }
}
