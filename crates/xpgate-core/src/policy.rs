//! Reward policies: the raw configuration document, its validated form and
//! the store that publishes validated versions.
//!
//! A [`PolicyDocument`] is what configuration loading produces. Turning it
//! into a [`Policy`] is the only place validation happens; once a `Policy`
//! exists it is known to be well-formed and the engine never re-checks it.
//! The [`PolicyStore`] swaps whole versions atomically, so readers see
//! either the old or the new version, never a mix.

use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::decision::RewardType;
use crate::persona::Persona;

/// Number of buckets users are spread over for reward type selection.
const REWARD_BUCKETS: u64 = 10_000;
/// Reward values are truncated to this many decimal places.
const REWARD_VALUE_DP: u32 = 2;
const DEFAULT_CHECKOUT_RATE: Decimal = Decimal::from_parts(5, 0, 0, false, 2);
const DEFAULT_GOLD_RATE: Decimal = Decimal::from_parts(2, 0, 0, false, 2);
const DEFAULT_COOLDOWN_HOURS: u32 = 24;

/// A policy version was rejected before publication.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("policy version must not be empty")]
    EmptyVersion,
    #[error("unknown persona '{0}'")]
    UnknownPersona(String),
    #[error("{table} lists persona {persona} more than once")]
    DuplicatePersona {
        table: &'static str,
        persona: Persona,
    },
    #[error("{table} has no entry for persona {persona}")]
    MissingPersona {
        table: &'static str,
        persona: Persona,
    },
    #[error("multiplier for {persona} must be > 0, got {value}")]
    NonPositiveMultiplier { persona: Persona, value: Decimal },
    #[error("daily cap for {persona} must be >= 0, got {value}")]
    NegativeCap { persona: Persona, value: Decimal },
    #[error("xp_per_currency_unit must be >= 0, got {0}")]
    NegativeXpRate(Decimal),
    #[error("unknown reward type '{0}'")]
    UnknownRewardType(String),
    #[error("reward type {0} is listed more than once")]
    DuplicateRewardType(RewardType),
    #[error("weight for {reward_type} must be >= 0, got {value}")]
    NegativeWeight {
        reward_type: RewardType,
        value: Decimal,
    },
    #[error("reward type weights must sum to a positive value")]
    ZeroWeightSum,
    #[error("rate for {reward_type} must be >= 0, got {value}")]
    NegativeRate {
        reward_type: RewardType,
        value: Decimal,
    },
    #[error("XP rewards carry no monetary rate, got {0}")]
    XpRewardHasRate(Decimal),
    #[error("cooldown_hours must be > 0 when the cooldown is enabled")]
    InvalidCooldown,
    #[error("policy version '{0}' is already published with different content")]
    VersionReuse(String),
}

/// Unit the daily cap is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapBasis {
    /// Currency-equivalent reward value.
    #[default]
    RewardValue,
    Xp,
}

/// Raw policy configuration, as parsed from JSON or TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: String,
    #[serde(default = "default_reward_types")]
    pub reward_types: BTreeMap<String, RewardTypeConfig>,
    pub xp: XpSection,
    pub cac: CacSection,
    #[serde(default)]
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardTypeConfig {
    pub weight: Decimal,
    /// Share of the transaction amount paid out. Defaults per type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XpSection {
    #[serde(alias = "xp_per_rupee")]
    pub xp_per_currency_unit: Decimal,
    #[serde(alias = "max_xp_per_txn")]
    pub max_xp_per_transaction: u64,
    pub persona_multipliers: BTreeMap<String, Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacSection {
    pub daily_cap_per_persona: BTreeMap<String, Decimal>,
    /// Keep the formula XP when the monetary reward is withheld. Off means a
    /// withheld reward carries no XP either.
    #[serde(default)]
    pub fallback_to_xp: bool,
    #[serde(default)]
    pub cap_basis: CapBasis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub prefer_xp_mode: bool,
    #[serde(default)]
    pub cooldown_enabled: bool,
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: u32,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            prefer_xp_mode: false,
            cooldown_enabled: false,
            cooldown_hours: DEFAULT_COOLDOWN_HOURS,
        }
    }
}

fn default_cooldown_hours() -> u32 {
    DEFAULT_COOLDOWN_HOURS
}

fn default_reward_types() -> BTreeMap<String, RewardTypeConfig> {
    [
        (RewardType::Xp, Decimal::new(7, 1)),
        (RewardType::Checkout, Decimal::new(2, 1)),
        (RewardType::Gold, Decimal::new(1, 1)),
    ]
    .into_iter()
    .map(|(reward_type, weight)| {
        (
            reward_type.as_str().to_string(),
            RewardTypeConfig { weight, rate: None },
        )
    })
    .collect()
}

fn persona_map(new: i64, returning: i64, power: i64, scale: u32) -> BTreeMap<String, Decimal> {
    [
        (Persona::New, new),
        (Persona::Returning, returning),
        (Persona::Power, power),
    ]
    .into_iter()
    .map(|(p, v)| (p.as_str().to_string(), Decimal::new(v, scale)))
    .collect()
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            version: "v1.0.0".to_string(),
            reward_types: default_reward_types(),
            xp: XpSection {
                xp_per_currency_unit: Decimal::new(1, 1),
                max_xp_per_transaction: 500,
                persona_multipliers: persona_map(10, 15, 20, 1),
            },
            cac: CacSection {
                daily_cap_per_persona: persona_map(0, 1000, 5000, 0),
                fallback_to_xp: false,
                cap_basis: CapBasis::RewardValue,
            },
            features: FeatureFlags::default(),
        }
    }
}

/// One value per persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PersonaTable<T> {
    new: T,
    returning: T,
    power: T,
}

impl<T: Copy> PersonaTable<T> {
    fn get(&self, persona: Persona) -> T {
        match persona {
            Persona::New => self.new,
            Persona::Returning => self.returning,
            Persona::Power => self.power,
        }
    }
}

/// One value per reward type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RewardTable<T> {
    xp: T,
    checkout: T,
    gold: T,
}

impl<T: Copy> RewardTable<T> {
    fn get(&self, reward_type: RewardType) -> T {
        match reward_type {
            RewardType::Xp => self.xp,
            RewardType::Checkout => self.checkout,
            RewardType::Gold => self.gold,
        }
    }
}

/// Result of the XP formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XpComputation {
    pub xp: u64,
    /// The per-transaction ceiling cut the raw value.
    pub capped: bool,
}

/// A validated, immutable policy version.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    version: String,
    xp_per_currency_unit: Decimal,
    max_xp_per_transaction: u64,
    multipliers: PersonaTable<Decimal>,
    daily_caps: PersonaTable<Decimal>,
    weights: RewardTable<Decimal>,
    rates: RewardTable<Decimal>,
    cap_basis: CapBasis,
    fallback_to_xp: bool,
    prefer_xp_mode: bool,
    cooldown_hours: Option<u32>,
}

fn persona_table(
    table: &'static str,
    raw: &BTreeMap<String, Decimal>,
) -> Result<PersonaTable<Decimal>, PolicyError> {
    let mut values: BTreeMap<Persona, Decimal> = BTreeMap::new();
    for (name, value) in raw {
        let persona = parse_persona(name)?;
        if values.insert(persona, *value).is_some() {
            return Err(PolicyError::DuplicatePersona { table, persona });
        }
    }
    let lookup = |persona: Persona| {
        values
            .get(&persona)
            .copied()
            .ok_or(PolicyError::MissingPersona { table, persona })
    };
    Ok(PersonaTable {
        new: lookup(Persona::New)?,
        returning: lookup(Persona::Returning)?,
        power: lookup(Persona::Power)?,
    })
}

fn parse_persona(name: &str) -> Result<Persona, PolicyError> {
    Persona::ALL
        .into_iter()
        .find(|p| p.as_str().eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| PolicyError::UnknownPersona(name.to_string()))
}

fn parse_reward_type(name: &str) -> Result<RewardType, PolicyError> {
    RewardType::ALL
        .into_iter()
        .find(|t| t.as_str().eq_ignore_ascii_case(name.trim()))
        .ok_or_else(|| PolicyError::UnknownRewardType(name.to_string()))
}

impl TryFrom<&PolicyDocument> for Policy {
    type Error = PolicyError;

    fn try_from(doc: &PolicyDocument) -> Result<Self, Self::Error> {
        Policy::from_document(doc)
    }
}

impl Policy {
    /// Validates a document into a publishable policy.
    ///
    /// # Errors
    ///
    /// Returns the first [`PolicyError`] found.
    pub fn from_document(doc: &PolicyDocument) -> Result<Self, PolicyError> {
        let version = doc.version.trim();
        if version.is_empty() {
            return Err(PolicyError::EmptyVersion);
        }
        if doc.xp.xp_per_currency_unit.is_sign_negative() && !doc.xp.xp_per_currency_unit.is_zero()
        {
            return Err(PolicyError::NegativeXpRate(doc.xp.xp_per_currency_unit));
        }

        let multipliers = persona_table("persona_multipliers", &doc.xp.persona_multipliers)?;
        for persona in Persona::ALL {
            let value = multipliers.get(persona);
            if value <= Decimal::ZERO {
                return Err(PolicyError::NonPositiveMultiplier { persona, value });
            }
        }

        let daily_caps = persona_table("daily_cap_per_persona", &doc.cac.daily_cap_per_persona)?;
        for persona in Persona::ALL {
            let value = daily_caps.get(persona);
            if value < Decimal::ZERO {
                return Err(PolicyError::NegativeCap { persona, value });
            }
        }

        let mut weights = RewardTable {
            xp: Decimal::ZERO,
            checkout: Decimal::ZERO,
            gold: Decimal::ZERO,
        };
        let mut rates = RewardTable {
            xp: Decimal::ZERO,
            checkout: DEFAULT_CHECKOUT_RATE,
            gold: DEFAULT_GOLD_RATE,
        };
        let mut seen = Vec::with_capacity(RewardType::ALL.len());
        for (name, config) in &doc.reward_types {
            let reward_type = parse_reward_type(name)?;
            if seen.contains(&reward_type) {
                return Err(PolicyError::DuplicateRewardType(reward_type));
            }
            seen.push(reward_type);
            if config.weight < Decimal::ZERO {
                return Err(PolicyError::NegativeWeight {
                    reward_type,
                    value: config.weight,
                });
            }
            let slot = match reward_type {
                RewardType::Xp => &mut weights.xp,
                RewardType::Checkout => &mut weights.checkout,
                RewardType::Gold => &mut weights.gold,
            };
            *slot = config.weight;

            if let Some(rate) = config.rate {
                if rate < Decimal::ZERO {
                    return Err(PolicyError::NegativeRate {
                        reward_type,
                        value: rate,
                    });
                }
                match reward_type {
                    RewardType::Xp if !rate.is_zero() => {
                        return Err(PolicyError::XpRewardHasRate(rate))
                    }
                    RewardType::Xp => {}
                    RewardType::Checkout => rates.checkout = rate,
                    RewardType::Gold => rates.gold = rate,
                }
            }
        }
        if weights.xp + weights.checkout + weights.gold <= Decimal::ZERO {
            return Err(PolicyError::ZeroWeightSum);
        }

        let cooldown_hours = if doc.features.cooldown_enabled {
            if doc.features.cooldown_hours == 0 {
                return Err(PolicyError::InvalidCooldown);
            }
            Some(doc.features.cooldown_hours)
        } else {
            None
        };

        Ok(Self {
            version: version.to_string(),
            xp_per_currency_unit: doc.xp.xp_per_currency_unit,
            max_xp_per_transaction: doc.xp.max_xp_per_transaction,
            multipliers,
            daily_caps,
            weights,
            rates,
            cap_basis: doc.cac.cap_basis,
            fallback_to_xp: doc.cac.fallback_to_xp,
            prefer_xp_mode: doc.features.prefer_xp_mode,
            cooldown_hours,
        })
    }

    /// Renders the policy back into document form, e.g. for inspection.
    #[must_use]
    pub fn to_document(&self) -> PolicyDocument {
        let table = |t: &PersonaTable<Decimal>| -> BTreeMap<String, Decimal> {
            Persona::ALL
                .into_iter()
                .map(|p| (p.as_str().to_string(), t.get(p)))
                .collect()
        };
        PolicyDocument {
            version: self.version.clone(),
            reward_types: RewardType::ALL
                .into_iter()
                .map(|t| {
                    let rate = match t {
                        RewardType::Xp => None,
                        _ => Some(self.rates.get(t)),
                    };
                    (
                        t.as_str().to_string(),
                        RewardTypeConfig {
                            weight: self.weights.get(t),
                            rate,
                        },
                    )
                })
                .collect(),
            xp: XpSection {
                xp_per_currency_unit: self.xp_per_currency_unit,
                max_xp_per_transaction: self.max_xp_per_transaction,
                persona_multipliers: table(&self.multipliers),
            },
            cac: CacSection {
                daily_cap_per_persona: table(&self.daily_caps),
                fallback_to_xp: self.fallback_to_xp,
                cap_basis: self.cap_basis,
            },
            features: FeatureFlags {
                prefer_xp_mode: self.prefer_xp_mode,
                cooldown_enabled: self.cooldown_hours.is_some(),
                cooldown_hours: self.cooldown_hours.unwrap_or(DEFAULT_COOLDOWN_HOURS),
            },
        }
    }

    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    #[must_use]
    pub fn xp_per_currency_unit(&self) -> Decimal {
        self.xp_per_currency_unit
    }

    #[must_use]
    pub fn max_xp_per_transaction(&self) -> u64 {
        self.max_xp_per_transaction
    }

    #[must_use]
    pub fn multiplier(&self, persona: Persona) -> Decimal {
        self.multipliers.get(persona)
    }

    #[must_use]
    pub fn daily_cap(&self, persona: Persona) -> Decimal {
        self.daily_caps.get(persona)
    }

    #[must_use]
    pub fn cap_basis(&self) -> CapBasis {
        self.cap_basis
    }

    #[must_use]
    pub fn fallback_to_xp(&self) -> bool {
        self.fallback_to_xp
    }

    #[must_use]
    pub fn prefer_xp_mode(&self) -> bool {
        self.prefer_xp_mode
    }

    /// Cooldown between monetary rewards, when enabled.
    #[must_use]
    pub fn cooldown(&self) -> Option<time::Duration> {
        self.cooldown_hours
            .map(|h| time::Duration::hours(i64::from(h)))
    }

    #[must_use]
    pub fn reward_rate(&self, reward_type: RewardType) -> Decimal {
        self.rates.get(reward_type)
    }

    /// `floor(min(amount × xp_per_currency_unit × multiplier, max_xp))`.
    #[must_use]
    pub fn compute_xp(&self, amount: Decimal, multiplier: Decimal) -> XpComputation {
        let ceiling = Decimal::from(self.max_xp_per_transaction);
        let raw = amount
            .checked_mul(self.xp_per_currency_unit)
            .and_then(|v| v.checked_mul(multiplier));
        match raw {
            Some(raw) if raw <= ceiling => XpComputation {
                xp: raw.floor().to_u64().unwrap_or(0),
                capped: false,
            },
            _ => XpComputation {
                xp: self.max_xp_per_transaction,
                capped: true,
            },
        }
    }

    /// Monetary value of a reward of the given type, truncated to cents.
    #[must_use]
    pub fn reward_value(&self, reward_type: RewardType, amount: Decimal) -> Decimal {
        amount
            .checked_mul(self.rates.get(reward_type))
            .unwrap_or(Decimal::MAX)
            .round_dp_with_strategy(REWARD_VALUE_DP, RoundingStrategy::ToZero)
    }

    /// Picks the reward type for a user. The choice depends only on the user
    /// id and the weights, so it is stable across calls and processes.
    #[must_use]
    pub fn select_reward_type(&self, user_id: &str) -> RewardType {
        let digest = Sha256::digest(user_id.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let bucket = Decimal::from(u64::from_be_bytes(prefix) % REWARD_BUCKETS);

        let total = self.weights.xp + self.weights.checkout + self.weights.gold;
        let mut cumulative = Decimal::ZERO;
        for reward_type in RewardType::ALL {
            cumulative += self.weights.get(reward_type);
            let threshold = cumulative / total * Decimal::from(REWARD_BUCKETS);
            if bucket < threshold {
                return reward_type;
            }
        }
        RewardType::Xp
    }
}

impl FromStr for CapBasis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "reward_value" => Ok(Self::RewardValue),
            "xp" => Ok(Self::Xp),
            other => Err(format!("unknown cap basis '{other}'")),
        }
    }
}

/// Holder of the current policy version.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<Policy>>,
}

impl PolicyStore {
    #[must_use]
    pub fn new(policy: Policy) -> Self {
        Self {
            current: RwLock::new(Arc::new(policy)),
        }
    }

    /// Latest published version. The returned snapshot stays valid after a
    /// swap.
    #[must_use]
    pub fn current(&self) -> Arc<Policy> {
        Arc::clone(&self.current.read())
    }

    #[must_use]
    pub fn version(&self) -> String {
        self.current.read().version().to_string()
    }

    #[must_use]
    pub fn multiplier(&self, persona: Persona) -> Decimal {
        self.current.read().multiplier(persona)
    }

    #[must_use]
    pub fn daily_cap(&self, persona: Persona) -> Decimal {
        self.current.read().daily_cap(persona)
    }

    /// Atomically replaces the current version and returns the previous one.
    /// Republishing an identical policy is a no-op.
    ///
    /// # Errors
    ///
    /// [`PolicyError::VersionReuse`] if the version string is already
    /// current with different content.
    pub fn publish(&self, policy: Policy) -> Result<Arc<Policy>, PolicyError> {
        let mut current = self.current.write();
        if current.version() == policy.version() {
            if **current == policy {
                return Ok(Arc::clone(&current));
            }
            return Err(PolicyError::VersionReuse(policy.version));
        }
        Ok(std::mem::replace(&mut *current, Arc::new(policy)))
    }

    /// Validates and publishes a document. A rejected document leaves the
    /// current version in place.
    ///
    /// # Errors
    ///
    /// Any validation error, or [`PolicyError::VersionReuse`].
    pub fn publish_document(&self, doc: &PolicyDocument) -> Result<Arc<Policy>, PolicyError> {
        self.publish(Policy::from_document(doc)?)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn default_policy() -> Policy {
        Policy::from_document(&PolicyDocument::default()).expect("default policy is valid")
    }

    #[test]
    fn default_document_matches_the_reference_values() {
        let policy = default_policy();
        assert_eq!(policy.version(), "v1.0.0");
        assert_eq!(policy.xp_per_currency_unit(), Decimal::new(1, 1));
        assert_eq!(policy.max_xp_per_transaction(), 500);
        assert_eq!(policy.multiplier(Persona::Returning), Decimal::new(15, 1));
        assert_eq!(policy.daily_cap(Persona::New), Decimal::ZERO);
        assert_eq!(policy.daily_cap(Persona::Power), Decimal::new(5000, 0));
        assert_eq!(policy.reward_rate(RewardType::Checkout), Decimal::new(5, 2));
        assert!(!policy.fallback_to_xp());
        assert_eq!(policy.cooldown(), None);
    }

    #[test]
    fn xp_formula_floors_and_caps() {
        let policy = default_policy();
        let xp = policy.compute_xp(Decimal::new(1000, 0), Decimal::new(15, 1));
        assert_eq!(xp, XpComputation { xp: 150, capped: false });

        let xp = policy.compute_xp(Decimal::new(1005, 1), Decimal::new(15, 1));
        assert_eq!(xp.xp, 15);

        let xp = policy.compute_xp(Decimal::new(10_000, 0), Decimal::new(2, 0));
        assert_eq!(xp, XpComputation { xp: 500, capped: true });
    }

    #[test]
    fn reward_value_truncates_to_cents() {
        let policy = default_policy();
        assert_eq!(
            policy.reward_value(RewardType::Checkout, Decimal::new(99_999, 2)),
            Decimal::new(4999, 2)
        );
        assert_eq!(
            policy.reward_value(RewardType::Xp, Decimal::new(1000, 0)),
            Decimal::ZERO
        );
    }

    #[test]
    fn document_parses_with_original_key_aliases() {
        let doc: PolicyDocument = serde_json::from_value(json!({
            "version": "v2",
            "xp": {
                "xp_per_rupee": 0.2,
                "max_xp_per_txn": 100,
                "persona_multipliers": { "NEW": 1.0, "RETURNING": 1.5, "POWER": 2.0 }
            },
            "cac": {
                "daily_cap_per_persona": { "NEW": 0, "RETURNING": 1000, "POWER": 5000 }
            }
        }))
        .expect("document");

        let policy = Policy::from_document(&doc).expect("valid");
        assert_eq!(policy.xp_per_currency_unit(), Decimal::new(2, 1));
        assert_eq!(policy.max_xp_per_transaction(), 100);
        assert!(!policy.fallback_to_xp());
        assert_eq!(policy.cap_basis(), CapBasis::RewardValue);
    }

    #[test]
    fn validation_rejects_bad_documents() {
        let mut doc = PolicyDocument::default();
        doc.xp
            .persona_multipliers
            .insert("POWER".into(), Decimal::ZERO);
        assert!(matches!(
            Policy::from_document(&doc),
            Err(PolicyError::NonPositiveMultiplier {
                persona: Persona::Power,
                ..
            })
        ));

        let mut doc = PolicyDocument::default();
        doc.cac
            .daily_cap_per_persona
            .insert("RETURNING".into(), Decimal::new(-1, 0));
        assert!(matches!(
            Policy::from_document(&doc),
            Err(PolicyError::NegativeCap { .. })
        ));

        let mut doc = PolicyDocument::default();
        doc.cac.daily_cap_per_persona.remove("NEW");
        assert_eq!(
            Policy::from_document(&doc),
            Err(PolicyError::MissingPersona {
                table: "daily_cap_per_persona",
                persona: Persona::New
            })
        );

        let mut doc = PolicyDocument::default();
        doc.xp.xp_per_currency_unit = Decimal::new(-1, 1);
        assert!(matches!(
            Policy::from_document(&doc),
            Err(PolicyError::NegativeXpRate(_))
        ));

        let mut doc = PolicyDocument::default();
        doc.xp
            .persona_multipliers
            .insert("VIP".into(), Decimal::ONE);
        assert_eq!(
            Policy::from_document(&doc),
            Err(PolicyError::UnknownPersona("VIP".into()))
        );

        let mut doc = PolicyDocument::default();
        doc.cac
            .daily_cap_per_persona
            .insert("power".into(), Decimal::new(10, 0));
        assert_eq!(
            Policy::from_document(&doc),
            Err(PolicyError::DuplicatePersona {
                table: "daily_cap_per_persona",
                persona: Persona::Power
            })
        );

        let mut doc = PolicyDocument::default();
        doc.reward_types.insert(
            "gold".into(),
            RewardTypeConfig {
                weight: Decimal::ONE,
                rate: None,
            },
        );
        assert_eq!(
            Policy::from_document(&doc),
            Err(PolicyError::DuplicateRewardType(RewardType::Gold))
        );

        let mut doc = PolicyDocument::default();
        for config in doc.reward_types.values_mut() {
            config.weight = Decimal::ZERO;
        }
        assert_eq!(Policy::from_document(&doc), Err(PolicyError::ZeroWeightSum));

        let mut doc = PolicyDocument::default();
        doc.version = "  ".into();
        assert_eq!(Policy::from_document(&doc), Err(PolicyError::EmptyVersion));

        let mut doc = PolicyDocument::default();
        doc.features.cooldown_enabled = true;
        doc.features.cooldown_hours = 0;
        assert_eq!(
            Policy::from_document(&doc),
            Err(PolicyError::InvalidCooldown)
        );
    }

    #[test]
    fn reward_type_selection_is_stable_and_respects_weights() {
        let policy = default_policy();
        for user in ["a", "user_789", "user_cac_001"] {
            assert_eq!(
                policy.select_reward_type(user),
                policy.select_reward_type(user)
            );
        }

        let mut doc = PolicyDocument::default();
        doc.reward_types.insert(
            "GOLD".into(),
            RewardTypeConfig {
                weight: Decimal::ZERO,
                rate: None,
            },
        );
        doc.reward_types.insert(
            "XP".into(),
            RewardTypeConfig {
                weight: Decimal::ZERO,
                rate: None,
            },
        );
        let checkout_only = Policy::from_document(&doc).expect("valid");
        for i in 0..50 {
            assert_eq!(
                checkout_only.select_reward_type(&format!("user_{i}")),
                RewardType::Checkout
            );
        }
    }

    #[test]
    fn document_roundtrip_preserves_policy() {
        let mut doc = PolicyDocument::default();
        doc.features.cooldown_enabled = true;
        doc.cac.cap_basis = CapBasis::Xp;
        let policy = Policy::from_document(&doc).expect("valid");
        let again = Policy::from_document(&policy.to_document()).expect("valid");
        assert_eq!(policy, again);
    }

    #[test]
    fn store_swaps_versions_atomically() {
        let store = PolicyStore::new(default_policy());
        let before = store.current();

        let mut doc = PolicyDocument::default();
        doc.version = "v2".into();
        doc.xp
            .persona_multipliers
            .insert("RETURNING".into(), Decimal::new(3, 0));
        let previous = store.publish_document(&doc).expect("publish v2");

        assert_eq!(previous.version(), "v1.0.0");
        assert_eq!(before.version(), "v1.0.0");
        assert_eq!(before.multiplier(Persona::Returning), Decimal::new(15, 1));
        assert_eq!(store.version(), "v2");
        assert_eq!(store.multiplier(Persona::Returning), Decimal::new(3, 0));
        assert_eq!(store.daily_cap(Persona::Returning), Decimal::new(1000, 0));
    }

    #[test]
    fn store_rejects_invalid_and_reused_versions() {
        let store = PolicyStore::new(default_policy());

        let mut bad = PolicyDocument::default();
        bad.version = "v2".into();
        bad.cac
            .daily_cap_per_persona
            .insert("POWER".into(), Decimal::new(-5, 0));
        assert!(store.publish_document(&bad).is_err());
        assert_eq!(store.version(), "v1.0.0");

        let mut reused = PolicyDocument::default();
        reused.xp.max_xp_per_transaction = 1;
        assert_eq!(
            store.publish_document(&reused).map(|_| ()),
            Err(PolicyError::VersionReuse("v1.0.0".into()))
        );

        assert!(store.publish_document(&PolicyDocument::default()).is_ok());
        assert_eq!(store.current().max_xp_per_transaction(), 500);
    }
}
