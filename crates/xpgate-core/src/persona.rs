//! Persona tiers and the classification seam.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Lifetime purchases from which a user counts as a power user.
pub const POWER_USER_MIN_PURCHASES: u32 = 10;

/// Coarse user-behavior tier driving multiplier and daily cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Persona {
    New,
    Returning,
    Power,
}

impl Persona {
    pub const ALL: [Persona; 3] = [Persona::New, Persona::Returning, Persona::Power];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Returning => "RETURNING",
            Self::Power => "POWER",
        }
    }

    /// Infers a tier from the purchase history alone.
    #[must_use]
    pub fn infer(lifetime_purchases: u32) -> Self {
        match lifetime_purchases {
            0 => Self::New,
            n if n >= POWER_USER_MIN_PURCHASES => Self::Power,
            _ => Self::Returning,
        }
    }
}

impl fmt::Display for Persona {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The classification source could not answer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("persona classification unavailable: {0}")]
pub struct ClassificationError(pub String);

/// Read-only persona lookup.
///
/// `Ok(None)` means the user is unknown; the engine then treats them as
/// [`Persona::New`].
#[async_trait]
pub trait PersonaClassifier: Send + Sync {
    async fn classify(&self, user_id: &str) -> Result<Option<Persona>, ClassificationError>;
}

/// Stored knowledge about one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonaRecord {
    /// Explicit tier. When absent the tier is inferred from
    /// `lifetime_purchases`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<Persona>,
    #[serde(default)]
    pub lifetime_purchases: u32,
    /// Unix seconds of the last monetary reward. Seeds the reward cooldown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reward_ts: Option<i64>,
}

impl PersonaRecord {
    #[must_use]
    pub fn persona(&self) -> Persona {
        self.persona
            .unwrap_or_else(|| Persona::infer(self.lifetime_purchases))
    }
}

/// In-memory persona source, typically loaded from a JSON object
/// `{ "<user_id>": { "persona": "POWER", "lifetime_purchases": 12 } }`.
#[derive(Debug, Default)]
pub struct PersonaDirectory {
    records: RwLock<HashMap<String, PersonaRecord>>,
}

impl PersonaDirectory {
    #[must_use]
    pub fn new(records: HashMap<String, PersonaRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    /// Parses a directory from its JSON representation.
    ///
    /// # Errors
    ///
    /// Fails when the JSON does not match the record shape.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let records: HashMap<String, PersonaRecord> = serde_json::from_str(json)?;
        Ok(Self::new(records))
    }

    pub fn upsert(&self, user_id: impl Into<String>, record: PersonaRecord) {
        self.records.write().insert(user_id.into(), record);
    }

    #[must_use]
    pub fn record(&self, user_id: &str) -> Option<PersonaRecord> {
        self.records.read().get(user_id).cloned()
    }

    /// Users with a known last monetary reward, with its unix time.
    #[must_use]
    pub fn last_rewards(&self) -> Vec<(String, i64)> {
        self.records
            .read()
            .iter()
            .filter_map(|(user_id, record)| {
                record.last_reward_ts.map(|ts| (user_id.clone(), ts))
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl PersonaClassifier for PersonaDirectory {
    async fn classify(&self, user_id: &str) -> Result<Option<Persona>, ClassificationError> {
        Ok(self.records.read().get(user_id).map(PersonaRecord::persona))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn inference_follows_purchase_thresholds() {
        assert_eq!(Persona::infer(0), Persona::New);
        assert_eq!(Persona::infer(1), Persona::Returning);
        assert_eq!(Persona::infer(9), Persona::Returning);
        assert_eq!(Persona::infer(10), Persona::Power);
    }

    #[test]
    fn persona_serializes_upper_case() {
        let json = serde_json::to_string(&Persona::Returning).expect("serialize");
        assert_eq!(json, "\"RETURNING\"");
        let back: Persona = serde_json::from_str("\"POWER\"").expect("deserialize");
        assert_eq!(back, Persona::Power);
    }

    #[tokio::test]
    async fn directory_classifies_known_and_unknown_users() {
        let directory = PersonaDirectory::from_json(
            r#"{
                "user_power": { "persona": "POWER" },
                "user_inferred": { "lifetime_purchases": 3 },
                "user_override": { "persona": "NEW", "lifetime_purchases": 40 }
            }"#,
        )
        .expect("directory fixture");

        assert_eq!(directory.len(), 3);
        assert_eq!(
            directory.classify("user_power").await.unwrap(),
            Some(Persona::Power)
        );
        assert_eq!(
            directory.classify("user_inferred").await.unwrap(),
            Some(Persona::Returning)
        );
        assert_eq!(
            directory.classify("user_override").await.unwrap(),
            Some(Persona::New)
        );
        assert_eq!(directory.classify("nobody").await.unwrap(), None);
    }

    #[test]
    fn last_rewards_lists_users_with_a_timestamp() {
        let directory = PersonaDirectory::from_json(
            r#"{
                "rewarded": { "persona": "POWER", "last_reward_ts": 1705745000 },
                "never": { "persona": "POWER" }
            }"#,
        )
        .expect("directory fixture");
        assert_eq!(
            directory.last_rewards(),
            vec![("rewarded".to_string(), 1_705_745_000)]
        );
    }

    #[tokio::test]
    async fn upsert_replaces_a_record() {
        let directory = PersonaDirectory::default();
        assert!(directory.is_empty());
        directory.upsert(
            "u1",
            PersonaRecord {
                persona: None,
                lifetime_purchases: 12,
                last_reward_ts: None,
            },
        );
        assert_eq!(directory.classify("u1").await.unwrap(), Some(Persona::Power));
    }
}
