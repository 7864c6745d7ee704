//! Key-value backing store shared by the store-backed cache and ledger.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::ledger::Reservation;

/// Minimal set of primitives a shared store has to offer. Every mutating
/// call takes an expiry so nothing outlives its purpose.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StoreError>;

    /// Writes only when the key is absent. Returns whether the write happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Deletes the key only while it still holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Atomically adds `amount` to the decimal counter under `key` if the
    /// result stays within `cap`. A missing key counts as zero.
    async fn increment_within(
        &self,
        key: &str,
        amount: Decimal,
        cap: Decimal,
        ttl: Duration,
    ) -> Result<Reservation, StoreError>;

    /// Reads a counter maintained by [`increment_within`](Self::increment_within).
    /// A missing key counts as zero.
    async fn counter(&self, key: &str) -> Result<Decimal, StoreError> {
        match self.get(key).await? {
            Some(raw) => raw.parse().map_err(|e: rust_decimal::Error| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(Decimal::ZERO),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local [`KeyValueStore`]. Expired keys are dropped on access.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired key.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, e| e.live(now));
    }

    fn live_value(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.live(now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        Ok(Self::live_value(&mut entries, key, Instant::now()))
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if Self::live_value(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match Self::live_value(&mut entries, key, now) {
            Some(value) if value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment_within(
        &self,
        key: &str,
        amount: Decimal,
        cap: Decimal,
        ttl: Duration,
    ) -> Result<Reservation, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let current = match Self::live_value(&mut entries, key, now) {
            Some(raw) => raw.parse::<Decimal>().map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?,
            None => Decimal::ZERO,
        };

        let next = match current.checked_add(amount) {
            Some(next) if amount >= Decimal::ZERO && next <= cap => next,
            _ => {
                return Ok(Reservation {
                    accepted: false,
                    new_total: current,
                })
            }
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(Reservation {
            accepted: true,
            new_total: next,
        })
    }
}
