//! Decision engine for xpgate.
//!
//! [`DecisionEngine`] wires a [`PolicyStore`](xpgate_core::PolicyStore), a
//! [`PersonaClassifier`](xpgate_core::PersonaClassifier), a [`SpendLedger`]
//! and an [`IdempotencyCache`] into a single `decide` call. The ledger and
//! the cache come in process-local and store-backed variants; with the
//! `redis-store` feature the store can be Redis.

#![warn(clippy::unwrap_used, clippy::expect_used)]

pub mod cache;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod store;

pub use cache::{
    CacheHealth, ComputeFn, DecisionFuture, FailoverCache, IdempotencyCache, InProcessCache,
    StoreBackedCache,
};
pub use classifier::CachedClassifier;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EngineConfig, Settings};
pub use engine::{DecisionEngine, EngineBuilder};
pub use error::{EngineError, StoreError};
pub use ledger::{MemoryLedger, Reservation, SpendLedger, StoreLedger};
#[cfg(feature = "redis-store")]
pub use redis_store::RedisStore;
pub use store::{KeyValueStore, MemoryStore};

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use time::macros::datetime;
    use uuid::Uuid;
    use xpgate_core::{Decision, Persona, ReasonCode, RewardType};

    use crate::error::StoreError;
    use crate::ledger::Reservation;
    use crate::store::{KeyValueStore, MemoryStore};

    pub(crate) fn sample_decision(transaction_id: &str) -> Decision {
        Decision {
            decision_id: Uuid::new_v4(),
            policy_version: "v1.0.0".into(),
            persona: Persona::Returning,
            multiplier: Decimal::new(15, 1),
            reward_type: RewardType::Xp,
            xp: 150,
            reward_value: Decimal::ZERO,
            reason_codes: vec![ReasonCode::ReturningUser, ReasonCode::XpModeEnabled],
            transaction_id: transaction_id.into(),
            user_id: "user_001".into(),
            merchant_id: "merchant_001".into(),
            created_at: datetime!(2024-01-20 10:00 UTC),
        }
    }

    /// [`MemoryStore`] that can be switched off, slowed down or made to
    /// refuse plain writes.
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
        fail_writes: AtomicBool,
        delay: Mutex<Duration>,
    }

    impl FlakyStore {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn inner(&self) -> &MemoryStore {
            &self.inner
        }

        pub(crate) fn set_down(&self, down: bool) {
            self.down.store(down, Ordering::SeqCst);
        }

        pub(crate) fn set_fail_writes(&self, fail: bool) {
            self.fail_writes.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn set_delay(&self, delay: Duration) {
            *self.delay.lock() = delay;
        }

        async fn gate(&self) -> Result<(), StoreError> {
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.gate().await?;
            self.inner.get(key).await
        }

        async fn set_with_expiry(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.gate().await?;
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("write rejected".into()));
            }
            self.inner.set_with_expiry(key, value, ttl).await
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            self.gate().await?;
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.gate().await?;
            self.inner.delete(key).await
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
            self.gate().await?;
            self.inner.compare_and_delete(key, expected).await
        }

        async fn increment_within(
            &self,
            key: &str,
            amount: Decimal,
            cap: Decimal,
            ttl: Duration,
        ) -> Result<Reservation, StoreError> {
            self.gate().await?;
            self.inner.increment_within(key, amount, cap, ttl).await
        }
    }
}
