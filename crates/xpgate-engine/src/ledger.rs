//! Daily spend accounting per user.
//!
//! `try_reserve` is the only way to move a counter and is atomic per
//! `(user, day)`: a reservation is accepted iff the new total stays within
//! the cap, and a rejection leaves the total unchanged. `claim_reward` is the
//! cooldown counterpart, atomic per user.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::{Date, OffsetDateTime};

use crate::error::StoreError;
use crate::store::KeyValueStore;

const COUNTER_TTL: Duration = Duration::from_secs(48 * 60 * 60);
/// Reward marks older than this are forgotten, which bounds the longest
/// cooldown that is enforced.
const LAST_REWARD_RETENTION_DAYS: i64 = 30;
const LAST_REWARD_TTL: Duration =
    Duration::from_secs(LAST_REWARD_RETENTION_DAYS as u64 * 24 * 60 * 60);
const CLAIM_ATTEMPTS: usize = 3;

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub accepted: bool,
    /// Total after the attempt; unchanged on rejection.
    pub new_total: Decimal,
}

#[async_trait]
pub trait SpendLedger: Send + Sync {
    async fn try_reserve(
        &self,
        user_id: &str,
        day: Date,
        amount: Decimal,
        cap: Decimal,
    ) -> Result<Reservation, StoreError>;

    async fn total(&self, user_id: &str, day: Date) -> Result<Decimal, StoreError>;

    /// When the user last received a monetary reward.
    async fn last_reward_at(&self, user_id: &str) -> Result<Option<OffsetDateTime>, StoreError>;

    /// Records a monetary reward at `at`. An earlier time never replaces a
    /// later one.
    async fn record_reward(&self, user_id: &str, at: OffsetDateTime) -> Result<(), StoreError>;

    /// Records a monetary reward at `at` unless the user got one less than
    /// `cooldown` before. Check and write are atomic per user; `false` means
    /// the cooldown is still running.
    async fn claim_reward(
        &self,
        user_id: &str,
        at: OffsetDateTime,
        cooldown: time::Duration,
    ) -> Result<bool, StoreError>;

    /// Takes back a claim made at `at` if it is still the latest mark.
    async fn release_reward(&self, user_id: &str, at: OffsetDateTime) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct LedgerState {
    totals: HashMap<(String, Date), Decimal>,
    newest_day: Option<Date>,
    last_rewards: HashMap<String, OffsetDateTime>,
}

impl LedgerState {
    /// Forgets counters older than the day before the newest day seen, and
    /// reward marks past their retention.
    fn compact(&mut self, day: Date) {
        if self.newest_day.is_some_and(|newest| newest >= day) {
            return;
        }
        self.newest_day = Some(day);
        let keep_from = day.previous_day().unwrap_or(day);
        self.totals.retain(|(_, d), _| *d >= keep_from);
        if let Some(horizon) = day.checked_sub(time::Duration::days(LAST_REWARD_RETENTION_DAYS)) {
            self.last_rewards.retain(|_, at| at.date() >= horizon);
        }
    }
}

/// In-process ledger. One lock covers check and write.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    state: Mutex<LedgerState>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a counter directly, bypassing the cap. Meant for seeding.
    pub fn seed(&self, user_id: &str, day: Date, total: Decimal) {
        let mut state = self.state.lock();
        state.compact(day);
        state.totals.insert((user_id.to_string(), day), total);
    }
}

#[async_trait]
impl SpendLedger for MemoryLedger {
    async fn try_reserve(
        &self,
        user_id: &str,
        day: Date,
        amount: Decimal,
        cap: Decimal,
    ) -> Result<Reservation, StoreError> {
        let mut state = self.state.lock();
        state.compact(day);
        let key = (user_id.to_string(), day);
        let current = state.totals.get(&key).copied().unwrap_or(Decimal::ZERO);
        match current.checked_add(amount) {
            Some(next) if amount >= Decimal::ZERO && next <= cap => {
                state.totals.insert(key, next);
                Ok(Reservation {
                    accepted: true,
                    new_total: next,
                })
            }
            _ => Ok(Reservation {
                accepted: false,
                new_total: current,
            }),
        }
    }

    async fn total(&self, user_id: &str, day: Date) -> Result<Decimal, StoreError> {
        let state = self.state.lock();
        Ok(state
            .totals
            .get(&(user_id.to_string(), day))
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn last_reward_at(&self, user_id: &str) -> Result<Option<OffsetDateTime>, StoreError> {
        Ok(self.state.lock().last_rewards.get(user_id).copied())
    }

    async fn record_reward(&self, user_id: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let slot = state
            .last_rewards
            .entry(user_id.to_string())
            .or_insert(at);
        if *slot < at {
            *slot = at;
        }
        Ok(())
    }

    async fn claim_reward(
        &self,
        user_id: &str,
        at: OffsetDateTime,
        cooldown: time::Duration,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if let Some(last) = state.last_rewards.get(user_id) {
            if at - *last < cooldown {
                return Ok(false);
            }
        }
        state.last_rewards.insert(user_id.to_string(), at);
        Ok(true)
    }

    async fn release_reward(&self, user_id: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.last_rewards.get(user_id) == Some(&at) {
            state.last_rewards.remove(user_id);
        }
        Ok(())
    }
}

/// Ledger kept in a shared [`KeyValueStore`], so several engine instances
/// enforce one cap.
pub struct StoreLedger<S: ?Sized> {
    store: Arc<S>,
}

impl<S: KeyValueStore + ?Sized> StoreLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    fn counter_key(user_id: &str, day: Date) -> String {
        format!("cac:{user_id}:{day}")
    }

    fn last_reward_key(user_id: &str) -> String {
        format!("last_reward:{user_id}")
    }

    async fn read_mark(&self, key: &str) -> Result<Option<(String, OffsetDateTime)>, StoreError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        let at = parse_mark(key, &raw)?;
        Ok(Some((raw, at)))
    }
}

fn parse_mark(key: &str, raw: &str) -> Result<OffsetDateTime, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        key: key.to_string(),
        reason,
    };
    let secs: i64 = raw
        .parse()
        .map_err(|e: std::num::ParseIntError| corrupt(e.to_string()))?;
    OffsetDateTime::from_unix_timestamp(secs).map_err(|e| corrupt(e.to_string()))
}

#[async_trait]
impl<S: KeyValueStore + ?Sized> SpendLedger for StoreLedger<S> {
    async fn try_reserve(
        &self,
        user_id: &str,
        day: Date,
        amount: Decimal,
        cap: Decimal,
    ) -> Result<Reservation, StoreError> {
        self.store
            .increment_within(&Self::counter_key(user_id, day), amount, cap, COUNTER_TTL)
            .await
    }

    async fn total(&self, user_id: &str, day: Date) -> Result<Decimal, StoreError> {
        self.store.counter(&Self::counter_key(user_id, day)).await
    }

    async fn last_reward_at(&self, user_id: &str) -> Result<Option<OffsetDateTime>, StoreError> {
        let key = Self::last_reward_key(user_id);
        Ok(self.read_mark(&key).await?.map(|(_, at)| at))
    }

    async fn record_reward(&self, user_id: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        let key = Self::last_reward_key(user_id);
        if let Some((_, last)) = self.read_mark(&key).await? {
            if last >= at {
                return Ok(());
            }
        }
        self.store
            .set_with_expiry(&key, &at.unix_timestamp().to_string(), LAST_REWARD_TTL)
            .await
    }

    async fn claim_reward(
        &self,
        user_id: &str,
        at: OffsetDateTime,
        cooldown: time::Duration,
    ) -> Result<bool, StoreError> {
        let key = Self::last_reward_key(user_id);
        let mark = at.unix_timestamp().to_string();
        for _ in 0..CLAIM_ATTEMPTS {
            if self.store.set_if_absent(&key, &mark, LAST_REWARD_TTL).await? {
                return Ok(true);
            }
            let Some((raw, last)) = self.read_mark(&key).await? else {
                continue;
            };
            if at - last < cooldown {
                return Ok(false);
            }
            // Stale mark. Only the caller that removes it gets to retry first.
            self.store.compare_and_delete(&key, &raw).await?;
        }
        Ok(false)
    }

    async fn release_reward(&self, user_id: &str, at: OffsetDateTime) -> Result<(), StoreError> {
        self.store
            .compare_and_delete(
                &Self::last_reward_key(user_id),
                &at.unix_timestamp().to_string(),
            )
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use time::macros::{date, datetime};

    const DAY: Date = date!(2024 - 01 - 20);

    fn dec(v: i64) -> Decimal {
        Decimal::new(v, 0)
    }

    #[tokio::test]
    async fn rejection_leaves_the_total_unchanged() {
        let ledger = MemoryLedger::new();
        ledger.seed("u1", DAY, dec(950));

        let r = ledger.try_reserve("u1", DAY, dec(100), dec(1000)).await.unwrap();
        assert_eq!(
            r,
            Reservation {
                accepted: false,
                new_total: dec(950)
            }
        );
        assert_eq!(ledger.total("u1", DAY).await.unwrap(), dec(950));

        let r = ledger.try_reserve("u1", DAY, dec(50), dec(1000)).await.unwrap();
        assert!(r.accepted);
        assert_eq!(r.new_total, dec(1000));
    }

    #[tokio::test]
    async fn days_and_users_are_separate() {
        let ledger = MemoryLedger::new();
        ledger.try_reserve("u1", DAY, dec(10), dec(10)).await.unwrap();
        let next_day = DAY.next_day().unwrap();
        assert!(ledger.try_reserve("u1", next_day, dec(10), dec(10)).await.unwrap().accepted);
        assert!(ledger.try_reserve("u2", DAY, dec(10), dec(10)).await.unwrap().accepted);
        assert_eq!(ledger.total("u3", DAY).await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn negative_amounts_are_rejected() {
        let ledger = MemoryLedger::new();
        let r = ledger.try_reserve("u1", DAY, dec(-5), dec(10)).await.unwrap();
        assert!(!r.accepted);
        assert_eq!(r.new_total, Decimal::ZERO);
    }

    #[tokio::test]
    async fn old_days_are_compacted() {
        let ledger = MemoryLedger::new();
        ledger.seed("u1", DAY, dec(5));
        let later = date!(2024 - 01 - 23);
        ledger.try_reserve("u1", later, dec(1), dec(10)).await.unwrap();
        assert_eq!(ledger.total("u1", DAY).await.unwrap(), Decimal::ZERO);
        assert_eq!(ledger.total("u1", later).await.unwrap(), dec(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_exceed_the_cap() {
        let ledger = Arc::new(MemoryLedger::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.try_reserve("u1", DAY, dec(30), dec(1000)).await.unwrap()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().accepted {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 33);
        assert_eq!(ledger.total("u1", DAY).await.unwrap(), dec(990));
    }

    #[tokio::test]
    async fn store_ledger_uses_day_keys() {
        let store = Arc::new(MemoryStore::new());
        let ledger = StoreLedger::new(Arc::clone(&store));

        let r = ledger.try_reserve("u1", DAY, dec(40), dec(50)).await.unwrap();
        assert!(r.accepted);
        assert_eq!(
            store.get("cac:u1:2024-01-20").await.unwrap().as_deref(),
            Some("40")
        );
        assert!(!ledger.try_reserve("u1", DAY, dec(20), dec(50)).await.unwrap().accepted);
        assert_eq!(ledger.total("u1", DAY).await.unwrap(), dec(40));
    }

    #[tokio::test]
    async fn last_reward_round_trips_through_both_ledgers() {
        let at = datetime!(2024-01-20 10:00 UTC);
        let memory = MemoryLedger::new();
        let stored = StoreLedger::new(Arc::new(MemoryStore::new()));

        for ledger in [&memory as &dyn SpendLedger, &stored] {
            assert_eq!(ledger.last_reward_at("u1").await.unwrap(), None);
            ledger.record_reward("u1", at).await.unwrap();
            assert_eq!(ledger.last_reward_at("u1").await.unwrap(), Some(at));
            ledger
                .record_reward("u1", at - time::Duration::hours(1))
                .await
                .unwrap();
            assert_eq!(ledger.last_reward_at("u1").await.unwrap(), Some(at));
        }
    }

    #[tokio::test]
    async fn claims_respect_the_cooldown_in_both_ledgers() {
        let at = datetime!(2024-01-20 10:00 UTC);
        let cooldown = time::Duration::hours(24);
        let memory = MemoryLedger::new();
        let stored = StoreLedger::new(Arc::new(MemoryStore::new()));

        for ledger in [&memory as &dyn SpendLedger, &stored] {
            assert!(ledger.claim_reward("u1", at, cooldown).await.unwrap());
            let soon = at + time::Duration::hours(2);
            assert!(!ledger.claim_reward("u1", soon, cooldown).await.unwrap());
            assert_eq!(ledger.last_reward_at("u1").await.unwrap(), Some(at));

            let later = at + time::Duration::hours(25);
            assert!(ledger.claim_reward("u1", later, cooldown).await.unwrap());
            assert_eq!(ledger.last_reward_at("u1").await.unwrap(), Some(later));
        }
    }

    #[tokio::test]
    async fn released_claims_free_the_cooldown() {
        let at = datetime!(2024-01-20 10:00 UTC);
        let cooldown = time::Duration::hours(24);
        let memory = MemoryLedger::new();
        let stored = StoreLedger::new(Arc::new(MemoryStore::new()));

        for ledger in [&memory as &dyn SpendLedger, &stored] {
            assert!(ledger.claim_reward("u1", at, cooldown).await.unwrap());
            ledger.release_reward("u1", at).await.unwrap();
            assert_eq!(ledger.last_reward_at("u1").await.unwrap(), None);
            let soon = at + time::Duration::hours(1);
            assert!(ledger.claim_reward("u1", soon, cooldown).await.unwrap());

            // Releasing an older mark leaves the newer one alone.
            ledger.release_reward("u1", at).await.unwrap();
            assert_eq!(ledger.last_reward_at("u1").await.unwrap(), Some(soon));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_grant_one_reward() {
        let at = datetime!(2024-01-20 10:00 UTC);
        let stored = Arc::new(StoreLedger::new(Arc::new(MemoryStore::new())));
        let mut handles = Vec::new();
        for i in 0..16 {
            let ledger = Arc::clone(&stored);
            handles.push(tokio::spawn(async move {
                let when = at + time::Duration::seconds(i);
                ledger
                    .claim_reward("u1", when, time::Duration::hours(24))
                    .await
                    .unwrap()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn old_reward_marks_are_compacted() {
        let ledger = MemoryLedger::new();
        ledger
            .record_reward("u1", datetime!(2024-01-20 10:00 UTC))
            .await
            .unwrap();
        ledger.try_reserve("u2", date!(2024 - 02 - 25), dec(1), dec(10)).await.unwrap();
        assert_eq!(ledger.last_reward_at("u1").await.unwrap(), None);
    }
}
