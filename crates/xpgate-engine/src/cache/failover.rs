use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{info, warn};
use xpgate_core::{Decision, Fingerprint};

use super::{ComputeFn, DecisionFuture, IdempotencyCache, InProcessCache};
use crate::error::{EngineError, StoreError};

/// Snapshot of the failover state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHealth {
    pub degraded: bool,
    pub degraded_for: Option<Duration>,
    /// Transitions from the primary to the fallback.
    pub failovers: u64,
    /// Calls answered by the fallback.
    pub fallback_served: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct FailoverState {
    degraded_since: Option<Instant>,
    last_retry: Option<Instant>,
    last_error: Option<String>,
}

/// Uses a shared primary cache and falls back to an in-process cache while
/// the primary's store is unreachable.
///
/// While degraded the primary is retried once per retry interval. Decisions
/// made or still being made during an outage stay in the fallback until they
/// expire and are preferred over the primary for the same fingerprint.
pub struct FailoverCache<P: ?Sized> {
    primary: Arc<P>,
    fallback: InProcessCache,
    retry_interval: Duration,
    state: Mutex<FailoverState>,
    failovers: AtomicU64,
    fallback_served: AtomicU64,
}

impl<P: IdempotencyCache + ?Sized> FailoverCache<P> {
    pub fn new(primary: Arc<P>, retry_interval: Duration) -> Self {
        Self {
            primary,
            fallback: InProcessCache::new(),
            retry_interval,
            state: Mutex::new(FailoverState::default()),
            failovers: AtomicU64::new(0),
            fallback_served: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn health(&self) -> CacheHealth {
        let state = self.state.lock();
        CacheHealth {
            degraded: state.degraded_since.is_some(),
            degraded_for: state.degraded_since.map(|since| since.elapsed()),
            failovers: self.failovers.load(Ordering::Relaxed),
            fallback_served: self.fallback_served.load(Ordering::Relaxed),
            last_error: state.last_error.clone(),
        }
    }

    /// Whether this call should try the primary. Claims the retry slot while
    /// degraded.
    fn primary_usable(&self) -> bool {
        let mut state = self.state.lock();
        if state.degraded_since.is_none() {
            return true;
        }
        let now = Instant::now();
        let due = state
            .last_retry
            .map_or(true, |last| now.duration_since(last) >= self.retry_interval);
        if due {
            state.last_retry = Some(now);
        }
        due
    }

    fn mark_failure(&self, err: &StoreError) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if state.degraded_since.is_none() {
            state.degraded_since = Some(now);
            self.failovers.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "idempotency store unavailable, serving from in-process fallback");
        }
        state.last_retry = Some(now);
        state.last_error = Some(err.to_string());
    }

    fn mark_success(&self) {
        let mut state = self.state.lock();
        if let Some(since) = state.degraded_since.take() {
            info!(
                degraded_for_ms = since.elapsed().as_millis() as u64,
                "idempotency store recovered"
            );
            state.last_retry = None;
        }
    }

    /// Splits primary results into "use this" and "fail over".
    fn triage<T>(&self, result: Result<T, EngineError>) -> Result<Option<T>, EngineError> {
        match result {
            Ok(value) => {
                self.mark_success();
                Ok(Some(value))
            }
            Err(EngineError::Store(err)) if err.is_unavailable() => {
                self.mark_failure(&err);
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    fn served_by_fallback(&self) {
        self.fallback_served.fetch_add(1, Ordering::Relaxed);
    }
}

/// Wraps `compute` so that, however many caches call it, it runs once.
fn memoize(compute: ComputeFn) -> ComputeFn {
    let memo: Arc<OnceCell<Result<Decision, EngineError>>> = Arc::new(OnceCell::new());
    Arc::new(move || -> DecisionFuture {
        let memo = Arc::clone(&memo);
        let compute = Arc::clone(&compute);
        Box::pin(async move { memo.get_or_init(|| compute()).await.clone() })
    })
}

#[async_trait]
impl<P: IdempotencyCache + ?Sized> IdempotencyCache for FailoverCache<P> {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Decision>, EngineError> {
        if let Some(decision) = self.fallback.get(fingerprint).await? {
            self.served_by_fallback();
            return Ok(Some(decision));
        }
        if self.primary_usable() {
            if let Some(found) = self.triage(self.primary.get(fingerprint).await)? {
                return Ok(found);
            }
        }
        Ok(None)
    }

    async fn set(
        &self,
        fingerprint: &Fingerprint,
        decision: &Decision,
        ttl: Duration,
    ) -> Result<(), EngineError> {
        if self.primary_usable()
            && self
                .triage(self.primary.set(fingerprint, decision, ttl).await)?
                .is_some()
        {
            return Ok(());
        }
        self.fallback.set(fingerprint, decision, ttl).await
    }

    async fn get_or_compute(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: ComputeFn,
    ) -> Result<Decision, EngineError> {
        // Joins a fallback computation still in flight, so a recovered
        // primary never starts a second one.
        if self.fallback.holds(fingerprint) {
            self.served_by_fallback();
            return self.fallback.get_or_compute(fingerprint, ttl, compute).await;
        }
        let compute = memoize(compute);
        if self.primary_usable() {
            let result = self
                .primary
                .get_or_compute(fingerprint, ttl, Arc::clone(&compute))
                .await;
            if let Some(decision) = self.triage(result)? {
                return Ok(decision);
            }
        }
        self.served_by_fallback();
        self.fallback.get_or_compute(fingerprint, ttl, compute).await
    }

    async fn bind_transaction(
        &self,
        transaction_id: &str,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<Option<Fingerprint>, EngineError> {
        if self.primary_usable() {
            let result = self
                .primary
                .bind_transaction(transaction_id, fingerprint, ttl)
                .await;
            if let Some(bound) = self.triage(result)? {
                return Ok(bound);
            }
        }
        self.fallback
            .bind_transaction(transaction_id, fingerprint, ttl)
            .await
    }
}
