use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;
use xpgate_core::{Decision, Fingerprint};

use super::{run_detached, ComputeFn, IdempotencyCache};
use crate::error::{EngineError, StoreError};
use crate::store::KeyValueStore;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);
const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Idempotency cache kept in a shared [`KeyValueStore`].
///
/// Keys:
/// - `idem:{fingerprint}` holds the decision as JSON,
/// - `idem-lock:{fingerprint}` is claimed by the instance computing it,
/// - `idem-txn:{transaction_id}` binds a transaction id to its fingerprint.
///
/// Instances that lose the claim poll for the result until the wait timeout.
pub struct StoreBackedCache<S: ?Sized> {
    store: Arc<S>,
    op_timeout: Duration,
    lock_ttl: Duration,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl<S: KeyValueStore + ?Sized + 'static> StoreBackedCache<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            op_timeout: DEFAULT_OP_TIMEOUT,
            lock_ttl: DEFAULT_LOCK_TTL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Bound applied to every single store call.
    #[must_use]
    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// How long a claim survives a crashed owner.
    #[must_use]
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// How long a non-owner polls for the owner's result.
    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration, poll_interval: Duration) -> Self {
        self.wait_timeout = timeout;
        self.poll_interval = poll_interval;
        self
    }

    async fn load(&self, fingerprint: &Fingerprint) -> Result<Option<Decision>, StoreError> {
        load_decision(&*self.store, self.op_timeout, fingerprint).await
    }

    async fn lead(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: ComputeFn,
        token: String,
    ) -> Result<Decision, EngineError> {
        let store = Arc::clone(&self.store);
        let op_timeout = self.op_timeout;
        let key = fingerprint.clone();
        let driver = tokio::spawn(async move {
            let decision = run_detached(&compute).await;
            let written = match &decision {
                Ok(decision) => store_decision(&*store, op_timeout, &key, decision, ttl).await,
                Err(_) => Ok(()),
            };
            match bounded(op_timeout, store.compare_and_delete(&lock_key(&key), &token)).await {
                Ok(true) => {}
                Ok(false) => warn!(fingerprint = %key, "idempotency claim expired before release"),
                Err(err) => warn!(fingerprint = %key, error = %err, "failed to release idempotency claim"),
            }
            written.map_err(EngineError::Store).and(decision)
        });
        driver
            .await
            .map_err(|e| EngineError::ComputeAborted(e.to_string()))?
    }

    async fn wait(&self, fingerprint: &Fingerprint) -> Result<Decision, EngineError> {
        debug!(%fingerprint, "waiting for decision computed elsewhere");
        let deadline = Instant::now() + self.wait_timeout;
        let claim_key = lock_key(fingerprint);
        while Instant::now() < deadline {
            tokio::time::sleep(self.poll_interval).await;
            if let Some(decision) = self.load(fingerprint).await? {
                return Ok(decision);
            }
            let claimed = bounded(self.op_timeout, self.store.get(&claim_key)).await?;
            if claimed.is_none() {
                // The owner may have written just before releasing.
                if let Some(decision) = self.load(fingerprint).await? {
                    return Ok(decision);
                }
                return Err(EngineError::ConcurrentComputeFailure {
                    fingerprint: fingerprint.clone(),
                    cause: "claim released without a stored decision".into(),
                });
            }
        }
        Err(EngineError::WaitTimeout(fingerprint.clone()))
    }
}

fn decision_key(fingerprint: &Fingerprint) -> String {
    format!("idem:{fingerprint}")
}

fn lock_key(fingerprint: &Fingerprint) -> String {
    format!("idem-lock:{fingerprint}")
}

fn binding_key(transaction_id: &str) -> String {
    format!("idem-txn:{transaction_id}")
}

async fn bounded<T>(
    timeout: Duration,
    op: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    tokio::time::timeout(timeout, op)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

async fn load_decision<S: KeyValueStore + ?Sized>(
    store: &S,
    timeout: Duration,
    fingerprint: &Fingerprint,
) -> Result<Option<Decision>, StoreError> {
    let key = decision_key(fingerprint);
    let Some(raw) = bounded(timeout, store.get(&key)).await? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| StoreError::Corrupt {
            key,
            reason: e.to_string(),
        })
}

async fn store_decision<S: KeyValueStore + ?Sized>(
    store: &S,
    timeout: Duration,
    fingerprint: &Fingerprint,
    decision: &Decision,
    ttl: Duration,
) -> Result<(), StoreError> {
    let key = decision_key(fingerprint);
    let json = serde_json::to_string(decision).map_err(|e| StoreError::Corrupt {
        key: key.clone(),
        reason: e.to_string(),
    })?;
    bounded(timeout, store.set_with_expiry(&key, &json, ttl)).await
}

#[async_trait]
impl<S: KeyValueStore + ?Sized + 'static> IdempotencyCache for StoreBackedCache<S> {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Decision>, EngineError> {
        Ok(self.load(fingerprint).await?)
    }

    async fn set(
        &self,
        fingerprint: &Fingerprint,
        decision: &Decision,
        ttl: Duration,
    ) -> Result<(), EngineError> {
        Ok(store_decision(&*self.store, self.op_timeout, fingerprint, decision, ttl).await?)
    }

    async fn get_or_compute(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: ComputeFn,
    ) -> Result<Decision, EngineError> {
        if let Some(decision) = self.load(fingerprint).await? {
            return Ok(decision);
        }

        let token = Uuid::new_v4().to_string();
        let claimed = bounded(
            self.op_timeout,
            self.store
                .set_if_absent(&lock_key(fingerprint), &token, self.lock_ttl),
        )
        .await?;
        if !claimed {
            return self.wait(fingerprint).await;
        }

        // Another owner may have finished between the first read and the claim.
        if let Some(decision) = self.load(fingerprint).await? {
            bounded(
                self.op_timeout,
                self.store
                    .compare_and_delete(&lock_key(fingerprint), &token),
            )
            .await?;
            return Ok(decision);
        }
        self.lead(fingerprint, ttl, compute, token).await
    }

    async fn bind_transaction(
        &self,
        transaction_id: &str,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<Option<Fingerprint>, EngineError> {
        let key = binding_key(transaction_id);
        let bound = bounded(
            self.op_timeout,
            self.store.set_if_absent(&key, fingerprint.as_str(), ttl),
        )
        .await?;
        if bound {
            return Ok(None);
        }
        let existing = bounded(self.op_timeout, self.store.get(&key)).await?;
        Ok(existing
            .filter(|fp| fp != fingerprint.as_str())
            .map(Fingerprint::from_stored))
    }
}
