//! Idempotency cache: fingerprint → decision, with at most one computation
//! per fingerprint in flight.

mod failover;
mod memory;
mod store;

pub use failover::{CacheHealth, FailoverCache};
pub use memory::InProcessCache;
pub use store::StoreBackedCache;

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use xpgate_core::{Decision, Fingerprint};

use crate::error::EngineError;

pub type DecisionFuture = Pin<Box<dyn Future<Output = Result<Decision, EngineError>> + Send>>;

/// Produces the decision on a cache miss. Called at most once per
/// `get_or_compute` invocation.
pub type ComputeFn = Arc<dyn Fn() -> DecisionFuture + Send + Sync>;

#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Decision>, EngineError>;

    async fn set(
        &self,
        fingerprint: &Fingerprint,
        decision: &Decision,
        ttl: Duration,
    ) -> Result<(), EngineError>;

    /// Returns the live decision for `fingerprint`, or runs `compute` unless
    /// another caller already is, in which case its outcome is shared.
    ///
    /// Only a successful result is stored. The caller whose compute failed
    /// gets the original error; concurrent waiters get
    /// [`EngineError::ConcurrentComputeFailure`].
    async fn get_or_compute(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: ComputeFn,
    ) -> Result<Decision, EngineError>;

    /// Associates a transaction id with the fingerprint of its first payload.
    /// Returns the previously bound fingerprint when it differs.
    async fn bind_transaction(
        &self,
        transaction_id: &str,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<Option<Fingerprint>, EngineError>;
}

/// Runs `compute` on its own task so dropping the caller cannot cancel it
/// for everybody else.
pub(crate) async fn run_detached(compute: &ComputeFn) -> Result<Decision, EngineError> {
    tokio::spawn(compute())
        .await
        .map_err(|e| EngineError::ComputeAborted(e.to_string()))?
}
