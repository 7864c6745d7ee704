use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use xpgate_core::{Decision, Fingerprint};

use super::{run_detached, ComputeFn, IdempotencyCache};
use crate::error::EngineError;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

type Outcome = Result<Decision, EngineError>;

enum Slot {
    Ready {
        decision: Decision,
        expires_at: Instant,
    },
    Pending(watch::Receiver<Option<Outcome>>),
}

#[derive(Default)]
struct Slots {
    entries: HashMap<Fingerprint, Slot>,
    bindings: HashMap<String, (Fingerprint, Instant)>,
    last_purge: Option<Instant>,
}

impl Slots {
    fn purge_expired(&mut self, now: Instant) {
        self.entries.retain(|_, slot| match slot {
            Slot::Ready { expires_at, .. } => *expires_at > now,
            Slot::Pending(_) => true,
        });
        self.bindings.retain(|_, (_, expires_at)| *expires_at > now);
        self.last_purge = Some(now);
    }

    fn maybe_purge(&mut self, now: Instant) {
        let due = self
            .last_purge
            .map_or(true, |last| now.duration_since(last) >= PURGE_INTERVAL);
        if due {
            self.purge_expired(now);
        }
    }
}

enum Role {
    Hit(Decision),
    Leader(watch::Sender<Option<Outcome>>),
    Waiter(watch::Receiver<Option<Outcome>>),
}

/// Per-process idempotency cache.
///
/// Concurrent callers for one fingerprint share a single computation through
/// a watch channel. Entries live until their TTL passes; expired entries are
/// dropped lazily.
#[derive(Clone, Default)]
pub struct InProcessCache {
    slots: Arc<Mutex<Slots>>,
}

impl InProcessCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored or in-flight fingerprints, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn purge_expired(&self) {
        self.slots.lock().purge_expired(Instant::now());
    }

    /// Whether `fingerprint` has a live decision or a computation in flight.
    #[must_use]
    pub fn holds(&self, fingerprint: &Fingerprint) -> bool {
        let now = Instant::now();
        match self.slots.lock().entries.get(fingerprint) {
            Some(Slot::Ready { expires_at, .. }) => *expires_at > now,
            Some(Slot::Pending(rx)) => rx.has_changed().is_ok(),
            None => false,
        }
    }

    fn claim(&self, fingerprint: &Fingerprint) -> Role {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        slots.maybe_purge(now);
        match slots.entries.get(fingerprint) {
            Some(Slot::Ready {
                decision,
                expires_at,
            }) if *expires_at > now => return Role::Hit(decision.clone()),
            // A closed sender without a result means the computation died.
            Some(Slot::Pending(rx)) if rx.has_changed().is_ok() => return Role::Waiter(rx.clone()),
            _ => {}
        }
        let (tx, rx) = watch::channel(None);
        slots.entries.insert(fingerprint.clone(), Slot::Pending(rx));
        Role::Leader(tx)
    }

    async fn lead(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: ComputeFn,
        tx: watch::Sender<Option<Outcome>>,
    ) -> Outcome {
        let slots = Arc::clone(&self.slots);
        let key = fingerprint.clone();
        let driver = tokio::spawn(async move {
            let outcome = run_detached(&compute).await;
            {
                let mut slots = slots.lock();
                match &outcome {
                    Ok(decision) => {
                        slots.entries.insert(
                            key,
                            Slot::Ready {
                                decision: decision.clone(),
                                expires_at: Instant::now() + ttl,
                            },
                        );
                    }
                    Err(_) => {
                        slots.entries.remove(&key);
                    }
                }
            }
            tx.send_replace(Some(outcome.clone()));
            outcome
        });
        driver
            .await
            .map_err(|e| EngineError::ComputeAborted(e.to_string()))?
    }

    async fn wait(
        fingerprint: &Fingerprint,
        mut rx: watch::Receiver<Option<Outcome>>,
    ) -> Outcome {
        debug!(%fingerprint, "waiting for in-flight decision");
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Ok(decision)) => Ok(decision),
            Some(Err(err)) => Err(EngineError::ConcurrentComputeFailure {
                fingerprint: fingerprint.clone(),
                cause: err.to_string(),
            }),
            None => Err(EngineError::ConcurrentComputeFailure {
                fingerprint: fingerprint.clone(),
                cause: "computation abandoned".into(),
            }),
        }
    }
}

#[async_trait]
impl IdempotencyCache for InProcessCache {
    async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Decision>, EngineError> {
        let now = Instant::now();
        let slots = self.slots.lock();
        Ok(match slots.entries.get(fingerprint) {
            Some(Slot::Ready {
                decision,
                expires_at,
            }) if *expires_at > now => Some(decision.clone()),
            _ => None,
        })
    }

    async fn set(
        &self,
        fingerprint: &Fingerprint,
        decision: &Decision,
        ttl: Duration,
    ) -> Result<(), EngineError> {
        self.slots.lock().entries.insert(
            fingerprint.clone(),
            Slot::Ready {
                decision: decision.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get_or_compute(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: ComputeFn,
    ) -> Result<Decision, EngineError> {
        match self.claim(fingerprint) {
            Role::Hit(decision) => Ok(decision),
            Role::Leader(tx) => self.lead(fingerprint, ttl, compute, tx).await,
            Role::Waiter(rx) => Self::wait(fingerprint, rx).await,
        }
    }

    async fn bind_transaction(
        &self,
        transaction_id: &str,
        fingerprint: &Fingerprint,
        ttl: Duration,
    ) -> Result<Option<Fingerprint>, EngineError> {
        let now = Instant::now();
        let mut slots = self.slots.lock();
        if let Some((bound, expires_at)) = slots.bindings.get(transaction_id) {
            if *expires_at > now {
                return Ok((bound != fingerprint).then(|| bound.clone()));
            }
        }
        slots
            .bindings
            .insert(transaction_id.to_string(), (fingerprint.clone(), now + ttl));
        Ok(None)
    }
}
