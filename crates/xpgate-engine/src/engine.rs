//! The decision pipeline.
//!
//! `decide` validates, fingerprints and hands the evaluation to the
//! idempotency cache. Evaluation classifies the user, applies the XP formula
//! of one policy snapshot, picks the reward type and reserves spend against
//! the persona's daily cap. Collaborator failures never fail the call: each
//! one degrades the reward and leaves a reason code behind.

use rust_decimal::Decimal;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;
use xpgate_core::{
    CapBasis, Decision, Fingerprint, Persona, PersonaClassifier, Policy, PolicyStore, ReasonCode,
    RewardRequest, RewardType,
};

use crate::cache::{ComputeFn, DecisionFuture, IdempotencyCache, InProcessCache};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::ledger::{MemoryLedger, SpendLedger};

/// Whether the monetary part of a reward survived the cap check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CapOutcome {
    Granted,
    Withheld(ReasonCode),
}

/// The reward type picked for a request and the cooldown mark it holds.
#[derive(Debug, Clone, Copy)]
struct Selection {
    reward_type: RewardType,
    claimed: Option<OffsetDateTime>,
}

impl Selection {
    fn xp() -> Self {
        Self {
            reward_type: RewardType::Xp,
            claimed: None,
        }
    }
}

struct EngineInner {
    policies: Arc<PolicyStore>,
    classifier: Arc<dyn PersonaClassifier>,
    ledger: Arc<dyn SpendLedger>,
    cache: Arc<dyn IdempotencyCache>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

/// Cheap to clone; clones share every collaborator.
#[derive(Clone)]
pub struct DecisionEngine {
    inner: Arc<EngineInner>,
}

pub struct EngineBuilder {
    policies: Arc<PolicyStore>,
    classifier: Arc<dyn PersonaClassifier>,
    ledger: Option<Arc<dyn SpendLedger>>,
    cache: Option<Arc<dyn IdempotencyCache>>,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
}

impl EngineBuilder {
    #[must_use]
    pub fn ledger(mut self, ledger: Arc<dyn SpendLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn IdempotencyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Missing collaborators default to the in-process ledger and cache and
    /// the system clock.
    #[must_use]
    pub fn build(self) -> DecisionEngine {
        DecisionEngine {
            inner: Arc::new(EngineInner {
                policies: self.policies,
                classifier: self.classifier,
                ledger: self
                    .ledger
                    .unwrap_or_else(|| Arc::new(MemoryLedger::new())),
                cache: self
                    .cache
                    .unwrap_or_else(|| Arc::new(InProcessCache::new())),
                clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                config: self.config,
            }),
        }
    }
}

impl DecisionEngine {
    pub fn builder(
        policies: Arc<PolicyStore>,
        classifier: Arc<dyn PersonaClassifier>,
    ) -> EngineBuilder {
        EngineBuilder {
            policies,
            classifier,
            ledger: None,
            cache: None,
            clock: None,
            config: EngineConfig::default(),
        }
    }

    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.inner.policies
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Records known last-reward times (unix seconds) so the cooldown holds
    /// for users rewarded before this engine started. Returns how many were
    /// recorded; unusable entries are logged and skipped.
    pub async fn seed_last_rewards(
        &self,
        marks: impl IntoIterator<Item = (String, i64)>,
    ) -> usize {
        let mut seeded = 0;
        for (user_id, ts) in marks {
            let Ok(at) = OffsetDateTime::from_unix_timestamp(ts) else {
                warn!(user_id = %user_id, ts, "ignoring out-of-range last reward time");
                continue;
            };
            match self.inner.ledger.record_reward(user_id.trim(), at).await {
                Ok(()) => seeded += 1,
                Err(err) => {
                    warn!(user_id = %user_id, error = %err, "failed to seed last reward time");
                }
            }
        }
        seeded
    }

    /// Decides the reward for one transaction.
    ///
    /// Repeating a request with the same payload inside the idempotency
    /// window returns the stored decision, including its `decision_id`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] for malformed requests, before any
    ///   cache or ledger access;
    /// - [`EngineError::ConflictingReplay`] when the transaction id was
    ///   decided before with a different payload;
    /// - cache errors that no fallback could absorb.
    ///
    /// Identifiers are trimmed before anything else, so padded ids share the
    /// decision, replay binding and spend counter of the plain id.
    pub async fn decide(&self, request: &RewardRequest) -> Result<Decision> {
        let request = request.normalized()?;
        let fingerprint = Fingerprint::of(&request);
        let config = &self.inner.config;

        if !config.idempotency_enabled {
            return Ok(self.inner.evaluate(&request).await);
        }

        if config.reject_conflicting_replays {
            let bound = self
                .inner
                .cache
                .bind_transaction(&request.transaction_id, &fingerprint, config.idempotency_ttl)
                .await?;
            if let Some(previous) = bound {
                warn!(
                    transaction_id = %request.transaction_id,
                    %previous,
                    %fingerprint,
                    "transaction replayed with a different payload"
                );
                return Err(EngineError::ConflictingReplay {
                    transaction_id: request.transaction_id,
                });
            }
        }

        let inner = Arc::clone(&self.inner);
        let owned = Arc::new(request);
        let compute: ComputeFn = Arc::new(move || -> DecisionFuture {
            let inner = Arc::clone(&inner);
            let request = Arc::clone(&owned);
            Box::pin(async move { Ok(inner.evaluate(&request).await) })
        });
        self.inner
            .cache
            .get_or_compute(&fingerprint, config.idempotency_ttl, compute)
            .await
    }
}

impl EngineInner {
    async fn evaluate(&self, request: &RewardRequest) -> Decision {
        let now = self.clock.now();
        let policy = self.policies.current();
        let mut reasons = Vec::new();

        let persona = self.classify(&request.user_id, &mut reasons).await;
        let multiplier = policy.multiplier(persona);

        let computed = policy.compute_xp(request.amount, multiplier);
        if computed.capped {
            reasons.push(ReasonCode::XpCapped);
        }

        let at = reward_time(request, now);
        let selection = self.choose_reward_type(&policy, request, at, &mut reasons).await;
        let mut reward_type = selection.reward_type;
        let mut reward_value = policy.reward_value(reward_type, request.amount);
        let mut xp = computed.xp;

        match self
            .apply_cap(&policy, persona, request, reward_value, xp, now)
            .await
        {
            CapOutcome::Granted => {}
            CapOutcome::Withheld(reason) => {
                if let Some(mark) = selection.claimed {
                    self.release_claim(request, mark).await;
                }
                reasons.push(reason);
                reward_type = RewardType::Xp;
                reward_value = Decimal::ZERO;
                if policy.fallback_to_xp() && policy.cap_basis() != CapBasis::Xp {
                    reasons.push(ReasonCode::XpFallback);
                } else {
                    xp = 0;
                }
            }
        }

        reasons.push(ReasonCode::for_reward_type(reward_type));
        if policy.prefer_xp_mode() {
            reasons.push(ReasonCode::PreferXpMode);
        }
        if policy.cooldown().is_some() {
            reasons.push(ReasonCode::CooldownPolicyEnabled);
        }

        if reward_type != RewardType::Xp && selection.claimed.is_none() {
            self.record_reward(request, at).await;
        }

        let decision = Decision {
            decision_id: Uuid::new_v4(),
            policy_version: policy.version().to_string(),
            persona,
            multiplier,
            reward_type,
            xp,
            reward_value,
            reason_codes: reasons,
            transaction_id: request.transaction_id.clone(),
            user_id: request.user_id.clone(),
            merchant_id: request.merchant_id.clone(),
            created_at: now,
        };
        debug!(
            decision_id = %decision.decision_id,
            transaction_id = %decision.transaction_id,
            persona = %persona,
            reward_type = %decision.reward_type,
            xp = decision.xp,
            "decision computed"
        );
        decision
    }

    /// Unknown users are new users. A failing or slow classifier is treated
    /// the same way but flagged.
    async fn classify(&self, user_id: &str, reasons: &mut Vec<ReasonCode>) -> Persona {
        let timeout = self.config.classify_timeout;
        let persona = match tokio::time::timeout(timeout, self.classifier.classify(user_id)).await {
            Ok(Ok(persona)) => persona.unwrap_or(Persona::New),
            Ok(Err(err)) => {
                warn!(user_id, error = %err, "persona classification failed, assuming NEW");
                reasons.push(ReasonCode::for_persona(Persona::New));
                reasons.push(ReasonCode::PersonaFallback);
                return Persona::New;
            }
            Err(_) => {
                warn!(user_id, ?timeout, "persona classification timed out, assuming NEW");
                reasons.push(ReasonCode::for_persona(Persona::New));
                reasons.push(ReasonCode::PersonaFallback);
                return Persona::New;
            }
        };
        reasons.push(ReasonCode::for_persona(persona));
        persona
    }

    /// A monetary pick under an active cooldown claims the user's cooldown
    /// slot up front, so concurrent transactions cannot both pay out.
    async fn choose_reward_type(
        &self,
        policy: &Policy,
        request: &RewardRequest,
        at: OffsetDateTime,
        reasons: &mut Vec<ReasonCode>,
    ) -> Selection {
        if policy.prefer_xp_mode() {
            return Selection::xp();
        }
        let selected = policy.select_reward_type(&request.user_id);
        let unclaimed = Selection {
            reward_type: selected,
            claimed: None,
        };
        let Some(cooldown) = policy.cooldown() else {
            return unclaimed;
        };
        if selected == RewardType::Xp {
            return unclaimed;
        }

        let claim = tokio::time::timeout(
            self.config.store_timeout,
            self.ledger.claim_reward(&request.user_id, at, cooldown),
        )
        .await;
        match claim {
            Ok(Ok(true)) => Selection {
                reward_type: selected,
                claimed: Some(at),
            },
            Ok(Ok(false)) => {
                reasons.push(ReasonCode::CooldownActive);
                Selection::xp()
            }
            Ok(Err(err)) => {
                warn!(user_id = %request.user_id, error = %err, "cooldown claim failed, withholding monetary reward");
                reasons.push(ReasonCode::LedgerUnavailable);
                Selection::xp()
            }
            Err(_) => {
                warn!(user_id = %request.user_id, "cooldown claim timed out, withholding monetary reward");
                reasons.push(ReasonCode::LedgerUnavailable);
                Selection::xp()
            }
        }
    }

    async fn apply_cap(
        &self,
        policy: &Policy,
        persona: Persona,
        request: &RewardRequest,
        reward_value: Decimal,
        xp: u64,
        now: OffsetDateTime,
    ) -> CapOutcome {
        let cap = policy.daily_cap(persona);
        if cap.is_zero() {
            return CapOutcome::Withheld(ReasonCode::ZeroCacCap);
        }
        let amount = match policy.cap_basis() {
            CapBasis::RewardValue => reward_value,
            CapBasis::Xp => Decimal::from(xp),
        };
        if amount.is_zero() {
            return CapOutcome::Granted;
        }

        let day = now.to_offset(self.config.ledger_utc_offset).date();
        let reserve = self.ledger.try_reserve(&request.user_id, day, amount, cap);
        match tokio::time::timeout(self.config.store_timeout, reserve).await {
            Ok(Ok(reservation)) if reservation.accepted => CapOutcome::Granted,
            Ok(Ok(reservation)) => {
                debug!(
                    user_id = %request.user_id,
                    %day,
                    total = %reservation.new_total,
                    %amount,
                    %cap,
                    "daily cap reached"
                );
                CapOutcome::Withheld(ReasonCode::CacCapExceeded)
            }
            Ok(Err(err)) => {
                warn!(user_id = %request.user_id, error = %err, "spend ledger failed, withholding reward");
                CapOutcome::Withheld(ReasonCode::LedgerUnavailable)
            }
            Err(_) => {
                warn!(user_id = %request.user_id, "spend ledger timed out, withholding reward");
                CapOutcome::Withheld(ReasonCode::LedgerUnavailable)
            }
        }
    }

    /// A withheld reward gives its cooldown slot back.
    async fn release_claim(&self, request: &RewardRequest, at: OffsetDateTime) {
        let release = self.ledger.release_reward(&request.user_id, at);
        match tokio::time::timeout(self.config.store_timeout, release).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(user_id = %request.user_id, error = %err, "failed to release cooldown claim");
            }
            Err(_) => warn!(user_id = %request.user_id, "releasing cooldown claim timed out"),
        }
    }

    async fn record_reward(&self, request: &RewardRequest, at: OffsetDateTime) {
        let write = self.ledger.record_reward(&request.user_id, at);
        match tokio::time::timeout(self.config.store_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(user_id = %request.user_id, error = %err, "failed to record last reward time");
            }
            Err(_) => warn!(user_id = %request.user_id, "recording last reward time timed out"),
        }
    }
}

/// When a reward counts as given for the cooldown. The request timestamp
/// wins over the clock when present.
fn reward_time(request: &RewardRequest, now: OffsetDateTime) -> OffsetDateTime {
    request
        .ts
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        .unwrap_or(now)
}
