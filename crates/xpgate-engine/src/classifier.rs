use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use xpgate_core::{ClassificationError, Persona, PersonaClassifier};

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Entries {
    by_user: HashMap<String, (Persona, Instant)>,
    last_purge: Option<Instant>,
}

impl Entries {
    fn maybe_purge(&mut self, now: Instant) {
        let due = self
            .last_purge
            .map_or(true, |last| now.duration_since(last) >= PURGE_INTERVAL);
        if due {
            self.by_user.retain(|_, (_, expires_at)| *expires_at > now);
            self.last_purge = Some(now);
        }
    }
}

/// Caches successful persona lookups for a fixed TTL.
///
/// Unknown users and failures go to the wrapped classifier every time.
/// Expired entries are swept at most once a minute, on insert.
pub struct CachedClassifier<C: ?Sized> {
    inner: Arc<C>,
    ttl: Duration,
    entries: Mutex<Entries>,
}

impl<C: PersonaClassifier + ?Sized> CachedClassifier<C> {
    pub fn new(inner: Arc<C>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: Mutex::new(Entries::default()),
        }
    }

    /// Forgets one user, e.g. after their tier changed.
    pub fn invalidate(&self, user_id: &str) {
        self.entries.lock().by_user.remove(user_id);
    }

    /// Cached users, expired ones not yet swept included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().by_user.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, user_id: &str) -> Option<Persona> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.by_user.get(user_id) {
            Some((persona, expires_at)) if *expires_at > now => Some(*persona),
            Some(_) => {
                entries.by_user.remove(user_id);
                None
            }
            None => None,
        }
    }

    fn remember(&self, user_id: &str, persona: Persona) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.maybe_purge(now);
        entries
            .by_user
            .insert(user_id.to_string(), (persona, now + self.ttl));
    }
}

#[async_trait]
impl<C: PersonaClassifier + ?Sized> PersonaClassifier for CachedClassifier<C> {
    async fn classify(&self, user_id: &str) -> Result<Option<Persona>, ClassificationError> {
        if let Some(persona) = self.cached(user_id) {
            return Ok(Some(persona));
        }
        let persona = self.inner.classify(user_id).await?;
        if let Some(persona) = persona {
            self.remember(user_id, persona);
        }
        Ok(persona)
    }
}
