//! In-memory session store with capacity eviction and TTL expiry.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use relay_core::{Clock, ConversationKind, Session, SessionKey, config::SessionConfig};
use uuid::Uuid;

/// Owns every live [`Session`], keyed by its composite key.
///
/// Every access through [`SessionStore::resolve`] refreshes the session's
/// last-activity timestamp, which orders both TTL expiry and eviction.
#[derive(Debug)]
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionKey, Session>>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(config: SessionConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            config,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the session for a conversation, creating it if needed.
    ///
    /// Creating a session at capacity first evicts the least recently
    /// active one (ties go to the earliest created).
    pub fn resolve(
        &self,
        channel_type: &str,
        sender_id: &str,
        kind: ConversationKind,
        group_id: Option<&str>,
    ) -> Session {
        self.resolve_key(SessionKey::new(channel_type, sender_id, kind, group_id))
    }

    /// [`SessionStore::resolve`] for an already built key.
    pub fn resolve_key(&self, key: SessionKey) -> Session {
        let now = self.clock.now_millis();
        let mut sessions = self.lock();

        if let Some(session) = sessions.get_mut(&key) {
            session.last_active_at = now;
            return session.clone();
        }

        if sessions.len() >= self.config.max_concurrent {
            evict_oldest(&mut sessions);
        }

        let session = Session::new(format!("sess_{}", Uuid::new_v4().simple()), key, now);
        tracing::info!(session_id = %session.id, key = %session.key, "Session created");
        sessions.insert(session.key.clone(), session.clone());
        session
    }

    /// Get a session by id without touching it.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().values().find(|s| s.id == id).cloned()
    }

    /// Get a session by key without touching it.
    #[must_use]
    pub fn get_by_key(&self, key: &SessionKey) -> Option<Session> {
        self.lock().get(key).cloned()
    }

    /// Remove a session by id. Returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        let mut sessions = self.lock();
        let Some(key) = sessions.values().find(|s| s.id == id).map(|s| s.key.clone()) else {
            return false;
        };
        sessions.remove(&key);
        tracing::info!(session_id = %id, "Session removed");
        true
    }

    /// Add to a session's accumulated cost. Returns whether it exists.
    pub fn add_cost(&self, id: &str, usd: f64) -> bool {
        match self.lock().values_mut().find(|s| s.id == id) {
            Some(session) => {
                session.total_cost_usd += usd;
                true
            }
            None => false,
        }
    }

    /// Remove every session idle for longer than the timeout.
    pub fn sweep_expired(&self, now: i64) -> usize {
        let timeout = i64::try_from(self.config.timeout().as_millis()).unwrap_or(i64::MAX);
        let mut sessions = self.lock();
        let before = sessions.len();

        sessions.retain(|_, session| {
            let expired = now - session.last_active_at > timeout;
            if expired {
                tracing::debug!(session_id = %session.id, "Session expired");
            }
            !expired
        });

        let removed = before - sessions.len();
        if removed > 0 {
            tracing::info!(removed, remaining = sessions.len(), "Expired sessions swept");
        }
        removed
    }

    /// Snapshot of all live sessions.
    #[must_use]
    pub fn list_all(&self) -> Vec<Session> {
        self.lock().values().cloned().collect()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Sweep expired sessions on the configured interval until aborted.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.sweep_expired(self.clock.now_millis());
            }
        })
    }
}

fn evict_oldest(sessions: &mut HashMap<SessionKey, Session>) {
    let oldest = sessions
        .values()
        .min_by_key(|s| (s.last_active_at, s.created_at))
        .map(|s| (s.key.clone(), s.id.clone()));

    if let Some((key, id)) = oldest {
        sessions.remove(&key);
        tracing::info!(session_id = %id, "Session evicted (max concurrent reached)");
    }
}
