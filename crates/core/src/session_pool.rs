use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::client::{ChatClient, ClientKind};
use crate::client::helper::{HelperClient, HelperClientConfig};
use crate::config::SessionCredential;

const MAX_SESSION_ERRORS: u32 = 3;

/// A borrowed session. Single-owner: the pool hands each session to at most
/// one transfer at a time and the lease must be given back through
/// `release_session`.
pub struct SessionLease {
    pub session_id: String,
    pub client: Arc<dyn ChatClient>,
}

struct SessionSlot {
    client: Arc<dyn ChatClient>,
    premium_priority: bool,
    error_count: u32,
    quarantined: bool,
    flood_until: Option<Instant>,
    in_use: bool,
    last_used_at: Instant,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<String>,
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<String, SessionSlot>,
    premium_line: VecDeque<Waiter>,
    free_line: VecDeque<Waiter>,
    next_waiter: u64,
}

/// Fairly multiplexes a small set of authenticated identities across
/// concurrent requesters: premium waiters drain first, FIFO within a line,
/// faulty sessions are quarantined, flood-waited sessions are parked until
/// the mandated cooldown passes.
pub struct SessionPool {
    state: Mutex<PoolState>,
}

impl SessionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Loads configured helper sessions. A session that fails to connect is
    /// logged and omitted, never fatal to pool start.
    pub async fn initialize(self: &Arc<Self>, credentials: &[SessionCredential]) {
        for cred in credentials {
            let config = HelperClientConfig {
                session_id: cred.id.clone(),
                helper_path: cred.helper_path.clone(),
                session_b64: cred.session_b64.clone(),
                kind: ClientKind::User,
            };
            match HelperClient::connect(config).await {
                Ok(client) => {
                    self.add_session(&cred.id, Arc::new(client), cred.premium_priority);
                }
                Err(e) => {
                    warn!(
                        event = "pool.session_skipped",
                        session_id = %cred.id,
                        error = %e,
                        "pool.session_skipped"
                    );
                }
            }
        }
        info!(
            event = "pool.initialized",
            sessions = self.total(),
            "pool.initialized"
        );
    }

    pub fn add_session(
        self: &Arc<Self>,
        session_id: &str,
        client: Arc<dyn ChatClient>,
        premium_priority: bool,
    ) {
        let mut state = self.state.lock().expect("session pool mutex poisoned");
        state.sessions.insert(
            session_id.to_string(),
            SessionSlot {
                client,
                premium_priority,
                error_count: 0,
                quarantined: false,
                flood_until: None,
                in_use: false,
                last_used_at: Instant::now(),
            },
        );
        Self::grant_waiters(&mut state);
    }

    /// Admin removal. A session mid-transfer is never destroyed; it is
    /// quarantined instead and falls out of rotation once released.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let mut state = self.state.lock().expect("session pool mutex poisoned");
        match state.sessions.get_mut(session_id) {
            Some(slot) if slot.in_use => {
                slot.quarantined = true;
                true
            }
            Some(_) => {
                state.sessions.remove(session_id);
                true
            }
            None => false,
        }
    }

    pub fn total(&self) -> usize {
        self.state
            .lock()
            .expect("session pool mutex poisoned")
            .sessions
            .len()
    }

    pub fn available(&self) -> usize {
        let state = self.state.lock().expect("session pool mutex poisoned");
        let now = Instant::now();
        state
            .sessions
            .values()
            .filter(|s| Self::is_free(s, now))
            .count()
    }

    /// Error strikes currently held against a session.
    pub fn error_count(&self, session_id: &str) -> Option<u32> {
        let state = self.state.lock().expect("session pool mutex poisoned");
        state.sessions.get(session_id).map(|s| s.error_count)
    }

    fn is_free(slot: &SessionSlot, now: Instant) -> bool {
        !slot.in_use
            && !slot.quarantined
            && slot.flood_until.is_none_or(|until| until <= now)
    }

    fn take_free(state: &mut PoolState, premium: bool) -> Option<String> {
        let now = Instant::now();
        let mut candidates: Vec<(&String, &SessionSlot)> = state
            .sessions
            .iter()
            .filter(|(_, s)| Self::is_free(s, now))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Premium requesters prefer premium-priority sessions and vice
        // versa; least-recently-used within a class.
        candidates.sort_by_key(|(_, s)| (s.premium_priority != premium, s.last_used_at));
        let id = candidates[0].0.clone();
        let slot = state.sessions.get_mut(&id).expect("candidate disappeared");
        slot.in_use = true;
        slot.last_used_at = now;
        Some(id)
    }

    fn grant_waiters(state: &mut PoolState) {
        loop {
            let premium = if !state.premium_line.is_empty() {
                true
            } else if !state.free_line.is_empty() {
                false
            } else {
                return;
            };
            let Some(session_id) = Self::take_free(state, premium) else {
                return;
            };
            let line = if premium {
                &mut state.premium_line
            } else {
                &mut state.free_line
            };
            let waiter = line.pop_front().expect("line emptied under lock");
            if let Err(unclaimed) = waiter.tx.send(session_id) {
                // Receiver gave up (timeout); put the session back and try
                // the next waiter.
                let slot = state
                    .sessions
                    .get_mut(&unclaimed)
                    .expect("granted session disappeared");
                slot.in_use = false;
            }
        }
    }

    /// Blocks until a session is free or the timeout elapses. Premium
    /// requests take precedence among waiters; on timeout the caller must
    /// use its fallback path.
    pub async fn request_session(
        self: &Arc<Self>,
        is_premium: bool,
        timeout: Duration,
    ) -> Option<SessionLease> {
        let (waiter_id, mut rx) = {
            let mut state = self.state.lock().expect("session pool mutex poisoned");
            if state.sessions.is_empty() {
                return None;
            }
            if let Some(id) = Self::take_free(&mut state, is_premium) {
                let client = Arc::clone(&state.sessions[&id].client);
                debug!(event = "pool.grant", session_id = %id, is_premium, "pool.grant");
                return Some(SessionLease {
                    session_id: id,
                    client,
                });
            }
            let waiter_id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            let line = if is_premium {
                &mut state.premium_line
            } else {
                &mut state.free_line
            };
            line.push_back(Waiter { id: waiter_id, tx });
            (waiter_id, rx)
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(session_id)) => {
                let client = {
                    let state = self.state.lock().expect("session pool mutex poisoned");
                    Arc::clone(&state.sessions[&session_id].client)
                };
                debug!(event = "pool.grant", session_id = %session_id, is_premium, "pool.grant");
                Some(SessionLease { session_id, client })
            }
            Ok(Err(_)) => None,
            Err(_) => {
                // The lock lives in its own scope; the claim below awaits.
                let was_queued = {
                    let mut state = self.state.lock().expect("session pool mutex poisoned");
                    let line = if is_premium {
                        &mut state.premium_line
                    } else {
                        &mut state.free_line
                    };
                    let was_queued = line.iter().any(|w| w.id == waiter_id);
                    line.retain(|w| w.id != waiter_id);
                    was_queued
                };
                if was_queued {
                    debug!(event = "pool.timeout", is_premium, "pool.timeout");
                    return None;
                }
                // The grant raced the timeout; claim it rather than leak it.
                match rx.await {
                    Ok(session_id) => {
                        let client = {
                            let state = self.state.lock().expect("session pool mutex poisoned");
                            Arc::clone(&state.sessions[&session_id].client)
                        };
                        Some(SessionLease { session_id, client })
                    }
                    Err(_) => None,
                }
            }
        }
    }

    /// Returns a session to the pool. Repeated errors quarantine it; a
    /// positive flood wait parks it until the mandated cooldown passes.
    pub fn release_session(
        self: &Arc<Self>,
        session_id: &str,
        had_error: bool,
        flood_wait: Duration,
    ) {
        let mut state = self.state.lock().expect("session pool mutex poisoned");
        let Some(slot) = state.sessions.get_mut(session_id) else {
            return;
        };
        slot.in_use = false;
        slot.last_used_at = Instant::now();

        if had_error {
            slot.error_count += 1;
            if slot.error_count >= MAX_SESSION_ERRORS && !slot.quarantined {
                slot.quarantined = true;
                warn!(
                    event = "pool.quarantined",
                    session_id,
                    errors = slot.error_count,
                    "pool.quarantined"
                );
            }
        } else {
            slot.error_count = 0;
        }

        if !flood_wait.is_zero() {
            slot.flood_until = Some(Instant::now() + flood_wait);
            debug!(
                event = "pool.flood_parked",
                session_id,
                seconds = flood_wait.as_secs(),
                "pool.flood_parked"
            );
            let pool = Arc::clone(self);
            let id = session_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(flood_wait).await;
                pool.unpark(&id);
            });
            return;
        }

        Self::grant_waiters(&mut state);
    }

    fn unpark(&self, session_id: &str) {
        let mut state = self.state.lock().expect("session pool mutex poisoned");
        if let Some(slot) = state.sessions.get_mut(session_id) {
            slot.flood_until = None;
        }
        Self::grant_waiters(&mut state);
    }

    /// Drops all sessions and wakes every waiter empty-handed; startup
    /// hygiene mirror of the queue's `reset`.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("session pool mutex poisoned");
        state.sessions.clear();
        state.premium_line.clear();
        state.free_line.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ChatKind;
    use crate::client::sim::SimWorld;

    fn pool_with_sessions(n: usize) -> (Arc<SessionPool>, Arc<SimWorld>) {
        let world = SimWorld::new();
        world.add_chat(-100, ChatKind::Channel, None, false, true);
        let pool = SessionPool::new();
        for i in 0..n {
            let client = world.client(ClientKind::User, &format!("s{i}"));
            pool.add_session(&format!("s{i}"), client, false);
        }
        (pool, world)
    }

    #[tokio::test]
    async fn no_two_holders_share_a_session() {
        let (pool, _world) = pool_with_sessions(2);
        let a = pool
            .request_session(false, Duration::from_secs(1))
            .await
            .unwrap();
        let b = pool
            .request_session(false, Duration::from_secs(1))
            .await
            .unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert!(
            pool.request_session(false, Duration::from_millis(50))
                .await
                .is_none()
        );
        pool.release_session(&a.session_id, false, Duration::ZERO);
        pool.release_session(&b.session_id, false, Duration::ZERO);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn premium_waiter_is_served_before_free() {
        let (pool, _world) = pool_with_sessions(1);
        let held = pool
            .request_session(false, Duration::from_secs(1))
            .await
            .unwrap();

        let free_pool = Arc::clone(&pool);
        let free_waiter = tokio::spawn(async move {
            free_pool.request_session(false, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let prem_pool = Arc::clone(&pool);
        let prem_waiter = tokio::spawn(async move {
            prem_pool.request_session(true, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.release_session(&held.session_id, false, Duration::ZERO);
        let lease = prem_waiter.await.unwrap().unwrap();

        // Free waiter is still pending until the premium holder lets go.
        pool.release_session(&lease.session_id, false, Duration::ZERO);
        assert!(free_waiter.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn free_waiters_fifo_within_tier() {
        let (pool, _world) = pool_with_sessions(1);
        let held = pool
            .request_session(false, Duration::from_secs(1))
            .await
            .unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for tag in 1..=3u32 {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let lease = pool
                    .request_session(false, Duration::from_secs(5))
                    .await
                    .unwrap();
                order.lock().unwrap().push(tag);
                pool.release_session(&lease.session_id, false, Duration::ZERO);
            }));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        pool.release_session(&held.session_id, false, Duration::ZERO);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn timeout_returns_none() {
        let (pool, _world) = pool_with_sessions(1);
        let _held = pool
            .request_session(false, Duration::from_secs(1))
            .await
            .unwrap();
        let got = pool.request_session(false, Duration::from_millis(50)).await;
        assert!(got.is_none());
    }

    // A release landing right at a waiter's deadline must end with the
    // session either claimed or back in the pool, never leaked to a waiter
    // that already gave up.
    #[tokio::test]
    async fn grant_racing_a_timeout_is_reclaimed_not_leaked() {
        let (pool, _world) = pool_with_sessions(1);
        for _ in 0..20 {
            let held = pool
                .request_session(false, Duration::from_secs(1))
                .await
                .unwrap();
            let contender = {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    pool.request_session(false, Duration::from_millis(10)).await
                })
            };
            tokio::time::sleep(Duration::from_millis(10)).await;
            pool.release_session(&held.session_id, false, Duration::ZERO);
            if let Some(lease) = contender.await.unwrap() {
                pool.release_session(&lease.session_id, false, Duration::ZERO);
            }
            assert_eq!(pool.available(), 1);
        }
    }

    #[tokio::test]
    async fn repeated_errors_quarantine_the_session() {
        let (pool, _world) = pool_with_sessions(1);
        for _ in 0..MAX_SESSION_ERRORS {
            let lease = pool
                .request_session(false, Duration::from_secs(1))
                .await
                .unwrap();
            pool.release_session(&lease.session_id, true, Duration::ZERO);
        }
        assert_eq!(pool.available(), 0);
        assert!(
            pool.request_session(false, Duration::from_millis(50))
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn flood_wait_parks_and_reenters() {
        let (pool, _world) = pool_with_sessions(1);
        let lease = pool
            .request_session(false, Duration::from_secs(1))
            .await
            .unwrap();
        pool.release_session(&lease.session_id, false, Duration::from_millis(80));
        assert_eq!(pool.available(), 0);

        // Waiter outlasts the park and gets the session back.
        let lease = pool
            .request_session(false, Duration::from_secs(5))
            .await
            .unwrap();
        pool.release_session(&lease.session_id, false, Duration::ZERO);
    }
}
