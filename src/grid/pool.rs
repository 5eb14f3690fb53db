//! Token pool: exclusive reservation of execution slots.
//!
//! Selection picks the best free token for a set of interests. When every
//! eligible token is busy the caller queues up and a released token is handed
//! directly to the oldest waiter it satisfies. Waiting is bounded by
//! `match_timeout` when an eligible token exists and `no_match_timeout` when
//! none does, and can be cancelled at any time.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::error::RoutingError;
use crate::grid::interest::{SelectionCriteria, affinity_score, describe};
use crate::grid::token::{AgentRef, Token, TokenId};

/// Pool-side bookkeeping for one token.
#[derive(Debug)]
struct Slot {
    token: Token,
    busy: bool,
    invalidated: bool,
    /// Tick of the last release (registration counts as a release).
    released_at: u64,
    last_touch: Instant,
}

/// Outcome delivered to a queued caller.
enum Grant {
    Token(Token),
    NoMatch,
}

struct Waiter {
    id: u64,
    criteria: SelectionCriteria,
    tx: oneshot::Sender<Grant>,
}

#[derive(Default)]
struct PoolState {
    slots: HashMap<TokenId, Slot>,
    waiters: VecDeque<Waiter>,
    tick: u64,
    next_waiter: u64,
}

/// Result of scanning the pool for one set of criteria.
struct Search {
    best_free: Option<TokenId>,
    any_match: bool,
}

impl PoolState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn search(&self, criteria: &SelectionCriteria) -> Search {
        let mut any_match = false;
        let mut best: Option<(usize, u64, &TokenId)> = None;

        for (id, slot) in &self.slots {
            if slot.invalidated {
                continue;
            }
            let Some(score) = affinity_score(criteria, slot.token.attributes()) else {
                continue;
            };
            any_match = true;
            if slot.busy {
                continue;
            }
            // Higher score wins, then the least recently released.
            let better = match best {
                None => true,
                Some((best_score, best_released, _)) => {
                    score > best_score || (score == best_score && slot.released_at < best_released)
                }
            };
            if better {
                best = Some((score, slot.released_at, id));
            }
        }

        Search {
            best_free: best.map(|(_, _, id)| id.clone()),
            any_match,
        }
    }

    /// Hand a free token to the oldest waiter it satisfies.
    fn dispatch(&mut self, id: &TokenId) {
        let Some(slot) = self.slots.get(id) else {
            return;
        };
        if slot.busy || slot.invalidated {
            return;
        }
        let token = slot.token.clone();

        while let Some(pos) = self.waiters.iter().position(|w| {
            !w.tx.is_closed() && affinity_score(&w.criteria, token.attributes()).is_some()
        }) {
            let Some(waiter) = self.waiters.remove(pos) else {
                break;
            };
            if waiter.tx.send(Grant::Token(token.clone())).is_ok() {
                if let Some(slot) = self.slots.get_mut(id) {
                    slot.busy = true;
                }
                tracing::debug!(token = %id, waiter = waiter.id, "Handed released token to waiter");
                return;
            }
        }
        self.waiters.retain(|w| !w.tx.is_closed());
    }

    /// Fail waiters that can no longer be satisfied by any token.
    fn notify_unmatched(&mut self) {
        let waiters = std::mem::take(&mut self.waiters);
        for waiter in waiters {
            if waiter.tx.is_closed() {
                continue;
            }
            if self.search(&waiter.criteria).any_match {
                self.waiters.push_back(waiter);
            } else {
                tracing::debug!(waiter = waiter.id, "No token left for waiter");
                let _ = waiter.tx.send(Grant::NoMatch);
            }
        }
    }

    fn remove(&mut self, id: &TokenId) {
        if self.slots.remove(id).is_some() {
            tracing::info!(token = %id, "Token removed from pool");
            self.notify_unmatched();
        }
    }
}

/// Registry of tokens with exclusive reservation.
pub struct TokenPool {
    state: Mutex<PoolState>,
    config: PoolConfig,
}

impl TokenPool {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Register a new free token for `agent` with the given attributes.
    pub fn register(&self, agent: AgentRef, attributes: BTreeMap<String, String>) -> Token {
        let token = Token::new(agent, attributes);
        self.offer(token.clone());
        token
    }

    /// Offer a token to the pool. Offering a known token only refreshes its keepalive.
    pub fn offer(&self, token: Token) {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let Some(slot) = state.slots.get_mut(token.id()) {
            slot.last_touch = now;
            return;
        }

        let id = token.id().clone();
        let released_at = state.next_tick();
        tracing::info!(token = %id, agent = %token.agent().agent_id, "Token registered");
        state.slots.insert(
            id.clone(),
            Slot {
                token,
                busy: false,
                invalidated: false,
                released_at,
                last_touch: now,
            },
        );
        state.dispatch(&id);
    }

    /// Select with the pool's configured timeouts.
    pub async fn select_default(
        &self,
        criteria: &SelectionCriteria,
        cancel: &CancellationToken,
    ) -> Result<Token, RoutingError> {
        self.select(
            criteria,
            self.config.match_timeout,
            self.config.no_match_timeout,
            cancel,
        )
        .await
    }

    /// Reserve a free token satisfying every required interest in `criteria`.
    ///
    /// The returned token must be passed to [`TokenPool::release`] exactly once.
    pub async fn select(
        &self,
        criteria: &SelectionCriteria,
        match_timeout: Duration,
        no_match_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Token, RoutingError> {
        if cancel.is_cancelled() {
            return Err(RoutingError::Cancelled);
        }

        let (waiter_id, rx, wait) = {
            let mut state = self.state.lock();
            let search = state.search(criteria);
            if let Some(id) = search.best_free {
                if let Some(slot) = state.slots.get_mut(&id) {
                    slot.busy = true;
                    tracing::debug!(token = %id, criteria = %describe(criteria), "Token selected without queuing");
                    return Ok(slot.token.clone());
                }
            }

            let wait = if search.any_match {
                match_timeout
            } else {
                no_match_timeout
            };
            let (tx, rx) = oneshot::channel();
            state.next_waiter += 1;
            let waiter_id = state.next_waiter;
            state.waiters.push_back(Waiter {
                id: waiter_id,
                criteria: criteria.clone(),
                tx,
            });
            (waiter_id, rx, wait)
        };

        tracing::debug!(waiter = waiter_id, criteria = %describe(criteria), ?wait, "No free token, queuing");
        let mut pending = Pending {
            pool: self,
            waiter_id,
            criteria,
            rx: Some(rx),
        };

        enum Wake {
            Granted(Result<Grant, oneshot::error::RecvError>),
            Cancelled,
            Elapsed,
        }

        let wake = tokio::select! {
            biased;
            grant = pending.recv() => Wake::Granted(grant),
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = tokio::time::sleep(wait) => Wake::Elapsed,
        };

        match wake {
            Wake::Granted(grant) => {
                pending.rx = None;
                match grant {
                    Ok(Grant::Token(token)) => Ok(token),
                    Ok(Grant::NoMatch) => Err(RoutingError::NoMatch {
                        criteria: describe(criteria),
                    }),
                    Err(_) => Err(RoutingError::Cancelled),
                }
            }
            Wake::Cancelled => {
                let (late, _) = pending.abandon();
                if let Some(Grant::Token(token)) = late {
                    self.release(&token);
                }
                Err(RoutingError::Cancelled)
            }
            Wake::Elapsed => match pending.abandon() {
                (Some(Grant::Token(token)), _) => Ok(token),
                (Some(Grant::NoMatch), _) | (None, false) => {
                    tracing::warn!(criteria = %describe(criteria), "No token matches selection criteria");
                    Err(RoutingError::NoMatch {
                        criteria: describe(criteria),
                    })
                }
                (None, true) => {
                    tracing::warn!(criteria = %describe(criteria), ?wait, "Timeout while selecting token");
                    Err(RoutingError::Timeout { waited: wait })
                }
            },
        }
    }

    /// Mark a reserved token free again. Never fails.
    pub fn release(&self, token: &Token) {
        let mut state = self.state.lock();
        let id = token.id();
        let tick = state.next_tick();
        let Some(slot) = state.slots.get_mut(id) else {
            tracing::debug!(token = %id, "Release of a token no longer in the pool");
            return;
        };
        if !slot.busy {
            tracing::warn!(token = %id, "Token released while not reserved");
            return;
        }
        if slot.invalidated {
            state.remove(id);
            return;
        }
        slot.busy = false;
        slot.released_at = tick;
        slot.last_touch = Instant::now();
        tracing::debug!(token = %id, "Token released");
        state.dispatch(id);
    }

    /// Remove a token, e.g. when its agent disconnects.
    ///
    /// A reserved token is removed once it is released.
    pub fn unregister(&self, id: &TokenId) {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(id) else {
            return;
        };
        slot.invalidated = true;
        if slot.busy {
            tracing::info!(token = %id, "Token invalidated while reserved");
            // Waiters counting on this token may have nothing left.
            state.notify_unmatched();
        } else {
            state.remove(id);
        }
    }

    /// Refresh a token's keepalive.
    pub fn keepalive(&self, id: &TokenId) {
        if let Some(slot) = self.state.lock().slots.get_mut(id) {
            slot.last_touch = Instant::now();
        }
    }

    /// Unregister tokens whose keepalive expired. Returns how many were invalidated.
    pub fn sweep_expired(&self) -> usize {
        let Some(timeout) = self.config.keepalive_timeout else {
            return 0;
        };
        let now = Instant::now();
        let expired: Vec<TokenId> = self
            .state
            .lock()
            .slots
            .iter()
            .filter(|(_, slot)| !slot.invalidated && now.duration_since(slot.last_touch) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            tracing::warn!(token = %id, "Token keepalive expired");
            self.unregister(id);
        }
        expired.len()
    }

    /// Whether a free token currently satisfies `criteria`.
    pub fn exists_available_match(&self, criteria: &SelectionCriteria) -> bool {
        self.state.lock().search(criteria).best_free.is_some()
    }

    /// Number of registered tokens.
    pub fn size(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Number of reserved tokens.
    pub fn busy_count(&self) -> usize {
        self.state.lock().slots.values().filter(|s| s.busy).count()
    }

    /// Number of callers queued for a token.
    pub fn waiting(&self) -> usize {
        self.state
            .lock()
            .waiters
            .iter()
            .filter(|w| !w.tx.is_closed())
            .count()
    }

    /// Snapshot of registered tokens.
    pub fn tokens(&self) -> Vec<Token> {
        self.state
            .lock()
            .slots
            .values()
            .map(|s| s.token.clone())
            .collect()
    }
}

/// A queued selection. Dropping it before completion withdraws the waiter
/// and returns any token granted in the meantime.
struct Pending<'a> {
    pool: &'a TokenPool,
    waiter_id: u64,
    criteria: &'a SelectionCriteria,
    rx: Option<oneshot::Receiver<Grant>>,
}

impl Pending<'_> {
    async fn recv(&mut self) -> Result<Grant, oneshot::error::RecvError> {
        match self.rx.as_mut() {
            Some(rx) => rx.await,
            None => std::future::pending().await,
        }
    }

    /// Withdraw from the queue. Returns a grant that raced the withdrawal and
    /// whether an eligible token exists at this point.
    fn abandon(&mut self) -> (Option<Grant>, bool) {
        let Some(mut rx) = self.rx.take() else {
            return (None, false);
        };
        let mut state = self.pool.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.id != self.waiter_id);
        let any_match = state.search(self.criteria).any_match;
        if state.waiters.len() < before {
            return (None, any_match);
        }
        drop(state);
        // Already granted under the lock, so the value is in the channel.
        (rx.try_recv().ok(), any_match)
    }
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        if self.rx.is_some() {
            if let (Some(Grant::Token(token)), _) = self.abandon() {
                self.pool.release(&token);
            }
        }
    }
}

/// Spawn a background task that periodically invalidates tokens whose keepalive expired.
pub fn spawn_keepalive_sweep(pool: Arc<TokenPool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(pool.config().sweep_interval);
        loop {
            interval.tick().await;
            let expired = pool.sweep_expired();
            if expired > 0 {
                tracing::info!(expired, "Keepalive sweep invalidated tokens");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::interest::Interest;

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn criteria(pairs: &[(&str, &str, bool)]) -> SelectionCriteria {
        pairs
            .iter()
            .map(|(k, p, required)| (k.to_string(), Interest::regex(p, *required).unwrap()))
            .collect()
    }

    fn pool() -> TokenPool {
        TokenPool::new(PoolConfig::default())
    }

    fn agent() -> AgentRef {
        AgentRef::new("agent-1", "")
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn select_matching_token() {
        let pool = pool();
        pool.register(agent(), attrs(&[("color", "red"), ("shape", "circle")]));

        let token = pool
            .select(&criteria(&[("color", "red", true)]), SHORT, SHORT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(token.attribute("color"), Some("red"));
        assert_eq!(pool.busy_count(), 1);
    }

    #[tokio::test]
    async fn optional_interest_prefers_better_score() {
        let pool = pool();
        pool.register(agent(), attrs(&[("color", "red"), ("shape", "triangle")]));
        pool.register(agent(), attrs(&[("color", "red"), ("shape", "circle")]));

        let wanted = criteria(&[("color", "red", true), ("shape", "circle", false)]);
        let token = pool
            .select(&wanted, SHORT, SHORT, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(token.attribute("shape"), Some("circle"));
    }

    #[tokio::test]
    async fn tie_break_is_least_recently_released() {
        let pool = pool();
        let first = pool.register(agent(), attrs(&[("type", "fast"), ("id", "1")]));
        let second = pool.register(agent(), attrs(&[("type", "fast"), ("id", "2")]));
        let wanted = criteria(&[("type", "fast", true)]);
        let cancel = CancellationToken::new();

        // Never released: registration order decides.
        let a = pool.select(&wanted, SHORT, SHORT, &cancel).await.unwrap();
        assert_eq!(a, first);
        pool.release(&a);

        // `first` was just released, so `second` is now the least recent.
        let b = pool.select(&wanted, SHORT, SHORT, &cancel).await.unwrap();
        assert_eq!(b, second);
        pool.release(&b);

        let c = pool.select(&wanted, SHORT, SHORT, &cancel).await.unwrap();
        assert_eq!(c, first);
        pool.release(&c);
    }

    #[tokio::test]
    async fn repeated_selection_returns_only_matching_token() {
        let pool = pool();
        let fast = pool.register(agent(), attrs(&[("type", "fast")]));
        pool.register(agent(), attrs(&[("type", "slow")]));
        let wanted = criteria(&[("type", "fast", true)]);
        let cancel = CancellationToken::new();

        for _ in 0..100 {
            let token = pool.select(&wanted, SHORT, SHORT, &cancel).await.unwrap();
            assert_eq!(token, fast);
            pool.release(&token);
        }
    }

    #[tokio::test]
    async fn no_match_fails_within_bound() {
        let pool = pool();
        pool.register(agent(), attrs(&[("type", "fast")]));
        pool.register(agent(), attrs(&[("type", "slow")]));

        let started = Instant::now();
        let err = pool
            .select(
                &criteria(&[("type", "medium", true)]),
                Duration::from_secs(5),
                SHORT,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::NoMatch { .. }));
        assert!(started.elapsed() < Duration::from_millis(50) + Duration::from_millis(200));
        assert_eq!(pool.waiting(), 0);
    }

    #[tokio::test]
    async fn busy_match_times_out() {
        let pool = pool();
        pool.register(agent(), attrs(&[("type", "fast")]));
        let wanted = criteria(&[("type", "fast", true)]);
        let cancel = CancellationToken::new();

        let held = pool.select(&wanted, SHORT, SHORT, &cancel).await.unwrap();
        let err = pool.select(&wanted, SHORT, Duration::from_secs(5), &cancel).await.unwrap_err();
        assert!(matches!(err, RoutingError::Timeout { .. }));

        pool.release(&held);
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn waiter_receives_released_token() {
        let pool = Arc::new(pool());
        pool.register(agent(), attrs(&[("type", "fast")]));
        let wanted = criteria(&[("type", "fast", true)]);
        let cancel = CancellationToken::new();

        let held = pool.select(&wanted, SHORT, SHORT, &cancel).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let wanted = wanted.clone();
            tokio::spawn(async move {
                pool.select(&wanted, Duration::from_secs(5), SHORT, &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.waiting(), 1);

        pool.release(&held);
        let token = waiter.await.unwrap().unwrap();
        assert_eq!(token, held);
        assert_eq!(pool.busy_count(), 1);
    }

    #[tokio::test]
    async fn cancellation_is_distinct_and_leaves_pool_consistent() {
        let pool = Arc::new(pool());
        pool.register(agent(), attrs(&[("type", "fast")]));
        let wanted = criteria(&[("type", "fast", true)]);

        let held = pool
            .select(&wanted, SHORT, SHORT, &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let pool = Arc::clone(&pool);
            let wanted = wanted.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                pool.select(&wanted, Duration::from_secs(5), SHORT, &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RoutingError::Cancelled));
        assert_eq!(pool.waiting(), 0);

        pool.release(&held);
        assert_eq!(pool.busy_count(), 0);
        assert!(pool.exists_available_match(&wanted));
    }

    #[tokio::test]
    async fn dropped_selection_withdraws_waiter() {
        let pool = pool();
        pool.register(agent(), attrs(&[("type", "fast")]));
        let wanted = criteria(&[("type", "fast", true)]);
        let cancel = CancellationToken::new();

        let held = pool.select(&wanted, SHORT, SHORT, &cancel).await.unwrap();
        let outer = tokio::time::timeout(
            Duration::from_millis(20),
            pool.select(&wanted, Duration::from_secs(5), SHORT, &cancel),
        )
        .await;
        assert!(outer.is_err());
        assert_eq!(pool.waiting(), 0);

        pool.release(&held);
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn late_registration_satisfies_waiter() {
        let pool = Arc::new(pool());
        let wanted = criteria(&[("type", "gpu", true)]);

        let waiter = {
            let pool = Arc::clone(&pool);
            let wanted = wanted.clone();
            tokio::spawn(async move {
                pool.select(&wanted, SHORT, Duration::from_secs(5), &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let gpu = pool.register(agent(), attrs(&[("type", "gpu")]));
        let token = waiter.await.unwrap().unwrap();
        assert_eq!(token, gpu);
    }

    #[tokio::test]
    async fn unregister_free_token_removes_it() {
        let pool = pool();
        let token = pool.register(agent(), attrs(&[("id", "1")]));
        pool.unregister(token.id());
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn unregister_busy_token_removes_on_release() {
        let pool = pool();
        pool.register(agent(), attrs(&[("id", "1")]));
        let wanted = criteria(&[("id", "1", true)]);

        let token = pool
            .select(&wanted, SHORT, SHORT, &CancellationToken::new())
            .await
            .unwrap();
        pool.unregister(token.id());
        assert_eq!(pool.size(), 1);

        pool.release(&token);
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn unregister_fails_waiters_without_match() {
        let pool = Arc::new(pool());
        pool.register(agent(), attrs(&[("id", "1")]));
        let wanted = criteria(&[("id", "1", true)]);

        let token = pool
            .select(&wanted, SHORT, SHORT, &CancellationToken::new())
            .await
            .unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            let wanted = wanted.clone();
            tokio::spawn(async move {
                pool.select(&wanted, Duration::from_secs(5), SHORT, &CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.unregister(token.id());
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, RoutingError::NoMatch { .. }));
    }

    #[tokio::test]
    async fn keepalive_sweep_invalidates_idle_tokens() {
        let pool = TokenPool::new(PoolConfig {
            keepalive_timeout: Some(Duration::from_millis(10)),
            ..PoolConfig::default()
        });
        let stale = pool.register(agent(), attrs(&[("id", "stale")]));
        tokio::time::sleep(Duration::from_millis(30)).await;
        let fresh = pool.register(agent(), attrs(&[("id", "fresh")]));

        assert_eq!(pool.sweep_expired(), 1);
        let remaining = pool.tokens();
        assert_eq!(remaining, vec![fresh]);
        assert!(!remaining.contains(&stale));
    }

    #[tokio::test]
    async fn double_release_is_harmless() {
        let pool = pool();
        pool.register(agent(), attrs(&[("id", "1")]));
        let token = pool
            .select(&criteria(&[]), SHORT, SHORT, &CancellationToken::new())
            .await
            .unwrap();
        pool.release(&token);
        pool.release(&token);
        assert_eq!(pool.busy_count(), 0);
        assert_eq!(pool.size(), 1);
    }
}
