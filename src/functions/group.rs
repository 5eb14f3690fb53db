//! Pinning scopes: one worker reused across a group of related calls.

use std::future::Future;
use std::sync::Arc;

use crate::agent::AgentClient;
use crate::error::Error;
use crate::grid::{SelectionCriteria, Token, TokenPool};

/// Ownership of a selected token until it is handed back.
///
/// Ending the lease closes its agent session, if any, then returns the token
/// to its pool. A lease dropped without [`Lease::end`] does the same in the
/// background.
pub struct Lease {
    token: Token,
    pool: Option<Arc<TokenPool>>,
    session: Option<Arc<dyn AgentClient>>,
}

impl Lease {
    /// Lease of a pooled token, or of a local token when `pool` is `None`.
    pub fn new(token: Token, pool: Option<Arc<TokenPool>>) -> Self {
        Self {
            token,
            pool,
            session: None,
        }
    }

    /// Also close the reservation session held on `client` when ending.
    pub fn with_session(mut self, client: Arc<dyn AgentClient>) -> Self {
        self.session = Some(client);
        self
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub async fn end(mut self) {
        if let Some(client) = self.session.take()
            && let Err(e) = client.release_session(&self.token).await
        {
            tracing::warn!(token = %self.token.id(), error = %e, "Failed to release agent session");
        }
        if let Some(pool) = self.pool.take() {
            pool.release(&self.token);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let pool = self.pool.take();
        let session = self.session.take();
        if pool.is_none() && session.is_none() {
            return;
        }

        let token = self.token.clone();
        let Some(client) = session else {
            if let Some(pool) = pool {
                pool.release(&token);
            }
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.release_session(&token).await {
                        tracing::warn!(token = %token.id(), error = %e, "Failed to release agent session");
                    }
                    if let Some(pool) = pool {
                        pool.release(&token);
                    }
                });
            }
            Err(_) => {
                tracing::warn!(token = %token.id(), "No runtime to release agent session");
                if let Some(pool) = pool {
                    pool.release(&token);
                }
            }
        }
    }
}

#[derive(Default)]
struct Pinned {
    local: Option<Lease>,
    remote: Option<Lease>,
}

/// A scope pinning at most one local and one remote token.
///
/// Calls routed through the group reuse its pinned tokens. They are handed
/// back when the group is closed or dropped.
pub struct FunctionGroup {
    criteria: SelectionCriteria,
    pinned: tokio::sync::Mutex<Pinned>,
}

impl FunctionGroup {
    pub fn new() -> Self {
        Self::with_criteria(SelectionCriteria::new())
    }

    /// A group whose criteria apply to every call routed through it.
    pub fn with_criteria(criteria: SelectionCriteria) -> Self {
        Self {
            criteria,
            pinned: tokio::sync::Mutex::new(Pinned::default()),
        }
    }

    pub fn criteria(&self) -> &SelectionCriteria {
        &self.criteria
    }

    pub async fn pinned(&self, local: bool) -> Option<Token> {
        let pinned = self.pinned.lock().await;
        let slot = if local { &pinned.local } else { &pinned.remote };
        slot.as_ref().map(|lease| lease.token().clone())
    }

    /// The pinned token of the requested kind, pinning one with `pin` if
    /// the slot is empty.
    pub(crate) async fn get_or_pin<F, Fut>(&self, local: bool, pin: F) -> Result<Token, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Lease, Error>>,
    {
        let mut pinned = self.pinned.lock().await;
        let slot = if local {
            &mut pinned.local
        } else {
            &mut pinned.remote
        };
        if let Some(lease) = slot {
            return Ok(lease.token().clone());
        }

        let lease = pin().await?;
        let token = lease.token().clone();
        tracing::debug!(token = %token.id(), local, "Pinned token to group");
        *slot = Some(lease);
        Ok(token)
    }

    /// Hand back all pinned tokens. The group can be reused afterwards.
    pub async fn close(&self) {
        let (local, remote) = {
            let mut pinned = self.pinned.lock().await;
            (pinned.local.take(), pinned.remote.take())
        };
        for lease in [local, remote].into_iter().flatten() {
            tracing::debug!(token = %lease.token().id(), "Unpinning token");
            lease.end().await;
        }
    }
}

impl Default for FunctionGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::PoolConfig;
    use crate::error::AgentError;
    use crate::functions::model::{InputMessage, OutputMessage};
    use crate::grid::AgentRef;

    #[derive(Default)]
    struct SessionCounter {
        released: AtomicUsize,
    }

    #[async_trait]
    impl AgentClient for SessionCounter {
        async fn call(&self, _token: &Token, _input: InputMessage) -> Result<OutputMessage, AgentError> {
            Ok(OutputMessage::default())
        }

        async fn reserve_session(&self, _token: &Token) -> Result<(), AgentError> {
            Ok(())
        }

        async fn release_session(&self, _token: &Token) -> Result<(), AgentError> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn reserved(pool: &Arc<TokenPool>) -> Token {
        pool.select_default(&SelectionCriteria::new(), &CancellationToken::new())
            .await
            .unwrap()
    }

    fn pool() -> Arc<TokenPool> {
        let pool = Arc::new(TokenPool::new(PoolConfig::default()));
        pool.register(AgentRef::new("agent-1", ""), BTreeMap::new());
        pool
    }

    #[tokio::test]
    async fn pins_once_and_reuses() {
        let pool = pool();
        let group = FunctionGroup::new();
        let pins = AtomicUsize::new(0);

        for _ in 0..3 {
            group
                .get_or_pin(false, || async {
                    pins.fetch_add(1, Ordering::SeqCst);
                    Ok(Lease::new(reserved(&pool).await, Some(pool.clone())))
                })
                .await
                .unwrap();
        }

        assert_eq!(pins.load(Ordering::SeqCst), 1);
        assert_eq!(pool.busy_count(), 1);
        assert!(group.pinned(false).await.is_some());
        assert!(group.pinned(true).await.is_none());
    }

    #[tokio::test]
    async fn close_releases_token_and_session() {
        let pool = pool();
        let client = Arc::new(SessionCounter::default());
        let group = FunctionGroup::new();

        group
            .get_or_pin(false, || async {
                Ok(Lease::new(reserved(&pool).await, Some(pool.clone())).with_session(client.clone()))
            })
            .await
            .unwrap();
        group.close().await;

        assert_eq!(pool.busy_count(), 0);
        assert_eq!(client.released.load(Ordering::SeqCst), 1);
        assert!(group.pinned(false).await.is_none());
    }

    #[tokio::test]
    async fn dropping_group_releases_in_background() {
        let pool = pool();
        let client = Arc::new(SessionCounter::default());

        {
            let group = FunctionGroup::new();
            group
                .get_or_pin(false, || async {
                    Ok(Lease::new(reserved(&pool).await, Some(pool.clone()))
                        .with_session(client.clone()))
                })
                .await
                .unwrap();
        }

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(pool.busy_count(), 0);
        assert_eq!(client.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_pin_leaves_slot_empty() {
        let group = FunctionGroup::new();
        let err = group
            .get_or_pin(true, || async {
                Err(Error::Agent(AgentError::Communication {
                    agent_id: "a".into(),
                    reason: "down".into(),
                }))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Agent(_)));
        assert!(group.pinned(true).await.is_none());
    }
}
