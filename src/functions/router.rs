//! Function router: one token per invocation, with guaranteed disposal.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::AgentClient;
use crate::error::{AgentError, Error};
use crate::functions::criteria::{call_site_criteria, merge};
use crate::functions::group::{FunctionGroup, Lease};
use crate::functions::model::{Bindings, CallSite, Function};
use crate::functions::types::{FunctionType, FunctionTypeRegistry};
use crate::grid::{SelectionCriteria, Token, TokenPool};

/// A resolved token and where to send the call.
///
/// Owns the token unless it is pinned by a group. Call
/// [`Routed::release`] after the invocation; dropping it releases as well.
pub struct Routed {
    token: Token,
    client: Arc<dyn AgentClient>,
    lease: Option<Lease>,
}

impl std::fmt::Debug for Routed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routed")
            .field("token", &self.token)
            .field("pinned", &self.lease.is_none())
            .finish_non_exhaustive()
    }
}

impl Routed {
    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn client(&self) -> &Arc<dyn AgentClient> {
        &self.client
    }

    /// Whether the token belongs to a group rather than to this call.
    pub fn is_pinned(&self) -> bool {
        self.lease.is_none()
    }

    pub async fn release(self) {
        if let Some(lease) = self.lease {
            lease.end().await;
        }
    }
}

pub struct FunctionRouter {
    pool: Arc<TokenPool>,
    types: Arc<FunctionTypeRegistry>,
    remote: Arc<dyn AgentClient>,
    local: Arc<dyn AgentClient>,
}

impl FunctionRouter {
    /// `remote` reaches pooled agents, `local` is the in-process agent.
    pub fn new(
        pool: Arc<TokenPool>,
        types: Arc<FunctionTypeRegistry>,
        remote: Arc<dyn AgentClient>,
        local: Arc<dyn AgentClient>,
    ) -> Self {
        Self {
            pool,
            types,
            remote,
            local,
        }
    }

    pub fn pool(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    pub fn types(&self) -> &Arc<FunctionTypeRegistry> {
        &self.types
    }

    /// Criteria for one call of `function`, merged by priority.
    pub fn selection_criteria(
        &self,
        function: &Function,
        function_type: &dyn FunctionType,
        call_site: &CallSite,
        bindings: &Bindings,
        group: Option<&FunctionGroup>,
    ) -> Result<SelectionCriteria, Error> {
        let call_site = call_site_criteria(call_site, bindings)?;
        let type_criteria = function_type.criteria(function);
        let empty = SelectionCriteria::new();
        let group_criteria = group.map(FunctionGroup::criteria).unwrap_or(&empty);
        Ok(merge([
            &call_site,
            &function.criteria,
            group_criteria,
            &type_criteria,
        ]))
    }

    /// Resolve the token for one call of `function`.
    pub async fn route(
        &self,
        function: &Function,
        call_site: &CallSite,
        bindings: &Bindings,
        group: Option<&FunctionGroup>,
        cancel: &CancellationToken,
    ) -> Result<Routed, Error> {
        let function_type = self.types.resolve(function)?;
        self.route_as(function, function_type.as_ref(), call_site, bindings, group, cancel)
            .await
    }

    /// Like [`FunctionRouter::route`], with the function type already resolved.
    pub async fn route_as(
        &self,
        function: &Function,
        function_type: &dyn FunctionType,
        call_site: &CallSite,
        bindings: &Bindings,
        group: Option<&FunctionGroup>,
        cancel: &CancellationToken,
    ) -> Result<Routed, Error> {
        let criteria =
            self.selection_criteria(function, function_type, call_site, bindings, group)?;
        let local = function.execute_locally;
        let client = if local {
            Arc::clone(&self.local)
        } else {
            Arc::clone(&self.remote)
        };

        let Some(group) = group else {
            let lease = self.select(local, &criteria, cancel).await?;
            let token = lease.token().clone();
            tracing::debug!(function = %function.name, token = %token.id(), local, "Routed call");
            return Ok(Routed {
                token,
                client,
                lease: Some(lease),
            });
        };

        let token = group
            .get_or_pin(local, || async {
                let lease = self.select(local, &criteria, cancel).await?;
                // A failed reservation drops the lease, which frees the token.
                client
                    .reserve_session(lease.token())
                    .await
                    .map_err(|e| Error::Agent(communication(lease.token(), e)))?;
                Ok(lease.with_session(Arc::clone(&client)))
            })
            .await?;
        tracing::debug!(function = %function.name, token = %token.id(), local, "Routed call to pinned token");
        Ok(Routed {
            token,
            client,
            lease: None,
        })
    }

    async fn select(
        &self,
        local: bool,
        criteria: &SelectionCriteria,
        cancel: &CancellationToken,
    ) -> Result<Lease, Error> {
        if local {
            return Ok(Lease::new(Token::local(), None));
        }
        let token = self.pool.select_default(criteria, cancel).await?;
        Ok(Lease::new(token, Some(Arc::clone(&self.pool))))
    }
}

fn communication(token: &Token, error: AgentError) -> AgentError {
    match error {
        AgentError::Communication { .. } => error,
        other => AgentError::Communication {
            agent_id: token.agent().agent_id.clone(),
            reason: format!("session reservation failed: {other}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::config::PoolConfig;
    use crate::error::RoutingError;
    use crate::functions::model::{InputMessage, OutputMessage};
    use crate::functions::types::{RUNTIME_ATTRIBUTE, RuntimeFunctionType};
    use crate::grid::{AgentRef, Interest};

    #[derive(Default)]
    struct StubClient {
        fail_reserve: AtomicBool,
        reserved: AtomicUsize,
        released: AtomicUsize,
    }

    #[async_trait]
    impl AgentClient for StubClient {
        async fn call(&self, _token: &Token, _input: InputMessage) -> Result<OutputMessage, AgentError> {
            Ok(OutputMessage::default())
        }

        async fn reserve_session(&self, token: &Token) -> Result<(), AgentError> {
            if self.fail_reserve.load(Ordering::SeqCst) {
                return Err(AgentError::Communication {
                    agent_id: token.agent().agent_id.clone(),
                    reason: "connection refused".into(),
                });
            }
            self.reserved.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release_session(&self, _token: &Token) -> Result<(), AgentError> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        router: FunctionRouter,
        remote: Arc<StubClient>,
    }

    fn fixture() -> Fixture {
        let pool = Arc::new(TokenPool::new(PoolConfig {
            match_timeout: Duration::from_millis(50),
            no_match_timeout: Duration::from_millis(20),
            ..PoolConfig::default()
        }));
        for zone in ["eu", "us"] {
            let attrs: BTreeMap<String, String> = [
                (RUNTIME_ATTRIBUTE.to_string(), "js".to_string()),
                ("zone".to_string(), zone.to_string()),
            ]
            .into_iter()
            .collect();
            pool.register(AgentRef::new(format!("agent-{zone}"), ""), attrs);
        }

        let types = Arc::new(FunctionTypeRegistry::new());
        types.register(Arc::new(RuntimeFunctionType::new("script", "js", "script")));
        types.register(Arc::new(RuntimeFunctionType::new("python", "py", "python")));

        let remote = Arc::new(StubClient::default());
        let router = FunctionRouter::new(
            pool,
            types,
            remote.clone(),
            Arc::new(StubClient::default()),
        );
        Fixture { router, remote }
    }

    #[tokio::test]
    async fn unpinned_route_releases_after_use() {
        let f = fixture();
        let function = Function::new("f", "script");

        let routed = f
            .router
            .route(&function, &CallSite::new(), &Bindings::new(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!routed.is_pinned());
        assert_eq!(f.router.pool().busy_count(), 1);

        routed.release().await;
        assert_eq!(f.router.pool().busy_count(), 0);
        assert_eq!(f.remote.reserved.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn route_as_uses_given_type_without_lookup() {
        let f = fixture();
        // "ruby" is not registered; the supplied type decides the criteria.
        let function = Function::new("f", "ruby");
        let py_type = RuntimeFunctionType::new("ruby", "py", "ruby");
        let js_type = RuntimeFunctionType::new("ruby", "js", "ruby");

        let err = f
            .router
            .route(&function, &CallSite::new(), &Bindings::new(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::UnknownFunctionType { .. })));

        let err = f
            .router
            .route_as(&function, &py_type, &CallSite::new(), &Bindings::new(), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::NoMatch { .. })));

        let routed = f
            .router
            .route_as(&function, &js_type, &CallSite::new(), &Bindings::new(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(routed.token().attribute(RUNTIME_ATTRIBUTE), Some("js"));
        routed.release().await;
    }

    #[tokio::test]
    async fn call_site_beats_function_criteria() {
        let f = fixture();
        let function =
            Function::new("f", "script").with_criterion("zone", Interest::exact("us", true));
        let call_site = CallSite::new().with_criterion("zone", "${target}");
        let bindings: Bindings = [("target".to_string(), json!("eu"))].into_iter().collect();

        let routed = f
            .router
            .route(&function, &call_site, &bindings, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(routed.token().attribute("zone"), Some("eu"));
        routed.release().await;
    }

    #[tokio::test]
    async fn type_criteria_apply() {
        let f = fixture();
        let err = f
            .router
            .route(
                &Function::new("f", "python"),
                &CallSite::new(),
                &Bindings::new(),
                None,
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Routing(RoutingError::NoMatch { .. })));
    }

    #[tokio::test]
    async fn unknown_type_is_a_routing_error() {
        let f = fixture();
        let err = f
            .router
            .route(
                &Function::new("f", "cobol"),
                &CallSite::new(),
                &Bindings::new(),
                None,
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::Routing(RoutingError::UnknownFunctionType { .. })
        ));
    }

    #[tokio::test]
    async fn group_pins_one_token_and_opens_session() {
        let f = fixture();
        let function = Function::new("f", "script");
        let group = FunctionGroup::new();
        let cancel = CancellationToken::new();

        let mut tokens = Vec::new();
        for _ in 0..3 {
            let routed = f
                .router
                .route(&function, &CallSite::new(), &Bindings::new(), Some(&group), &cancel)
                .await
                .unwrap();
            assert!(routed.is_pinned());
            tokens.push(routed.token().clone());
            routed.release().await;
        }

        assert!(tokens.iter().all(|t| t == &tokens[0]));
        assert_eq!(f.router.pool().busy_count(), 1);
        assert_eq!(f.remote.reserved.load(Ordering::SeqCst), 1);

        group.close().await;
        assert_eq!(f.router.pool().busy_count(), 0);
        assert_eq!(f.remote.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn group_criteria_apply_to_calls() {
        let f = fixture();
        let mut criteria = SelectionCriteria::new();
        criteria.insert("zone".into(), Interest::exact("us", true));
        let group = FunctionGroup::with_criteria(criteria);

        let routed = f
            .router
            .route(
                &Function::new("f", "script"),
                &CallSite::new(),
                &Bindings::new(),
                Some(&group),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(routed.token().attribute("zone"), Some("us"));
        group.close().await;
    }

    #[tokio::test]
    async fn failed_reservation_returns_token() {
        let f = fixture();
        f.remote.fail_reserve.store(true, Ordering::SeqCst);
        let group = FunctionGroup::new();

        let err = f
            .router
            .route(
                &Function::new("f", "script"),
                &CallSite::new(),
                &Bindings::new(),
                Some(&group),
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();

        assert!(matches!(err, Error::Agent(AgentError::Communication { .. })));
        assert_eq!(f.router.pool().busy_count(), 0);
        assert!(group.pinned(false).await.is_none());
    }

    #[tokio::test]
    async fn local_functions_never_touch_the_pool() {
        let f = fixture();
        let function = Function::new("f", "script").local();
        let group = FunctionGroup::new();

        let routed = f
            .router
            .route(&function, &CallSite::new(), &Bindings::new(), Some(&group), &CancellationToken::new())
            .await
            .unwrap();
        assert!(routed.token().is_local());
        assert_eq!(f.router.pool().busy_count(), 0);
        assert_eq!(group.pinned(true).await.as_ref(), Some(routed.token()));
        group.close().await;
    }
}
