//! Function execution: route, dispatch, release.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::functions::group::FunctionGroup;
use crate::functions::model::{Bindings, CallSite, Function, HANDLER_KEY, InputMessage, OutputMessage};
use crate::functions::router::FunctionRouter;

/// Runs functions on the grid.
///
/// [`FunctionExecutor::execute`] always produces an output. Failures to
/// route or reach the worker become technical errors; errors reported by
/// the worker are passed through unchanged.
pub struct FunctionExecutor {
    router: Arc<FunctionRouter>,
}

impl FunctionExecutor {
    pub fn new(router: Arc<FunctionRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<FunctionRouter> {
        &self.router
    }

    /// Execute one call of `function` with `payload` as argument.
    pub async fn execute(
        &self,
        function: &Function,
        call_site: &CallSite,
        bindings: &Bindings,
        payload: serde_json::Value,
        group: Option<&FunctionGroup>,
        cancel: &CancellationToken,
    ) -> OutputMessage {
        match self
            .try_execute(function, call_site, bindings, payload, group, cancel)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(function = %function.name, error = %e, "Function call failed");
                OutputMessage::technical(&e)
            }
        }
    }

    async fn try_execute(
        &self,
        function: &Function,
        call_site: &CallSite,
        bindings: &Bindings,
        payload: serde_json::Value,
        group: Option<&FunctionGroup>,
        cancel: &CancellationToken,
    ) -> Result<OutputMessage, Error> {
        let function_type = self.router.types().resolve(function)?;
        let mut input = InputMessage::new(function.name.clone(), payload);
        input.properties = function_type.handler_properties(function)?;
        input
            .properties
            .insert(HANDLER_KEY.to_string(), function_type.handler(function));
        input.call_timeout = function.call_timeout;

        let routed = self
            .router
            .route_as(
                function,
                function_type.as_ref(),
                call_site,
                bindings,
                group,
                cancel,
            )
            .await?;
        let token = routed.token().clone();
        tracing::debug!(function = %function.name, token = %token.id(), agent = %token.agent().agent_id, "Dispatching call");

        let started = std::time::Instant::now();
        let result = routed.client().call(&token, input).await;
        routed.release().await;

        let output = result?;
        tracing::debug!(
            function = %function.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            failed = output.is_error(),
            "Call completed"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::agent::AgentClient;
    use crate::config::PoolConfig;
    use crate::error::AgentError;
    use crate::functions::model::{ErrorKind, HANDLER_PACKAGE_KEY};
    use crate::functions::types::{FunctionTypeRegistry, RUNTIME_ATTRIBUTE, RuntimeFunctionType};
    use crate::grid::{AgentRef, Token, TokenPool};

    /// Records inputs and answers with a canned result.
    #[derive(Default)]
    struct Recorder {
        inputs: Mutex<Vec<InputMessage>>,
        unreachable: bool,
    }

    #[async_trait]
    impl AgentClient for Recorder {
        async fn call(&self, token: &Token, input: InputMessage) -> Result<OutputMessage, AgentError> {
            if self.unreachable {
                return Err(AgentError::Communication {
                    agent_id: token.agent().agent_id.clone(),
                    reason: "connection reset".into(),
                });
            }
            let business = input.payload.get("fail").is_some();
            self.inputs.lock().push(input);
            if business {
                return Ok(OutputMessage::error(ErrorKind::Business, "rejected"));
            }
            Ok(OutputMessage::ok(json!({"ok": true})))
        }

        async fn reserve_session(&self, _token: &Token) -> Result<(), AgentError> {
            Ok(())
        }

        async fn release_session(&self, _token: &Token) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn executor(remote: Arc<Recorder>) -> FunctionExecutor {
        let pool = Arc::new(TokenPool::new(PoolConfig {
            no_match_timeout: Duration::from_millis(20),
            ..PoolConfig::default()
        }));
        let attrs: BTreeMap<String, String> =
            [(RUNTIME_ATTRIBUTE.to_string(), "js".to_string())].into_iter().collect();
        pool.register(AgentRef::new("agent-1", ""), attrs);

        let types = Arc::new(FunctionTypeRegistry::new());
        types.register(Arc::new(RuntimeFunctionType::new("script", "js", "script-handler")));
        let router = FunctionRouter::new(pool, types, remote, Arc::new(Recorder::default()));
        FunctionExecutor::new(Arc::new(router))
    }

    async fn run(
        executor: &FunctionExecutor,
        function: &Function,
        payload: serde_json::Value,
    ) -> OutputMessage {
        executor
            .execute(
                function,
                &CallSite::new(),
                &Bindings::new(),
                payload,
                None,
                &CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn successful_call_sets_handler_and_releases() {
        let remote = Arc::new(Recorder::default());
        let executor = executor(remote.clone());
        let function = Function::new("Login", "script").with_call_timeout(Duration::from_secs(3));

        let output = run(&executor, &function, json!({"user": "a"})).await;

        assert!(!output.is_error());
        assert_eq!(output.payload["ok"], true);
        assert_eq!(executor.router().pool().busy_count(), 0);

        let inputs = remote.inputs.lock();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].function, "Login");
        assert_eq!(inputs[0].properties[HANDLER_KEY], "script-handler");
        assert_eq!(inputs[0].call_timeout, Some(Duration::from_secs(3)));
        assert!(!inputs[0].properties.contains_key(&format!("{HANDLER_PACKAGE_KEY}.id")));
    }

    #[tokio::test]
    async fn routing_failure_is_technical() {
        let executor = executor(Arc::new(Recorder::default()));
        let function = Function::new("Login", "script")
            .with_criterion("zone", crate::grid::Interest::exact("mars", true));

        let output = run(&executor, &function, json!({})).await;

        let error = output.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Technical);
        assert!(error.message.contains("No registered token matches"));
    }

    #[tokio::test]
    async fn unreachable_agent_is_technical_and_releases() {
        let executor = executor(Arc::new(Recorder {
            unreachable: true,
            ..Recorder::default()
        }));

        let output = run(&executor, &Function::new("Login", "script"), json!({})).await;

        assert_eq!(output.error.unwrap().kind, ErrorKind::Technical);
        assert_eq!(executor.router().pool().busy_count(), 0);
    }

    #[tokio::test]
    async fn business_errors_pass_through() {
        let executor = executor(Arc::new(Recorder::default()));
        let output = run(&executor, &Function::new("Login", "script"), json!({"fail": 1})).await;

        let error = output.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Business);
        assert_eq!(error.message, "rejected");
        assert!(output.attachments.is_empty());
    }

    #[tokio::test]
    async fn unknown_type_is_technical() {
        let executor = executor(Arc::new(Recorder::default()));
        let output = run(&executor, &Function::new("Login", "cobol"), json!({})).await;
        assert!(output.error.unwrap().message.contains("Unknown function type"));
    }
}
