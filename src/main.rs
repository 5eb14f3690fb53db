use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use grid_fabric::agent::{Agent, ECHO_HANDLER, HandlerRegistry, InProcessTransport};
use grid_fabric::config::GridConfig;
use grid_fabric::files::{FileManagerClient, FileServer};
use grid_fabric::functions::types::RUNTIME_ATTRIBUTE;
use grid_fabric::functions::{
    Bindings, CallSite, Function, FunctionExecutor, FunctionGroup, FunctionRouter,
    FunctionTypeRegistry, RuntimeFunctionType,
};
use grid_fabric::grid::{TokenPool, spawn_keepalive_sweep};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut config = GridConfig::from_env()?;
    config
        .agent
        .attributes
        .entry(RUNTIME_ATTRIBUTE.to_string())
        .or_insert_with(|| "echo".to_string());

    eprintln!("Grid fabric v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   File cache: {}", config.files.cache_dir.display());
    eprintln!(
        "   Agent: {} ({} tokens)",
        config.agent.agent_id, config.agent.token_count
    );

    // ── Pool and file distribution ──────────────────────────────────────
    let pool = Arc::new(TokenPool::new(config.pool.clone()));
    let sweep = spawn_keepalive_sweep(Arc::clone(&pool));
    let file_server = Arc::new(FileServer::new());
    let files = Arc::new(FileManagerClient::new(
        config.files.cache_dir.clone(),
        file_server.clone(),
    ));

    // ── Agents ──────────────────────────────────────────────────────────
    let handlers = Arc::new(HandlerRegistry::with_builtins());
    let worker = Arc::new(
        Agent::new(
            config.agent.agent_id.clone(),
            config.agent.clone(),
            Arc::clone(&handlers),
        )
            .with_files(Arc::clone(&files)),
    );
    worker.offer_tokens(&pool);

    let transport = Arc::new(InProcessTransport::new());
    transport.connect(Arc::clone(&worker));
    let local = Arc::new(InProcessTransport::new());
    local.connect(Arc::new(
        Agent::local(config.agent.clone(), handlers).with_files(files),
    ));

    // ── Functions ───────────────────────────────────────────────────────
    let types = Arc::new(FunctionTypeRegistry::new());
    types.register(Arc::new(
        RuntimeFunctionType::new("echo", "echo", ECHO_HANDLER).with_file_server(file_server),
    ));
    let router = Arc::new(FunctionRouter::new(
        Arc::clone(&pool),
        types,
        transport,
        local,
    ));
    let executor = FunctionExecutor::new(router);

    let cancel = CancellationToken::new();
    let function = Function::new("Greet", "echo");
    let call_site = CallSite::new();
    let bindings = Bindings::new();

    // Unpinned calls spread over the agent's tokens.
    let calls = (0..config.agent.token_count.max(1)).map(|i| {
        executor.execute(
            &function,
            &call_site,
            &bindings,
            json!({ "call": i }),
            None,
            &cancel,
        )
    });
    for output in join_all(calls).await {
        match output.error {
            Some(error) => tracing::warn!(message = %error.message, "Call failed"),
            None => tracing::info!(payload = %output.payload, "Call completed"),
        }
    }

    // A group pins one token for all of its calls.
    let group = FunctionGroup::new();
    for i in 0..2 {
        let output = executor
            .execute(
                &function,
                &call_site,
                &bindings,
                json!({ "grouped": i }),
                Some(&group),
                &cancel,
            )
            .await;
        tracing::info!(
            payload = %output.payload,
            failed = output.is_error(),
            "Grouped call completed"
        );
    }
    group.close().await;

    worker.withdraw_tokens(&pool);
    sweep.abort();
    tracing::info!(busy = pool.busy_count(), size = pool.size(), "Grid shut down");
    Ok(())
}
